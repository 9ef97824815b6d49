//! Event loop ownership.
//!
//! Every socket, connection and acceptor is driven by a tokio runtime
//! [`Handle`] supplied by the caller. [`IoContext`] is a convenience owner for
//! such a runtime: one worker thread named after the context, plus a
//! process-wide registry of named contexts.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime, RuntimeFlavor};
use tracing::{debug, info};

use simnet_core::{NetworkError, NetworkResult};

static CONTEXTS: LazyLock<Mutex<HashMap<String, Arc<IoContext>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// An owned event loop.
pub struct IoContext {
    name: String,
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
}

impl std::fmt::Debug for IoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoContext")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

impl IoContext {
    /// Starts a new event loop with a single worker thread.
    pub fn new(name: impl Into<String>) -> NetworkResult<Arc<Self>> {
        let name = name.into();
        let thread_name = if name.is_empty() {
            "simnet-io".to_string()
        } else {
            name.clone()
        };
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(thread_name)
            .enable_all()
            .build()
            .map_err(|e| NetworkError::Io(format!("failed to start event loop {name}: {e}")))?;
        debug!("Started event loop {}", name);
        Ok(Arc::new(Self {
            name,
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
        }))
    }

    /// Returns the process-wide context registered under `name`, creating it
    /// on first use.
    pub fn shared(name: &str) -> NetworkResult<Arc<Self>> {
        let mut contexts = CONTEXTS.lock();
        if let Some(existing) = contexts.get(name) {
            return Ok(Arc::clone(existing));
        }
        let context = Self::new(name)?;
        contexts.insert(name.to_string(), Arc::clone(&context));
        Ok(context)
    }

    /// Drops the registry entry for `name`; the loop keeps running while
    /// other owners hold it.
    pub fn release(name: &str) -> Option<Arc<Self>> {
        CONTEXTS.lock().remove(name)
    }

    /// Context name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle used to inject this loop into sockets and connections.
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// True until [`IoContext::close`] is called.
    pub fn is_running(&self) -> bool {
        self.runtime.lock().is_some()
    }

    /// Stops the loop, abandoning any task still pending.
    ///
    /// Must not be called from a thread driven by this loop.
    pub fn close(&self) {
        if let Some(runtime) = self.runtime.lock().take() {
            info!("Stopping event loop {}", self.name);
            runtime.shutdown_timeout(Duration::from_millis(500));
        }
    }
}

impl Drop for IoContext {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

/// Runs `future` to completion on `handle` from synchronous code.
///
/// Inside a multi-thread runtime the calling worker is handed over with
/// `block_in_place`. Inside a current-thread runtime blocking would stall the
/// loop the future depends on, so the call fails with `WouldBlock`.
pub(crate) fn block_on<F: Future>(handle: &Handle, future: F) -> io::Result<F::Output> {
    match Handle::try_current() {
        Ok(current) if current.runtime_flavor() == RuntimeFlavor::CurrentThread => {
            Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "blocking network call issued on a current-thread event loop",
            ))
        }
        Ok(_) => Ok(tokio::task::block_in_place(|| handle.block_on(future))),
        Err(_) => Ok(handle.block_on(future)),
    }
}
