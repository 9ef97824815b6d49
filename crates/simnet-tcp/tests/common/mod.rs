//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use simnet_tcp::{Connection, ConnectionId, DataCallback};

/// Installs a test-writer subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Polls `condition` every 10ms until it holds or `timeout` elapses.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Every delivery seen by a data callback, with the identifier of its connection.
#[derive(Debug, Default)]
pub struct Deliveries {
    pub chunks: Vec<Vec<u8>>,
    pub connections: Vec<ConnectionId>,
}

impl Deliveries {
    pub fn count(&self) -> usize {
        self.chunks.len()
    }

    pub fn concatenated(&self) -> Vec<u8> {
        self.chunks.concat()
    }
}

/// Data callback consuming whole `frame`-byte frames and recording them.
pub fn framed_recorder(frame: usize) -> (DataCallback, Arc<Mutex<Deliveries>>) {
    let deliveries = Arc::new(Mutex::new(Deliveries::default()));
    let seen = Arc::clone(&deliveries);
    let callback: DataCallback = Arc::new(move |conn: &Arc<Connection>, data: &[u8]| {
        let used = data.len() - data.len() % frame;
        if used > 0 {
            let mut seen = seen.lock();
            seen.chunks.push(data[..used].to_vec());
            seen.connections.push(conn.identifier());
        }
        used
    });
    (callback, deliveries)
}
