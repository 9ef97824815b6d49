//! Multi-endpoint TCP listener.
//!
//! A [`TcpServer`] owns one [`Acceptor`] per resolved local endpoint and the
//! pool of connections they produced. An accepted connection joins the pool
//! and its acceptor is re-armed before the security handshake runs, so a
//! stalled peer neither blocks further accepts nor escapes
//! [`TcpServer::close`]. Once the handshake succeeds the server's callbacks
//! are installed and the receive loop starts. Connections whose receive loop
//! has halted are dropped from the pool on the next accept.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use simnet_tcp::{Connection, IoContext, TcpServerBuilder};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let context = IoContext::new("server")?;
//! let server = TcpServerBuilder::new()
//!     .address("localhost")
//!     .port(24160)
//!     .build(&context.handle())?;
//! server.set_data_call(Arc::new(|_conn: &Arc<Connection>, data: &[u8]| data.len()))?;
//! server.start();
//! // ...
//! server.close();
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tracing::debug;

use simnet_core::address::{service_port, strip_protocol};
use simnet_core::{ConnectionId, ConnectionState, LogSink, Logger, NetworkError, NetworkResult};

use crate::acceptor::Acceptor;
use crate::connection::{Connection, DEFAULT_BUFFER_SIZE, DataCallback, ErrorCallback};
use crate::factory::SocketFactory;

const RECONNECT_TIMEOUT: Duration = Duration::from_millis(1000);
const REBUILD_PAUSE: Duration = Duration::from_millis(200);

/// Listener configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpServerConfig {
    /// Interface to bind: a host name, an IPv4 address, `"localhost"` or `"*"`.
    pub address: String,
    /// Port number or service string.
    pub port: String,
    /// Sets `SO_REUSEADDR` on every acceptor.
    pub reuse_address: bool,
    /// Initial receive buffer size of accepted connections.
    pub buffer_size: usize,
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        Self {
            address: "localhost".to_string(),
            port: "0".to_string(),
            reuse_address: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Builder for [`TcpServer`].
#[derive(Default)]
pub struct TcpServerBuilder {
    config: TcpServerConfig,
    factory: SocketFactory,
    sink: Option<LogSink>,
}

impl fmt::Debug for TcpServerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpServerBuilder")
            .field("config", &self.config)
            .field("factory", &self.factory)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

impl TcpServerBuilder {
    /// Create a new builder with the default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the interface to bind
    #[must_use]
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.config.address = address.into();
        self
    }

    /// Set a numeric port
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port.to_string();
        self
    }

    /// Set the port as a service string
    #[must_use]
    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.config.port = service.into();
        self
    }

    /// Enable or disable address reuse
    #[must_use]
    pub const fn reuse_address(mut self, reuse: bool) -> Self {
        self.config.reuse_address = reuse;
        self
    }

    /// Set the initial receive buffer size
    #[must_use]
    pub const fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    /// Set the socket factory used for accepted connections
    #[must_use]
    pub fn factory(mut self, factory: SocketFactory) -> Self {
        self.factory = factory;
        self
    }

    /// Set the log sink, installed before any acceptor binds
    #[must_use]
    pub fn logging_function(mut self, sink: LogSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Resolve the endpoints and bind them
    pub fn build(self, handle: &Handle) -> NetworkResult<Arc<TcpServer>> {
        let endpoints = resolve_endpoints(&self.config.address, &self.config.port)?;
        Ok(TcpServer::assemble(
            self.factory,
            handle,
            endpoints,
            self.config.reuse_address,
            self.config.buffer_size,
            self.sink,
        ))
    }
}

fn resolve_endpoints(address: &str, service: &str) -> NetworkResult<Vec<SocketAddr>> {
    let port = service_port(service).ok_or_else(|| {
        NetworkError::Resolution(format!(
            "unknown port or service '{service}': expected a number or a well-known service name"
        ))
    })?;
    match address {
        "*" | "tcp://*" => return Ok(vec![SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))]),
        "localhost" => return Ok(vec![SocketAddr::from((Ipv4Addr::LOCALHOST, port))]),
        _ => {}
    }
    let host = strip_protocol(address);
    let resolved = (host.as_str(), port)
        .to_socket_addrs()
        .map_err(|e| NetworkError::Resolution(format!("unable to resolve {host}: {e}")))?;
    let mut seen = HashSet::new();
    Ok(resolved
        .filter(SocketAddr::is_ipv4)
        .filter(|endpoint| seen.insert(*endpoint))
        .collect())
}

#[derive(Clone, Default)]
struct ServerCallbacks {
    data: Option<DataCallback>,
    error: Option<ErrorCallback>,
    sink: Option<LogSink>,
}

impl ServerCallbacks {
    fn logger(&self) -> Logger {
        self.sink.clone().map(Logger::with_sink).unwrap_or_default()
    }
}

/// Listener servicing one or more local endpoints.
pub struct TcpServer {
    handle: Handle,
    factory: SocketFactory,
    endpoints: Vec<SocketAddr>,
    acceptors: Mutex<Vec<Arc<Acceptor>>>,
    connections: Mutex<Vec<Arc<Connection>>>,
    halted: AtomicBool,
    started: AtomicBool,
    reuse_address: AtomicBool,
    buffer_size: usize,
    callbacks: RwLock<ServerCallbacks>,
    self_ref: Weak<TcpServer>,
}

impl fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpServer")
            .field("endpoints", &self.endpoints)
            .field("halted", &self.halted.load(Ordering::Relaxed))
            .field("acceptors", &self.acceptors.lock().len())
            .field("connections", &self.connections.lock().len())
            .finish()
    }
}

impl TcpServer {
    /// Listener on `address` and a numeric port.
    ///
    /// `"*"` binds the IPv4 wildcard and `"localhost"` the IPv4 loopback;
    /// other names are resolved to every IPv4 address they map to.
    pub fn new(
        factory: SocketFactory,
        handle: &Handle,
        address: &str,
        port: u16,
        reuse_address: bool,
        buffer_size: usize,
    ) -> NetworkResult<Arc<Self>> {
        Self::with_service(
            factory,
            handle,
            address,
            &port.to_string(),
            reuse_address,
            buffer_size,
        )
    }

    /// Listener on `address` and a port given as a service string.
    pub fn with_service(
        factory: SocketFactory,
        handle: &Handle,
        address: &str,
        service: &str,
        reuse_address: bool,
        buffer_size: usize,
    ) -> NetworkResult<Arc<Self>> {
        let endpoints = resolve_endpoints(address, service)?;
        Ok(Self::assemble(
            factory,
            handle,
            endpoints,
            reuse_address,
            buffer_size,
            None,
        ))
    }

    /// Listener on the IPv4 wildcard address.
    pub fn on_port(
        factory: SocketFactory,
        handle: &Handle,
        port: u16,
        buffer_size: usize,
    ) -> Arc<Self> {
        Self::assemble(
            factory,
            handle,
            vec![SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))],
            false,
            buffer_size,
            None,
        )
    }

    /// Listener described by `config`.
    pub fn from_config(
        factory: SocketFactory,
        handle: &Handle,
        config: &TcpServerConfig,
    ) -> NetworkResult<Arc<Self>> {
        Self::with_service(
            factory,
            handle,
            &config.address,
            &config.port,
            config.reuse_address,
            config.buffer_size,
        )
    }

    fn assemble(
        factory: SocketFactory,
        handle: &Handle,
        endpoints: Vec<SocketAddr>,
        reuse_address: bool,
        buffer_size: usize,
        sink: Option<LogSink>,
    ) -> Arc<Self> {
        let halted = endpoints.is_empty();
        let server = Arc::new_cyclic(|self_ref| Self {
            handle: handle.clone(),
            factory,
            endpoints,
            acceptors: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
            halted: AtomicBool::new(halted),
            started: AtomicBool::new(false),
            reuse_address: AtomicBool::new(reuse_address),
            buffer_size,
            callbacks: RwLock::new(ServerCallbacks {
                sink,
                ..ServerCallbacks::default()
            }),
            self_ref: self_ref.clone(),
        });
        if halted {
            debug!("No endpoints resolved; server starts halted");
        } else {
            server.initial_connect();
        }
        server
    }

    fn logger(&self) -> Logger {
        self.callbacks.read().logger()
    }

    fn ensure_not_started(&self, what: &str) -> NetworkResult<()> {
        if self.started.load(Ordering::Acquire) {
            Err(NetworkError::invalid_state(format!(
                "cannot set {what} after the server is started"
            )))
        } else {
            Ok(())
        }
    }

    fn build_acceptor(&self, endpoint: SocketAddr) -> NetworkResult<Arc<Acceptor>> {
        let acceptor = Acceptor::create(&self.handle, endpoint)?;
        acceptor.set_reuse_address(self.reuse_address.load(Ordering::Acquire))?;
        let server = self.self_ref.clone();
        acceptor.set_accept_call(Arc::new(move |acc: &Arc<Acceptor>, conn: Arc<Connection>| {
            match server.upgrade() {
                Some(server) => server.handle_accept(acc, conn),
                None => conn.close(),
            }
        }));
        acceptor.replace_logger(self.logger());
        Ok(acceptor)
    }

    fn initial_connect(&self) {
        let logger = self.logger();
        if self.halted.load(Ordering::Acquire) {
            logger.error("previously halted server");
            return;
        }

        let mut acceptors = self.acceptors.lock();
        for endpoint in &self.endpoints {
            match self.build_acceptor(*endpoint) {
                Ok(acceptor) => acceptors.push(acceptor),
                Err(e) => logger.error(&format!("unable to create acceptor for {endpoint}: {e}")),
            }
        }

        let total = acceptors.len();
        let mut connected = 0;
        for (index, acceptor) in acceptors.iter().enumerate() {
            if acceptor.connect() {
                connected += 1;
            } else {
                logger.error(&format!(
                    "unable to connect acceptor {} of {}",
                    index + 1,
                    total
                ));
            }
        }
        if connected == 0 {
            self.halted.store(true, Ordering::Release);
            logger.info("halting server operation");
        } else if connected < total {
            logger.info(&format!(
                "partial connection on the server {connected} of {total} were connected"
            ));
        }
    }

    /// Retries binding every unbound acceptor for up to `timeout` each.
    ///
    /// The server is healthy again if at least one acceptor is bound.
    pub fn re_connect(&self, timeout: Duration) -> bool {
        let logger = self.logger();
        let acceptors = self.acceptors.lock().clone();
        let mut any_connected = false;
        let mut any_failed = false;
        for acceptor in &acceptors {
            if !acceptor.is_connected() && !acceptor.connect_timeout(timeout) {
                if any_connected {
                    logger.error(&format!("unable to connect all acceptors on {acceptor}"));
                } else {
                    logger.error(&format!("unable to connect on {acceptor}"));
                }
                any_failed = true;
                continue;
            }
            any_connected = true;
        }
        if any_failed && any_connected {
            logger.error("partial connection on acceptor");
        }
        self.halted.store(!any_connected, Ordering::Release);
        any_connected
    }

    /// Binds (or rebinds) the endpoints and arms one accept per acceptor.
    ///
    /// Returns true only if every acceptor started accepting.
    pub fn start(&self) -> bool {
        self.started.store(true, Ordering::Release);
        let logger = self.logger();

        if self.halted.load(Ordering::Acquire) && !self.re_connect(RECONNECT_TIMEOUT) {
            logger.error("reconnect failed");
            self.acceptors.lock().clear();
            std::thread::sleep(REBUILD_PAUSE);
            self.halted.store(false, Ordering::Release);
            self.initial_connect();
            if self.halted.load(Ordering::Acquire) && !self.re_connect(RECONNECT_TIMEOUT) {
                logger.error("reconnect part 2 failed");
                return false;
            }
        }

        {
            let connections = self.connections.lock();
            // connections still in their handshake start receiving once it completes
            for connection in connections
                .iter()
                .filter(|c| !c.is_receiving() && c.state() != ConnectionState::NotStarted)
            {
                connection.start_receive();
            }
        }

        let acceptors = self.acceptors.lock().clone();
        let mut success = true;
        for acceptor in &acceptors {
            let started = match Connection::create(&self.factory, &self.handle, self.buffer_size) {
                Ok(connection) => acceptor.start(connection),
                Err(e) => {
                    logger.error(&format!("unable to create connection: {e}"));
                    false
                }
            };
            if !started {
                logger.error("acceptor has failed to start");
                success = false;
            }
        }
        success
    }

    fn handle_accept(&self, acceptor: &Arc<Acceptor>, connection: Arc<Connection>) {
        let callbacks = self.callbacks.read().clone();
        let logger = callbacks.logger();

        if let Err(e) = connection.socket().set_option_linger(false, 0) {
            logger.info(&format!("unable to set linger: {e}"));
        }
        if let Err(e) = connection.socket().set_option_no_delay(true) {
            logger.info(&format!("unable to set no-delay: {e}"));
        }

        // pooled before the handshake so close() can abort a stalled one
        let finished = {
            let mut connections = self.connections.lock();
            if self.halted.load(Ordering::Acquire) {
                drop(connections);
                connection.close();
                return;
            }
            let (finished, live): (Vec<_>, Vec<_>) =
                std::mem::take(&mut *connections).into_iter().partition(|pooled| {
                    matches!(
                        pooled.state(),
                        ConnectionState::Halted | ConnectionState::Closed
                    )
                });
            *connections = live;
            connections.push(Arc::clone(&connection));
            finished
        };
        for stale in &finished {
            stale.close();
        }

        self.re_arm(acceptor, &logger);

        let prepared = connection
            .set_handshake_mode_server()
            .and_then(|()| connection.handshake().map_err(NetworkError::from));
        match prepared {
            Ok(()) => {
                if let Some(data) = callbacks.data {
                    let _ = connection.set_data_call(data);
                }
                if let Some(error) = callbacks.error {
                    let _ = connection.set_error_call(error);
                }
                if let Some(sink) = callbacks.sink {
                    let _ = connection.set_logging_function(sink);
                }
                // a no-op if close() already claimed the connection
                connection.start_receive();
            }
            Err(e) => {
                self.connections
                    .lock()
                    .retain(|pooled| !Arc::ptr_eq(pooled, &connection));
                if !self.halted.load(Ordering::Acquire) {
                    logger.error(&format!("handshake failed on {acceptor}: {e}"));
                }
                connection.close();
            }
        }
    }

    fn re_arm(&self, acceptor: &Arc<Acceptor>, logger: &Logger) {
        match Connection::create(&self.factory, &self.handle, self.buffer_size) {
            Ok(next) => {
                acceptor.start(next);
            }
            Err(e) => logger.error(&format!("unable to re-arm {acceptor}: {e}")),
        }
    }

    /// Looks up a pooled connection by identifier.
    ///
    /// A connection whose peer went away stays findable, in the halted
    /// state, until the next accept prunes it or the server closes.
    pub fn find_socket(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections
            .lock()
            .iter()
            .find(|connection| connection.identifier() == id)
            .cloned()
    }

    /// Stops accepting and closes every pooled connection.
    ///
    /// Blocks until every connection has completed its close rendezvous.
    /// Acceptors are kept so a later [`TcpServer::start`] can rebind them.
    pub fn close(&self) {
        self.halted.store(true, Ordering::Release);

        let acceptors = self.acceptors.lock().clone();
        if acceptors.len() > 1 {
            for acceptor in &acceptors {
                acceptor.cancel();
            }
        }
        for acceptor in &acceptors {
            acceptor.close();
        }

        let connections = std::mem::take(&mut *self.connections.lock());
        for connection in &connections {
            connection.close_no_wait();
        }
        for connection in &connections {
            connection.wait_on_close();
        }
    }

    /// True while the server is not halted.
    pub fn is_ready(&self) -> bool {
        !self.halted.load(Ordering::Acquire)
    }

    /// Sets address reuse for acceptors bound from now on.
    pub fn set_port_reuse(&self, reuse: bool) {
        self.reuse_address.store(reuse, Ordering::Release);
        for acceptor in self.acceptors.lock().iter() {
            if let Err(e) = acceptor.set_reuse_address(reuse) {
                debug!("Failed to update address reuse on {}: {}", acceptor, e);
            }
        }
    }

    /// Installs the data callback for accepted connections.
    pub fn set_data_call(&self, callback: DataCallback) -> NetworkResult<()> {
        self.ensure_not_started("data callback")?;
        self.callbacks.write().data = Some(callback);
        Ok(())
    }

    /// Installs the error callback for accepted connections.
    pub fn set_error_call(&self, callback: ErrorCallback) -> NetworkResult<()> {
        self.ensure_not_started("error callback")?;
        self.callbacks.write().error = Some(callback);
        Ok(())
    }

    /// Installs the log sink for the server, its acceptors and its connections.
    pub fn set_logging_function(&self, sink: LogSink) -> NetworkResult<()> {
        self.ensure_not_started("logging function")?;
        let logger = Logger::with_sink(Arc::clone(&sink));
        self.callbacks.write().sink = Some(sink);
        for acceptor in self.acceptors.lock().iter() {
            acceptor.replace_logger(logger.clone());
        }
        Ok(())
    }

    /// Endpoints the acceptors are bound to, with ephemeral ports resolved.
    pub fn local_endpoints(&self) -> Vec<SocketAddr> {
        self.acceptors
            .lock()
            .iter()
            .filter_map(|acceptor| acceptor.local_addr())
            .collect()
    }

    /// Number of pooled connections, including halted ones not yet pruned
    /// and accepted ones still in their handshake.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::IoContext;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_config_default() {
        let config = TcpServerConfig::default();
        assert_eq!(config.address, "localhost");
        assert_eq!(config.port, "0");
        assert!(!config.reuse_address);
        assert_eq!(config.buffer_size, 10192);
    }

    #[test]
    fn test_resolve_special_addresses() {
        assert_eq!(
            resolve_endpoints("*", "80").unwrap(),
            vec![SocketAddr::from(([0, 0, 0, 0], 80))]
        );
        assert_eq!(
            resolve_endpoints("tcp://*", "81").unwrap(),
            vec![SocketAddr::from(([0, 0, 0, 0], 81))]
        );
        assert_eq!(
            resolve_endpoints("localhost", "82").unwrap(),
            vec![SocketAddr::from(([127, 0, 0, 1], 82))]
        );
        assert_eq!(
            resolve_endpoints("tcp://127.0.0.1", "83").unwrap(),
            vec![SocketAddr::from(([127, 0, 0, 1], 83))]
        );
        assert_eq!(
            resolve_endpoints("localhost", "http").unwrap(),
            vec![SocketAddr::from(([127, 0, 0, 1], 80))]
        );
    }

    #[test]
    fn test_resolve_rejects_bad_input() {
        assert!(matches!(
            resolve_endpoints("localhost", "no-such-service"),
            Err(NetworkError::Resolution(_))
        ));
        assert!(matches!(
            resolve_endpoints("invalid host name", "0"),
            Err(NetworkError::Resolution(_))
        ));
    }

    #[test]
    fn test_localhost_server_binds() {
        let ctx = IoContext::new("server-localhost").unwrap();
        let server = TcpServerBuilder::new()
            .address("localhost")
            .service("0")
            .build(&ctx.handle())
            .unwrap();
        assert!(server.is_ready());
        let endpoints = server.local_endpoints();
        assert_eq!(endpoints.len(), 1);
        assert!(endpoints[0].ip().is_loopback());
        assert_ne!(endpoints[0].port(), 0);
        server.close();
        assert!(!server.is_ready());
    }

    #[test]
    fn test_setters_rejected_after_start() {
        let ctx = IoContext::new("server-setters").unwrap();
        let server =
            TcpServer::new(SocketFactory::new(), &ctx.handle(), "localhost", 0, false, 256).unwrap();
        server.set_logging_function(Arc::new(|_, _: &str| {})).unwrap();
        assert!(server.start());

        assert!(
            server
                .set_data_call(Arc::new(|_: &Arc<Connection>, data: &[u8]| data.len()))
                .unwrap_err()
                .is_invalid_state()
        );
        assert!(
            server
                .set_logging_function(Arc::new(|_, _: &str| {}))
                .unwrap_err()
                .is_invalid_state()
        );
        server.close();
    }

    #[test]
    fn test_second_start_fails_while_accepting() {
        let ctx = IoContext::new("server-double-start").unwrap();
        let server = TcpServer::on_port(SocketFactory::new(), &ctx.handle(), 0, 256);
        assert!(server.start());
        assert!(!server.start());
        assert_eq!(server.connection_count(), 0);
        server.close();
    }

    fn loopback(port: u16) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, port))
    }

    #[test]
    fn test_no_endpoints_starts_halted() {
        let ctx = IoContext::new("server-empty").unwrap();
        let server = TcpServer::assemble(
            SocketFactory::new(),
            &ctx.handle(),
            Vec::new(),
            false,
            256,
            None,
        );
        assert!(!server.is_ready());
        assert!(server.local_endpoints().is_empty());
        assert!(!server.re_connect(Duration::from_millis(100)));
        assert!(!server.start());
        assert!(!server.is_ready());
    }

    #[test]
    fn test_re_connect_healthy_with_partial_binding() {
        let ctx = IoContext::new("server-partial").unwrap();
        let holder = std::net::TcpListener::bind(loopback(0)).unwrap();
        let held = holder.local_addr().unwrap();

        let server = TcpServer::assemble(
            SocketFactory::new(),
            &ctx.handle(),
            vec![loopback(0), held],
            false,
            256,
            None,
        );
        assert!(server.is_ready());
        assert_eq!(server.local_endpoints().len(), 1);

        assert!(server.re_connect(Duration::from_millis(300)));
        assert!(server.is_ready());
        assert_eq!(server.local_endpoints().len(), 1);

        drop(holder);
        assert!(server.re_connect(Duration::from_secs(2)));
        assert!(server.local_endpoints().contains(&held));
        server.close();
    }

    #[test]
    fn test_accept_after_halt_never_reaches_pool() {
        let ctx = IoContext::new("server-halt-race").unwrap();
        let server = TcpServer::assemble(
            SocketFactory::new(),
            &ctx.handle(),
            vec![loopback(0)],
            false,
            256,
            None,
        );
        let acceptor = Arc::clone(&server.acceptors.lock()[0]);
        server.halted.store(true, Ordering::Release);

        let late = Connection::create(&SocketFactory::new(), &ctx.handle(), 256).unwrap();
        server.handle_accept(&acceptor, Arc::clone(&late));

        assert_eq!(server.connection_count(), 0);
        assert_eq!(late.state(), ConnectionState::Closed);
        assert!(!acceptor.is_accepting());
        server.close();
    }
}
