//! Single-endpoint acceptor.
//!
//! An [`Acceptor`] binds one local endpoint and keeps at most one accept
//! outstanding. Each accept targets the socket of a caller-supplied
//! [`Connection`]; on success the connection is handed to the accept
//! callback, which is expected to arm the next accept.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpSocket};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use simnet_core::{
    AcceptorState, LogSink, Logger, NetworkError, NetworkResult, StateCell, TriggerVariable,
    is_operation_aborted,
};

use crate::connection::Connection;
use crate::socket::AcceptHandle;

const BIND_RETRY_INTERVAL: Duration = Duration::from_millis(200);
const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(200);
const LISTEN_BACKLOG: u32 = 1024;

/// Receives each accepted connection; responsible for arming the next accept.
pub type AcceptCallback = Arc<dyn Fn(&Arc<Acceptor>, Arc<Connection>) + Send + Sync>;

/// Notified of accept failures other than cancellation.
pub type AcceptErrorCallback = Arc<dyn Fn(&Arc<Acceptor>, &io::Error) + Send + Sync>;

#[derive(Clone, Default)]
struct AcceptorCallbacks {
    accept: Option<AcceptCallback>,
    error: Option<AcceptErrorCallback>,
    logger: Logger,
}

/// Binds one endpoint and services inbound connections one at a time.
pub struct Acceptor {
    endpoint: SocketAddr,
    handle: Handle,
    socket: Mutex<Option<TcpSocket>>,
    listener: Mutex<Option<Arc<TcpListener>>>,
    reuse_address: AtomicBool,
    cancel: Mutex<CancellationToken>,
    state: StateCell<AcceptorState>,
    accepting: TriggerVariable,
    callbacks: RwLock<AcceptorCallbacks>,
    self_ref: Weak<Acceptor>,
}

impl fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acceptor")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state.load())
            .field("accepting", &self.accepting.is_active())
            .finish()
    }
}

impl fmt::Display for Acceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.endpoint.ip(), self.endpoint.port())
    }
}

impl Acceptor {
    /// Opens a socket for `endpoint`; the acceptor starts in the opened state.
    pub fn create(handle: &Handle, endpoint: SocketAddr) -> NetworkResult<Arc<Self>> {
        let socket = open_socket(endpoint, false).map_err(|e| {
            NetworkError::ConnectionFailed(format!("unable to open acceptor for {endpoint}: {e}"))
        })?;
        Ok(Arc::new_cyclic(|self_ref| Self {
            endpoint,
            handle: handle.clone(),
            socket: Mutex::new(Some(socket)),
            listener: Mutex::new(None),
            reuse_address: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
            state: StateCell::new(AcceptorState::Opened),
            accepting: TriggerVariable::new(),
            callbacks: RwLock::new(AcceptorCallbacks::default()),
            self_ref: self_ref.clone(),
        }))
    }

    fn logger(&self) -> Logger {
        self.callbacks.read().logger.clone()
    }

    /// Installs the accept callback.
    pub fn set_accept_call(&self, callback: AcceptCallback) {
        self.callbacks.write().accept = Some(callback);
    }

    /// Installs the accept error callback.
    pub fn set_error_call(&self, callback: AcceptErrorCallback) {
        self.callbacks.write().error = Some(callback);
    }

    /// Installs the log sink; fails once the acceptor has been bound.
    pub fn set_logging_function(&self, sink: LogSink) -> NetworkResult<()> {
        if self.state.load() != AcceptorState::Opened {
            return Err(NetworkError::invalid_state(
                "cannot set logging function after the acceptor is started",
            ));
        }
        self.replace_logger(Logger::with_sink(sink));
        Ok(())
    }

    pub(crate) fn replace_logger(&self, logger: Logger) {
        self.callbacks.write().logger = logger;
    }

    /// Sets `SO_REUSEADDR` for the current and any reopened socket.
    pub fn set_reuse_address(&self, reuse: bool) -> io::Result<()> {
        self.reuse_address.store(reuse, Ordering::Release);
        match self.socket.lock().as_ref() {
            Some(socket) => socket.set_reuseaddr(reuse),
            None => Ok(()),
        }
    }

    fn bind(&self) -> io::Result<()> {
        let mut slot = self.socket.lock();
        if slot.is_none() {
            *slot = Some(open_socket(
                self.endpoint,
                self.reuse_address.load(Ordering::Acquire),
            )?);
        }
        match slot.as_ref() {
            Some(socket) => socket.bind(self.endpoint),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    /// Single bind attempt.
    pub fn connect(&self) -> bool {
        if self
            .state
            .transition(AcceptorState::Opened, AcceptorState::Connecting)
        {
            return match self.bind() {
                Ok(()) => {
                    self.state.store(AcceptorState::Connected);
                    true
                }
                Err(e) => {
                    self.state.store(AcceptorState::Opened);
                    self.logger().error(&format!("acceptor error {e}"));
                    false
                }
            };
        }
        self.state.load() == AcceptorState::Connected
    }

    /// Retries binding every 200ms until it succeeds or `timeout` elapses.
    ///
    /// A halted or closed acceptor is reopened first.
    pub fn connect_timeout(&self, timeout: Duration) -> bool {
        if matches!(
            self.state.load(),
            AcceptorState::Halted | AcceptorState::Closed
        ) {
            self.state.store(AcceptorState::Opened);
        }
        if !self
            .state
            .transition(AcceptorState::Opened, AcceptorState::Connecting)
        {
            return self.state.load() == AcceptorState::Connected;
        }

        let mut waited = Duration::ZERO;
        loop {
            match self.bind() {
                Ok(()) => {
                    self.state.store(AcceptorState::Connected);
                    return true;
                }
                Err(e) => {
                    if waited > timeout {
                        self.state.store(AcceptorState::Opened);
                        self.logger()
                            .info(&format!("unable to bind {self} within {timeout:?}: {e}"));
                        return false;
                    }
                    std::thread::sleep(BIND_RETRY_INTERVAL);
                    waited += BIND_RETRY_INTERVAL;
                }
            }
        }
    }

    fn listen(&self) -> io::Result<Arc<TcpListener>> {
        let mut listener = self.listener.lock();
        if let Some(existing) = listener.as_ref() {
            return Ok(Arc::clone(existing));
        }
        let socket = self.socket.lock().take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "acceptor is not bound")
        })?;
        let _guard = self.handle.enter();
        let bound = Arc::new(socket.listen(LISTEN_BACKLOG)?);
        *listener = Some(Arc::clone(&bound));
        Ok(bound)
    }

    /// Issues one accept into `connection`'s socket.
    ///
    /// Fails (closing `connection`) if the acceptor is not bound or an
    /// accept is already outstanding.
    pub fn start(&self, connection: Arc<Connection>) -> bool {
        let logger = self.logger();
        if self.state.load() != AcceptorState::Connected {
            connection.close();
            if self.accepting.is_active() {
                self.accepting.trigger();
            }
            logger.info("acceptor is not in a connected state");
            return false;
        }
        if !self.accepting.activate() {
            logger.info("acceptor is already active");
            connection.close();
            return false;
        }

        let listener = match self.listen() {
            Ok(listener) => listener,
            Err(e) => {
                logger.error(&format!("unable to listen on {self}: {e}"));
                self.accepting.reset();
                connection.close();
                return false;
            }
        };
        let Some(this) = self.self_ref.upgrade() else {
            self.accepting.reset();
            connection.close();
            return false;
        };

        let accept = AcceptHandle::new(listener, self.cancel.lock().clone());
        let target = Arc::clone(&connection);
        connection.socket().use_with_acceptor(
            accept,
            Box::new(move |result| this.handle_accept(target, result)),
        );
        true
    }

    fn handle_accept(self: &Arc<Self>, connection: Arc<Connection>, result: io::Result<()>) {
        if self.state.load() != AcceptorState::Connected {
            let _ = connection.socket().set_option_linger(true, 0);
            connection.close();
            self.accepting.reset();
            return;
        }
        match result {
            Ok(()) => {
                let accept_call = self.callbacks.read().accept.clone();
                match accept_call {
                    Some(accept_call) => {
                        self.accepting.reset();
                        accept_call(self, connection);
                    }
                    None => {
                        self.logger()
                            .info("no accept callback registered, dropping connection");
                        let _ = connection.socket().set_option_linger(true, 0);
                        connection.close();
                        self.accepting.reset();
                    }
                }
            }
            Err(e) if is_operation_aborted(&e) => {
                connection.close();
                self.accepting.reset();
            }
            Err(e) => {
                let callbacks = self.callbacks.read().clone();
                match callbacks.error {
                    Some(on_error) => on_error(self, &e),
                    None => callbacks.logger.error(&format!(" error in accept::{e}")),
                }
                let _ = connection.socket().set_option_linger(true, 0);
                connection.close();
                self.accepting.reset();
            }
        }
    }

    /// Aborts the outstanding accept, if any.
    pub fn cancel(&self) {
        let mut token = self.cancel.lock();
        token.cancel();
        *token = CancellationToken::new();
    }

    /// Stops accepting, releases the endpoint and waits for the outstanding
    /// accept to be processed.
    pub fn close(&self) {
        self.state.store(AcceptorState::Halted);
        self.cancel();
        self.listener.lock().take();
        self.socket.lock().take();
        // an accept armed concurrently with the first cancel holds a newer token
        while !self.accepting.wait_for(CLOSE_POLL_INTERVAL) {
            self.cancel();
        }
        self.state.store(AcceptorState::Closed);
    }

    /// Bound endpoint as configured.
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Actual local address once bound (resolves port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        if let Some(listener) = self.listener.lock().as_ref() {
            return listener.local_addr().ok();
        }
        self.socket
            .lock()
            .as_ref()
            .and_then(|socket| socket.local_addr().ok())
            .filter(|addr| addr.port() != 0)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> AcceptorState {
        self.state.load()
    }

    /// True while bound and ready to accept.
    pub fn is_connected(&self) -> bool {
        self.state.load() == AcceptorState::Connected
    }

    /// True while an accept is outstanding.
    pub fn is_accepting(&self) -> bool {
        self.accepting.is_active()
    }
}

fn open_socket(endpoint: SocketAddr, reuse_address: bool) -> io::Result<TcpSocket> {
    let socket = if endpoint.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if reuse_address {
        socket.set_reuseaddr(true)?;
    }
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::IoContext;
    use crate::factory::SocketFactory;
    use crate::socket::{ConnectHandler, ReadHandler, Socket, WriteHandler};
    use bytes::Bytes;
    use simnet_core::{ConnectionState, HandshakeRole};
    use std::io::Read;
    use std::sync::mpsc;
    use std::time::Instant;

    /// Socket whose accepts fail with a fixed, non-cancellation error.
    #[derive(Debug)]
    struct FailingAcceptSocket {
        open: AtomicBool,
    }

    impl Socket for FailingAcceptSocket {
        fn write_some(&self, _data: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::NotConnected))
        }

        fn read_some(&self, _buffer: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::NotConnected))
        }

        fn async_write_some(&self, _data: Bytes, handler: WriteHandler) {
            handler(Err(io::Error::from(io::ErrorKind::NotConnected)));
        }

        fn async_read_some(&self, buffer: Vec<u8>, _offset: usize, handler: ReadHandler) {
            handler(Err(io::Error::from(io::ErrorKind::NotConnected)), buffer);
        }

        fn async_connect(&self, _host: &str, _service: &str, handler: ConnectHandler) {
            handler(Err(io::Error::from(io::ErrorKind::Unsupported)));
        }

        fn handshake(&self) -> io::Result<()> {
            Ok(())
        }

        fn use_with_acceptor(&self, _acceptor: AcceptHandle, handler: ConnectHandler) {
            handler(Err(io::Error::other("descriptor table full")));
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn is_encrypted(&self) -> bool {
            false
        }

        fn shutdown(&self) -> io::Result<()> {
            Ok(())
        }

        fn close(&self) -> io::Result<()> {
            self.open.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn cancel(&self) {}

        fn set_option_no_delay(&self, _enabled: bool) -> io::Result<()> {
            Ok(())
        }

        fn set_option_linger(&self, _enabled: bool, _timeout_secs: u16) -> io::Result<()> {
            Ok(())
        }

        fn set_handshake_mode_server(&self, _server: bool) -> NetworkResult<()> {
            Ok(())
        }

        fn handshake_role(&self) -> HandshakeRole {
            HandshakeRole::Server
        }
    }

    fn settle(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    fn loopback() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    fn target(ctx: &IoContext) -> Arc<Connection> {
        Connection::create(&SocketFactory::new(), &ctx.handle(), 256).unwrap()
    }

    #[test]
    fn test_connect_binds_endpoint() {
        let ctx = IoContext::new("acceptor-bind").unwrap();
        let acceptor = Acceptor::create(&ctx.handle(), loopback()).unwrap();
        assert_eq!(acceptor.state(), AcceptorState::Opened);
        assert_eq!(acceptor.to_string(), "127.0.0.1:0");

        assert!(acceptor.connect());
        assert!(acceptor.is_connected());
        assert!(acceptor.connect());
        assert_ne!(acceptor.local_addr().unwrap().port(), 0);
        acceptor.close();
        assert_eq!(acceptor.state(), AcceptorState::Closed);
    }

    #[test]
    fn test_bind_conflict_and_retry() {
        let ctx = IoContext::new("acceptor-conflict").unwrap();
        let first = Acceptor::create(&ctx.handle(), loopback()).unwrap();
        assert!(first.connect());
        let taken = first.local_addr().unwrap();

        let second = Acceptor::create(&ctx.handle(), taken).unwrap();
        assert!(!second.connect());
        assert_eq!(second.state(), AcceptorState::Opened);
        assert!(!second.connect_timeout(Duration::from_millis(300)));

        first.close();
        assert!(second.connect_timeout(Duration::from_secs(2)));
        second.close();
    }

    #[test]
    fn test_start_requires_bound_acceptor() {
        let ctx = IoContext::new("acceptor-unbound").unwrap();
        let acceptor = Acceptor::create(&ctx.handle(), loopback()).unwrap();
        let conn = target(&ctx);
        assert!(!acceptor.start(Arc::clone(&conn)));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!acceptor.is_accepting());
    }

    #[test]
    fn test_single_in_flight_accept() {
        let ctx = IoContext::new("acceptor-single").unwrap();
        let acceptor = Acceptor::create(&ctx.handle(), loopback()).unwrap();
        assert!(acceptor.connect());

        let first = target(&ctx);
        let second = target(&ctx);
        assert!(acceptor.start(Arc::clone(&first)));
        assert!(acceptor.is_accepting());

        assert!(!acceptor.start(Arc::clone(&second)));
        assert_eq!(second.state(), ConnectionState::Closed);
        assert!(acceptor.is_accepting());

        acceptor.close();
        assert!(!acceptor.is_accepting());
        assert_eq!(first.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_accept_callback_receives_connection() {
        let ctx = IoContext::new("acceptor-callback").unwrap();
        let acceptor = Acceptor::create(&ctx.handle(), loopback()).unwrap();
        let (tx, rx) = mpsc::channel();
        acceptor.set_accept_call(Arc::new(move |acc: &Arc<Acceptor>, conn: Arc<Connection>| {
            tx.send((acc.is_accepting(), conn)).unwrap();
        }));
        assert!(acceptor.connect());

        let conn = target(&ctx);
        let expected = conn.identifier();
        assert!(acceptor.start(conn));

        let _client = std::net::TcpStream::connect(acceptor.local_addr().unwrap()).unwrap();
        let (accepting, accepted) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!accepting, "latch is released before the callback runs");
        assert_eq!(accepted.identifier(), expected);
        assert!(accepted.socket().is_open());

        accepted.close();
        acceptor.close();
    }

    #[test]
    fn test_logging_function_rejected_after_bind() {
        let ctx = IoContext::new("acceptor-logging").unwrap();
        let acceptor = Acceptor::create(&ctx.handle(), loopback()).unwrap();
        acceptor.set_logging_function(Arc::new(|_, _: &str| {})).unwrap();
        assert!(acceptor.connect());
        assert!(
            acceptor
                .set_logging_function(Arc::new(|_, _: &str| {}))
                .unwrap_err()
                .is_invalid_state()
        );
        acceptor.close();
    }

    #[test]
    fn test_accept_without_callback_drops_connection() {
        let ctx = IoContext::new("acceptor-no-callback").unwrap();
        let acceptor = Acceptor::create(&ctx.handle(), loopback()).unwrap();
        assert!(acceptor.connect());

        let conn = target(&ctx);
        assert!(acceptor.start(Arc::clone(&conn)));
        let mut client = std::net::TcpStream::connect(acceptor.local_addr().unwrap()).unwrap();

        assert!(settle(|| {
            conn.state() == ConnectionState::Closed && !acceptor.is_accepting()
        }));
        assert!(!conn.socket().is_open());

        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut byte = [0u8; 1];
        match client.read(&mut byte) {
            Ok(n) => assert_eq!(n, 0),
            Err(e) => assert!(
                !matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut),
                "peer still open: {e}"
            ),
        }
        acceptor.close();
    }

    #[test]
    fn test_accept_error_reaches_error_callback() {
        let ctx = IoContext::new("acceptor-error").unwrap();
        let acceptor = Acceptor::create(&ctx.handle(), loopback()).unwrap();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&errors);
        acceptor.set_error_call(Arc::new(move |_acc: &Arc<Acceptor>, e: &io::Error| {
            seen.lock().push(e.to_string());
        }));
        acceptor.set_accept_call(Arc::new(|_acc: &Arc<Acceptor>, _conn: Arc<Connection>| {
            panic!("a failed accept must not reach the accept callback");
        }));
        assert!(acceptor.connect());

        let socket = Arc::new(FailingAcceptSocket {
            open: AtomicBool::new(true),
        });
        let conn = Connection::from_socket(socket, 64);
        assert!(acceptor.start(Arc::clone(&conn)));

        assert_eq!(*errors.lock(), vec!["descriptor table full".to_string()]);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!acceptor.is_accepting());

        // the latch is free again, so the next accept can be armed
        assert!(acceptor.start(target(&ctx)));
        acceptor.close();
    }
}
