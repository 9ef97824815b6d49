//! One byte-stream session and its receive loop.
//!
//! A [`Connection`] owns exactly one [`Socket`]. Once started it keeps one
//! read outstanding, hands every delivery to the data callback and carries
//! the bytes the callback did not consume into the next delivery. Closing is
//! a rendezvous: [`Connection::close`] returns only after the in-flight read
//! has completed and observed the halt request.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;

use simnet_core::{
    ConnectionId, ConnectionState, LogSink, Logger, NetworkError, NetworkResult, StateCell,
    TriggerVariable, is_end_of_stream, is_operation_aborted, is_transient,
};

use crate::factory::SocketFactory;
use crate::socket::{Socket, WriteHandler};

/// Default receive buffer size in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 10192;

/// Number of partial writes `send` attempts before giving up.
pub const MAX_SEND_ATTEMPTS: usize = 5;

const FIRST_CONNECT_WAIT: Duration = Duration::from_millis(300);
const SECOND_CONNECT_WAIT: Duration = Duration::from_millis(200);
const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Receives every delivery; returns how many leading bytes it consumed.
pub type DataCallback = Arc<dyn Fn(&Arc<Connection>, &[u8]) -> usize + Send + Sync>;

/// Decides whether a read error resumes receiving (`true`) or halts (`false`).
pub type ErrorCallback = Arc<dyn Fn(&Arc<Connection>, &io::Error) -> bool + Send + Sync>;

#[derive(Clone, Default)]
struct Callbacks {
    data: Option<DataCallback>,
    error: Option<ErrorCallback>,
    logger: Logger,
}

/// An established or connecting TCP session.
pub struct Connection {
    socket: Arc<dyn Socket>,
    buffer: Mutex<Vec<u8>>,
    residual: AtomicUsize,
    state: StateCell<ConnectionState>,
    trigger_halt: AtomicBool,
    connecting: bool,
    connection_error: AtomicBool,
    receiving_halt: TriggerVariable,
    connected: TriggerVariable,
    callbacks: RwLock<Callbacks>,
    id: ConnectionId,
    self_ref: Weak<Connection>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state.load())
            .field("connecting", &self.connecting)
            .field("residual", &self.residual.load(Ordering::Relaxed))
            .field("socket", &self.socket)
            .finish()
    }
}

impl Connection {
    fn build(socket: Arc<dyn Socket>, buffer_size: usize, connecting: bool) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            socket,
            buffer: Mutex::new(vec![0; buffer_size.max(1)]),
            residual: AtomicUsize::new(0),
            state: StateCell::new(ConnectionState::NotStarted),
            trigger_halt: AtomicBool::new(false),
            connecting,
            connection_error: AtomicBool::new(false),
            receiving_halt: TriggerVariable::new(),
            connected: TriggerVariable::new(),
            callbacks: RwLock::new(Callbacks::default()),
            id: ConnectionId::next(),
            self_ref: self_ref.clone(),
        })
    }

    /// Wraps an existing socket, typically one about to accept.
    pub fn from_socket(socket: Arc<dyn Socket>, buffer_size: usize) -> Arc<Self> {
        Self::build(socket, buffer_size, false)
    }

    /// Creates an unconnected connection with a fresh socket from `factory`.
    pub fn create(
        factory: &SocketFactory,
        handle: &Handle,
        buffer_size: usize,
    ) -> NetworkResult<Arc<Self>> {
        Ok(Self::from_socket(factory.create_socket(handle)?, buffer_size))
    }

    /// Creates a connection and starts connecting it to `host:port`.
    ///
    /// Use [`Connection::wait_until_connected`] to observe the outcome.
    pub fn connect(
        factory: &SocketFactory,
        handle: &Handle,
        host: &str,
        port: &str,
        buffer_size: usize,
    ) -> NetworkResult<Arc<Self>> {
        let connection = Self::build(factory.create_socket(handle)?, buffer_size, true);
        let pending = Arc::clone(&connection);
        connection.socket.async_connect(
            host,
            port,
            Box::new(move |result| pending.connect_handler(result)),
        );
        Ok(connection)
    }

    fn connect_handler(&self, result: io::Result<()>) {
        let logger = self.logger();
        match result {
            Ok(()) => {
                if let Err(e) = self.socket.handshake() {
                    logger.error(&format!("handshake error {e}"));
                    self.connection_error.store(true, Ordering::Release);
                }
                self.connected.activate();
                if let Err(e) = self.socket.set_option_no_delay(true) {
                    logger.info(&format!("unable to set no-delay: {e}"));
                }
            }
            Err(e) => {
                if !is_operation_aborted(&e) {
                    logger.error(&format!("connection error {e}"));
                }
                self.connection_error.store(true, Ordering::Release);
                self.connected.activate();
            }
        }
    }

    fn logger(&self) -> Logger {
        self.callbacks.read().logger.clone()
    }

    fn ensure_not_started(&self, what: &str) -> NetworkResult<()> {
        if self.state.load() == ConnectionState::NotStarted {
            Ok(())
        } else {
            Err(NetworkError::invalid_state(format!(
                "cannot set {what} after the connection is started"
            )))
        }
    }

    /// Installs the data callback; fails once receiving has started.
    pub fn set_data_call(&self, callback: DataCallback) -> NetworkResult<()> {
        self.ensure_not_started("data callback")?;
        self.callbacks.write().data = Some(callback);
        Ok(())
    }

    /// Installs the error callback; fails once receiving has started.
    pub fn set_error_call(&self, callback: ErrorCallback) -> NetworkResult<()> {
        self.ensure_not_started("error callback")?;
        self.callbacks.write().error = Some(callback);
        Ok(())
    }

    /// Installs the log sink; fails once receiving has started.
    pub fn set_logging_function(&self, sink: LogSink) -> NetworkResult<()> {
        self.ensure_not_started("logging function")?;
        self.callbacks.write().logger = Logger::with_sink(sink);
        Ok(())
    }

    /// Makes the socket answer the security handshake.
    pub fn set_handshake_mode_server(&self) -> NetworkResult<()> {
        self.ensure_not_started("handshake role")?;
        self.socket.set_handshake_mode_server(true)
    }

    /// Performs the socket's security handshake.
    pub fn handshake(&self) -> io::Result<()> {
        self.socket.handshake()
    }

    /// Starts (or re-arms) the receive loop.
    ///
    /// Idempotent: a call while a read is outstanding does nothing.
    pub fn start_receive(&self) {
        if self.trigger_halt.load(Ordering::Acquire) {
            self.receiving_halt.trigger();
            return;
        }
        if self
            .state
            .transition(ConnectionState::NotStarted, ConnectionState::WaitingForIo)
        {
            self.receiving_halt.activate();
            if !self.connecting {
                self.connected.activate();
            }
        }
        if self
            .state
            .transition(ConnectionState::WaitingForIo, ConnectionState::Receiving)
        {
            if !self.receiving_halt.is_active() {
                self.receiving_halt.activate();
            }
            if self.trigger_halt.load(Ordering::Acquire) {
                self.halt();
                return;
            }
            let Some(this) = self.self_ref.upgrade() else {
                return;
            };
            let buffer = std::mem::take(&mut *self.buffer.lock());
            let offset = self.residual.load(Ordering::Acquire);
            self.socket.async_read_some(
                buffer,
                offset,
                Box::new(move |result, buffer| this.handle_read(result, buffer)),
            );
            if self.trigger_halt.load(Ordering::Acquire) {
                self.socket.cancel();
            }
        } else if !matches!(
            self.state.load(),
            ConnectionState::Receiving | ConnectionState::Halting
        ) {
            self.receiving_halt.trigger();
        }
    }

    fn halt(&self) {
        self.state.store(ConnectionState::Halted);
        self.receiving_halt.trigger();
    }

    fn handle_read(self: &Arc<Self>, result: io::Result<usize>, mut buffer: Vec<u8>) {
        if self.trigger_halt.load(Ordering::Acquire) {
            *self.buffer.lock() = buffer;
            self.halt();
            return;
        }
        match result {
            Ok(transferred) => {
                self.deliver(&mut buffer, transferred);
                *self.buffer.lock() = buffer;
                self.state.store(ConnectionState::WaitingForIo);
                self.start_receive();
            }
            Err(err) if is_operation_aborted(&err) => {
                *self.buffer.lock() = buffer;
                self.halt();
            }
            Err(err) => {
                *self.buffer.lock() = buffer;
                let callbacks = self.callbacks.read().clone();
                match callbacks.error {
                    Some(on_error) => {
                        if on_error(self, &err) {
                            self.state.store(ConnectionState::WaitingForIo);
                            self.start_receive();
                        } else {
                            self.halt();
                        }
                    }
                    None => {
                        if !is_end_of_stream(&err) {
                            callbacks.logger.error(&format!("receive error {err}"));
                        }
                        self.halt();
                    }
                }
            }
        }
    }

    /// Hands `residual + transferred` bytes to the data callback and keeps the
    /// unconsumed tail at the front of the buffer.
    fn deliver(self: &Arc<Self>, buffer: &mut Vec<u8>, transferred: usize) {
        let total = transferred + self.residual.load(Ordering::Acquire);
        let data_call = self.callbacks.read().data.clone();
        let used = match data_call {
            Some(data_call) => data_call(self, &buffer[..total]).min(total),
            None => {
                self.logger()
                    .info(&format!("no data callback, dropping {total} bytes"));
                total
            }
        };
        let residual = total - used;
        if residual > 0 && used > 0 {
            buffer.copy_within(used..total, 0);
        }
        if residual >= buffer.len() {
            let grown = buffer.len() * 2;
            buffer.resize(grown, 0);
        }
        self.residual.store(residual, Ordering::Release);
    }

    /// Blocking send of the whole payload.
    ///
    /// Waits briefly for an outbound connection to complete, then performs up
    /// to [`MAX_SEND_ATTEMPTS`] partial writes. Returns `Ok(0)` if the
    /// connection never came up or the payload could not be written within
    /// the attempt ceiling, otherwise the full length.
    pub fn send(&self, data: &[u8]) -> io::Result<usize> {
        if !self.is_connected() {
            let logger = self.logger();
            if !self.wait_until_connected(Some(FIRST_CONNECT_WAIT)) {
                logger.error("connection timeout waiting again");
            }
            if !self.wait_until_connected(Some(SECOND_CONNECT_WAIT)) {
                logger.error("connection timeout twice, now returning");
                return Ok(0);
            }
        }
        if data.is_empty() {
            return Ok(0);
        }

        let mut offset = 0;
        for _ in 0..MAX_SEND_ATTEMPTS {
            offset += self.socket.write_some(&data[offset..])?;
            if offset == data.len() {
                return Ok(data.len());
            }
        }
        self.logger().error("send terminated before the full payload was written");
        Ok(0)
    }

    /// Queues a non-blocking write of `data`.
    pub fn send_async(&self, data: impl Into<Bytes>, handler: WriteHandler) {
        self.socket.async_write_some(data.into(), handler);
    }

    /// Blocking read into `buffer`, outside the receive loop.
    pub fn receive(&self, buffer: &mut [u8]) -> io::Result<usize> {
        self.socket.read_some(buffer)
    }

    /// One asynchronous read outside the receive loop.
    ///
    /// Must not be combined with [`Connection::start_receive`].
    pub fn async_receive<F>(&self, handler: F)
    where
        F: FnOnce(&Arc<Connection>, io::Result<&[u8]>) + Send + 'static,
    {
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        let size = self.buffer_capacity().max(1);
        self.socket.async_read_some(
            vec![0; size],
            0,
            Box::new(move |result, buffer| match result {
                Ok(n) => handler(&this, Ok(&buffer[..n])),
                Err(e) => handler(&this, Err(e)),
            }),
        );
    }

    /// Waits for an outbound connect to finish; `None` waits without limit.
    pub fn wait_until_connected(&self, timeout: Option<Duration>) -> bool {
        if self.is_connected() {
            return true;
        }
        match timeout {
            Some(timeout) => {
                self.connected.wait_for_activation(timeout);
            }
            None => self.connected.wait_activation(),
        }
        self.is_connected()
    }

    /// True once connected without error.
    pub fn is_connected(&self) -> bool {
        self.connected.is_active() && !self.connection_error.load(Ordering::Acquire)
    }

    /// True if the outbound connect or its handshake failed.
    pub fn has_connection_error(&self) -> bool {
        self.connection_error.load(Ordering::Acquire)
    }

    /// True while the receive loop is active.
    pub fn is_receiving(&self) -> bool {
        self.receiving_halt.is_active()
    }

    /// Process-unique identifier.
    pub fn identifier(&self) -> ConnectionId {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state.load()
    }

    /// Current receive buffer size.
    pub fn buffer_capacity(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Underlying socket.
    pub fn socket(&self) -> &Arc<dyn Socket> {
        &self.socket
    }

    /// Aborts outstanding socket operations.
    pub fn cancel(&self) {
        self.socket.cancel();
    }

    /// Requests a halt and closes the socket without waiting.
    ///
    /// Not-connected and reset errors during shutdown are expected when the
    /// peer is already gone and are not reported.
    pub fn close_no_wait(&self) {
        self.trigger_halt.store(true, Ordering::Release);
        match self.state.load() {
            ConnectionState::NotStarted => {
                if self.receiving_halt.is_active() {
                    self.receiving_halt.trigger();
                }
            }
            ConnectionState::Receiving => {
                self.state
                    .transition(ConnectionState::Receiving, ConnectionState::Halting);
            }
            ConnectionState::Halted | ConnectionState::Closed => {
                self.receiving_halt.trigger();
            }
            ConnectionState::WaitingForIo | ConnectionState::Halting => {}
        }

        let logger = self.logger();
        if self.socket.is_open() {
            if let Err(e) = self.socket.shutdown() {
                if !is_transient(&e) {
                    logger.error(&format!("error occurred sending shutdown::{e}"));
                }
            }
        }
        if let Err(e) = self.socket.close() {
            logger.info(&format!("error closing socket: {e}"));
        }
    }

    /// Blocks until the outstanding read has observed the halt request.
    ///
    /// Must not be called from inside this connection's own callbacks.
    pub fn wait_on_close(&self) {
        if self.trigger_halt.load(Ordering::Acquire) {
            if self.connecting {
                self.connected.wait_activation();
            }
            while !self.receiving_halt.wait_for(CLOSE_POLL_INTERVAL) {
                let logger = self.logger();
                logger.info(&format!(
                    "wait timeout {} {} {}",
                    self.state.load(),
                    self.socket.is_open(),
                    self.receiving_halt.is_triggered()
                ));
                logger.info(&format!("wait info connecting={}", self.connecting));
            }
        } else {
            self.close_no_wait();
            self.wait_on_close();
            return;
        }
        self.state.store(ConnectionState::Closed);
    }

    /// Halts the receive loop, closes the socket and waits for the rendezvous.
    pub fn close(&self) {
        self.close_no_wait();
        self.wait_on_close();
    }
}
