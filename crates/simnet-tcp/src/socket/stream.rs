//! Stream-backed socket shared by the plain and encrypted variants.

use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use simnet_core::address::service_port;
use simnet_core::{HandshakeRole, NetworkError, NetworkResult, operation_aborted};

use super::{AcceptHandle, ConnectHandler, ReadHandler, Socket, WriteHandler};
use crate::context::block_on;

/// Upper bound on a security handshake; a silent peer is dropped after it.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Read half of an attached stream.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Write half of an attached stream.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Turns a raw TCP stream into the halves application data flows through.
#[async_trait]
pub trait SecurityLayer: Clone + Send + Sync + fmt::Debug + 'static {
    /// True if [`Socket::handshake`] must run before data flows.
    fn requires_handshake(&self) -> bool;

    /// Wraps `stream`, performing the security handshake if there is one.
    async fn secure(
        &self,
        stream: TcpStream,
        role: HandshakeRole,
        server_name: Option<String>,
    ) -> io::Result<(BoxedReader, BoxedWriter)>;
}

/// Unprotected TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct Plain;

#[async_trait]
impl SecurityLayer for Plain {
    fn requires_handshake(&self) -> bool {
        false
    }

    async fn secure(
        &self,
        stream: TcpStream,
        _role: HandshakeRole,
        _server_name: Option<String>,
    ) -> io::Result<(BoxedReader, BoxedWriter)> {
        let (reader, writer) = stream.into_split();
        Ok((Box::new(reader), Box::new(writer)))
    }
}

/// Plain TCP socket.
pub type PlainSocket = StreamSocket<Plain>;

/// State shared between the socket and the tasks it spawns.
struct SocketCore {
    handle: Handle,
    reader: tokio::sync::Mutex<Option<BoxedReader>>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    /// Stream waiting for its handshake.
    pending: Mutex<Option<TcpStream>>,
    /// Duplicate descriptor used for options and shutdown.
    raw: Mutex<Option<socket2::Socket>>,
    peer: Mutex<Option<SocketAddr>>,
    server_name: Mutex<Option<String>>,
    cancel: Mutex<CancellationToken>,
    role: Mutex<HandshakeRole>,
    open: AtomicBool,
    closed: AtomicBool,
    handshake_done: AtomicBool,
}

impl SocketCore {
    fn new(handle: Handle) -> Self {
        Self {
            handle,
            reader: tokio::sync::Mutex::new(None),
            writer: tokio::sync::Mutex::new(None),
            pending: Mutex::new(None),
            raw: Mutex::new(None),
            peer: Mutex::new(None),
            server_name: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
            role: Mutex::new(HandshakeRole::Client),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            handshake_done: AtomicBool::new(false),
        }
    }

    fn token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    fn cancel(&self) {
        let mut token = self.cancel.lock();
        token.cancel();
        *token = CancellationToken::new();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn unavailable(&self) -> io::Error {
        if self.is_closed() {
            operation_aborted()
        } else {
            io::Error::new(io::ErrorKind::NotConnected, "socket is not connected")
        }
    }

    async fn attach<L: SecurityLayer>(&self, stream: TcpStream, layer: &L) -> io::Result<()> {
        if self.is_closed() {
            return Err(operation_aborted());
        }
        match SockRef::from(&stream).try_clone() {
            Ok(raw) => *self.raw.lock() = Some(raw),
            Err(e) => debug!("Failed to duplicate socket descriptor: {}", e),
        }
        *self.peer.lock() = stream.peer_addr().ok();
        self.open.store(true, Ordering::Release);

        if layer.requires_handshake() {
            *self.pending.lock() = Some(stream);
        } else {
            let role = *self.role.lock();
            let (reader, writer) = layer.secure(stream, role, None).await?;
            self.install(reader, writer).await;
        }
        Ok(())
    }

    async fn install(&self, reader: BoxedReader, writer: BoxedWriter) {
        *self.reader.lock().await = Some(reader);
        *self.writer.lock().await = Some(writer);
    }

    async fn read(&self, buffer: &mut [u8], token: &CancellationToken) -> io::Result<usize> {
        let mut guard = tokio::select! {
            biased;
            () = token.cancelled() => return Err(operation_aborted()),
            guard = self.reader.lock() => guard,
        };
        let Some(reader) = guard.as_mut() else {
            return Err(self.unavailable());
        };
        let result = tokio::select! {
            biased;
            () = token.cancelled() => Err(operation_aborted()),
            read = reader.read(buffer) => read,
        };
        if self.is_closed() {
            guard.take();
        }
        match result {
            Ok(0) if !buffer.is_empty() => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "end of stream",
            )),
            other => other,
        }
    }

    async fn write(&self, data: &[u8], token: &CancellationToken) -> io::Result<usize> {
        let mut guard = tokio::select! {
            biased;
            () = token.cancelled() => return Err(operation_aborted()),
            guard = self.writer.lock() => guard,
        };
        let Some(writer) = guard.as_mut() else {
            return Err(self.unavailable());
        };
        let result = tokio::select! {
            biased;
            () = token.cancelled() => Err(operation_aborted()),
            written = async {
                let n = writer.write(data).await?;
                writer.flush().await?;
                Ok::<_, io::Error>(n)
            } => written,
        };
        if self.is_closed() {
            guard.take();
        }
        result
    }

    fn with_raw<T>(&self, f: impl FnOnce(&socket2::Socket) -> io::Result<T>) -> io::Result<T> {
        match self.raw.lock().as_ref() {
            Some(raw) => f(raw),
            None => Err(self.unavailable()),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.open.store(false, Ordering::Release);
        self.cancel();
        self.pending.lock().take();
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        self.raw.lock().take();
    }
}

async fn connect_stream(host: &str, service: &str) -> io::Result<TcpStream> {
    let port = service_port(service).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unknown port or service {service:?}"),
        )
    })?;
    let mut endpoints: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
    // IPv4 endpoints first
    endpoints.sort_by_key(|addr| addr.is_ipv6());

    let mut last_error = None;
    for endpoint in endpoints {
        match TcpStream::connect(endpoint).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no endpoints resolved for {host}:{service}"),
        )
    }))
}

/// Socket over a TCP stream, secured by `L`.
pub struct StreamSocket<L: SecurityLayer> {
    core: Arc<SocketCore>,
    layer: L,
}

impl<L: SecurityLayer> fmt::Debug for StreamSocket<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSocket")
            .field("layer", &self.layer)
            .field("peer", &*self.core.peer.lock())
            .field("open", &self.core.open.load(Ordering::Relaxed))
            .field("role", &*self.core.role.lock())
            .finish()
    }
}

impl<L: SecurityLayer> StreamSocket<L> {
    /// Creates an unconnected socket driven by `handle`.
    pub fn new(handle: Handle, layer: L) -> Self {
        Self {
            core: Arc::new(SocketCore::new(handle)),
            layer,
        }
    }

    /// Remote address of the attached stream.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.core.peer.lock()
    }
}

impl StreamSocket<Plain> {
    /// Creates an unconnected plain socket.
    pub fn plain(handle: Handle) -> Self {
        Self::new(handle, Plain)
    }
}

impl<L: SecurityLayer> Socket for StreamSocket<L> {
    fn write_some(&self, data: &[u8]) -> io::Result<usize> {
        let token = self.core.token();
        block_on(&self.core.handle, self.core.write(data, &token))?
    }

    fn read_some(&self, buffer: &mut [u8]) -> io::Result<usize> {
        let token = self.core.token();
        block_on(&self.core.handle, self.core.read(buffer, &token))?
    }

    fn async_write_some(&self, data: Bytes, handler: WriteHandler) {
        let core = Arc::clone(&self.core);
        let token = core.token();
        self.core.handle.spawn(async move {
            let result = core.write(&data, &token).await;
            handler(result);
        });
    }

    fn async_read_some(&self, mut buffer: Vec<u8>, offset: usize, handler: ReadHandler) {
        if offset >= buffer.len() {
            handler(
                Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "read offset outside the buffer",
                )),
                buffer,
            );
            return;
        }
        let core = Arc::clone(&self.core);
        let token = core.token();
        self.core.handle.spawn(async move {
            let result = core.read(&mut buffer[offset..], &token).await;
            handler(result, buffer);
        });
    }

    fn async_connect(&self, host: &str, service: &str, handler: ConnectHandler) {
        let core = Arc::clone(&self.core);
        let layer = self.layer.clone();
        let token = core.token();
        let (host, service) = (host.to_string(), service.to_string());
        *core.server_name.lock() = Some(host.clone());
        self.core.handle.spawn(async move {
            let connected = tokio::select! {
                biased;
                () = token.cancelled() => Err(operation_aborted()),
                stream = connect_stream(&host, &service) => stream,
            };
            let result = match connected {
                Ok(stream) => core.attach(stream, &layer).await,
                Err(e) => Err(e),
            };
            handler(result);
        });
    }

    fn handshake(&self) -> io::Result<()> {
        if !self.layer.requires_handshake() {
            return Ok(());
        }
        let Some(stream) = self.core.pending.lock().take() else {
            return if self.core.handshake_done.load(Ordering::Acquire) {
                Ok(())
            } else {
                Err(self.core.unavailable())
            };
        };
        let role = *self.core.role.lock();
        let server_name = self.core.server_name.lock().clone();
        let token = self.core.token();
        let core = Arc::clone(&self.core);
        let layer = self.layer.clone();
        block_on(&self.core.handle, async move {
            let (reader, writer) = tokio::select! {
                biased;
                () = token.cancelled() => return Err(operation_aborted()),
                () = tokio::time::sleep(HANDSHAKE_TIMEOUT) => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("handshake timed out after {HANDSHAKE_TIMEOUT:?}"),
                    ));
                }
                secured = layer.secure(stream, role, server_name) => secured?,
            };
            core.install(reader, writer).await;
            Ok::<(), io::Error>(())
        })??;
        self.core.handshake_done.store(true, Ordering::Release);
        Ok(())
    }

    fn use_with_acceptor(&self, acceptor: AcceptHandle, handler: ConnectHandler) {
        let core = Arc::clone(&self.core);
        let layer = self.layer.clone();
        let token = core.token();
        self.core.handle.spawn(async move {
            let accepted = tokio::select! {
                biased;
                () = token.cancelled() => Err(operation_aborted()),
                () = acceptor.token().cancelled() => Err(operation_aborted()),
                accepted = acceptor.listener().accept() => accepted.map(|(stream, _)| stream),
            };
            let result = match accepted {
                Ok(stream) => core.attach(stream, &layer).await,
                Err(e) => Err(e),
            };
            handler(result);
        });
    }

    fn is_open(&self) -> bool {
        self.core.open.load(Ordering::Acquire)
    }

    fn is_encrypted(&self) -> bool {
        self.layer.requires_handshake()
    }

    fn shutdown(&self) -> io::Result<()> {
        self.core.with_raw(|raw| raw.shutdown(Shutdown::Both))
    }

    fn close(&self) -> io::Result<()> {
        self.core.close();
        Ok(())
    }

    fn cancel(&self) {
        self.core.cancel();
    }

    fn set_option_no_delay(&self, enabled: bool) -> io::Result<()> {
        self.core.with_raw(|raw| raw.set_nodelay(enabled))
    }

    fn set_option_linger(&self, enabled: bool, timeout_secs: u16) -> io::Result<()> {
        let linger = enabled.then(|| Duration::from_secs(u64::from(timeout_secs)));
        self.core.with_raw(|raw| raw.set_linger(linger))
    }

    fn set_handshake_mode_server(&self, server: bool) -> NetworkResult<()> {
        if self.core.handshake_done.load(Ordering::Acquire) {
            return Err(NetworkError::invalid_state(
                "handshake role cannot change after the handshake",
            ));
        }
        *self.core.role.lock() = if server {
            HandshakeRole::Server
        } else {
            HandshakeRole::Client
        };
        Ok(())
    }

    fn handshake_role(&self) -> HandshakeRole {
        *self.core.role.lock()
    }
}
