//! Socket capability interface.
//!
//! A [`Socket`] wraps one TCP endpoint, optionally protected by transport
//! security. Blocking calls (`write_some`, `read_some`, `handshake`) run on
//! the caller's thread; the `async_*` calls queue one operation on the event
//! loop and report through a boxed completion handler. At most one
//! asynchronous operation per direction may be outstanding.

mod stream;
#[cfg(feature = "encryption")]
mod tls;

use std::fmt;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use simnet_core::{HandshakeRole, NetworkResult};

pub use stream::{
    BoxedReader, BoxedWriter, HANDSHAKE_TIMEOUT, Plain, PlainSocket, SecurityLayer, StreamSocket,
};
#[cfg(feature = "encryption")]
pub use tls::{TlsContext, TlsLayer, TlsSocket};

/// Completion of an asynchronous read; the buffer is handed back to the caller.
pub type ReadHandler = Box<dyn FnOnce(io::Result<usize>, Vec<u8>) + Send + 'static>;

/// Completion of an asynchronous write.
pub type WriteHandler = Box<dyn FnOnce(io::Result<usize>) + Send + 'static>;

/// Completion of an asynchronous connect or accept.
pub type ConnectHandler = Box<dyn FnOnce(io::Result<()>) + Send + 'static>;

/// Listening handle a socket can accept one inbound connection from.
#[derive(Debug, Clone)]
pub struct AcceptHandle {
    listener: Arc<TcpListener>,
    cancel: CancellationToken,
}

impl AcceptHandle {
    /// Pairs a listener with the token that cancels accepts issued on it.
    pub fn new(listener: Arc<TcpListener>, cancel: CancellationToken) -> Self {
        Self { listener, cancel }
    }

    pub(crate) fn listener(&self) -> &TcpListener {
        &self.listener
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// One TCP endpoint, plain or encrypted.
///
/// Option setters and the blocking calls report failures through
/// [`io::Result`]; callers that treat a failure as expected simply inspect
/// the result instead of propagating it.
pub trait Socket: Send + Sync + fmt::Debug {
    /// Writes up to `data.len()` bytes, blocking until at least one transfer completes.
    fn write_some(&self, data: &[u8]) -> io::Result<usize>;

    /// Reads up to `buffer.len()` bytes, blocking until data or an error arrives.
    fn read_some(&self, buffer: &mut [u8]) -> io::Result<usize>;

    /// Queues one write on the event loop.
    fn async_write_some(&self, data: Bytes, handler: WriteHandler);

    /// Queues one read into `buffer[offset..]` on the event loop.
    fn async_read_some(&self, buffer: Vec<u8>, offset: usize, handler: ReadHandler);

    /// Resolves `host`/`service` and connects to the first reachable endpoint.
    fn async_connect(&self, host: &str, service: &str, handler: ConnectHandler);

    /// Performs the security handshake; a no-op for plain sockets.
    fn handshake(&self) -> io::Result<()>;

    /// Makes this socket the target of one inbound accept.
    fn use_with_acceptor(&self, acceptor: AcceptHandle, handler: ConnectHandler);

    /// True while a stream is attached and the socket has not been closed.
    fn is_open(&self) -> bool;

    /// True for sockets that carry transport security.
    fn is_encrypted(&self) -> bool;

    /// Shuts down both directions of the stream.
    fn shutdown(&self) -> io::Result<()>;

    /// Releases the stream and aborts every outstanding operation.
    fn close(&self) -> io::Result<()>;

    /// Aborts outstanding operations without closing.
    fn cancel(&self);

    /// Sets `TCP_NODELAY`.
    fn set_option_no_delay(&self, enabled: bool) -> io::Result<()>;

    /// Sets `SO_LINGER`; `timeout_secs` applies when `enabled`.
    fn set_option_linger(&self, enabled: bool, timeout_secs: u16) -> io::Result<()>;

    /// Selects the handshake role; fails once the handshake has completed.
    fn set_handshake_mode_server(&self, server: bool) -> NetworkResult<()>;

    /// Current handshake role.
    fn handshake_role(&self) -> HandshakeRole;
}
