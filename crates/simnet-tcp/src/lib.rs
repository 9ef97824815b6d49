//! # simnet TCP
//!
//! TCP connection management: sockets with optional transport security,
//! buffered receive loops with partial-frame carry-over, single-endpoint
//! acceptors and a multi-endpoint listener with a live connection pool.
//!
//! ## Features
//!
//! - **Receive loop**: one outstanding read per [`Connection`], unconsumed
//!   bytes carried into the next delivery
//! - **Close rendezvous**: [`Connection::close`] and [`TcpServer::close`]
//!   return only after the last callback has finished
//! - **Listener**: wildcard and multi-homed binding, reconnect after failure
//! - **Encryption**: rustls-backed sockets behind the `encryption` feature
//!
//! ## Quick Start
//!
//! ### Server
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use simnet_tcp::{Connection, IoContext, SocketFactory, TcpServer};
//!
//! let context = IoContext::new("listener")?;
//! let server = TcpServer::new(SocketFactory::new(), &context.handle(), "*", 24160, false, 10192)?;
//! server.set_data_call(Arc::new(|_conn: &Arc<Connection>, data: &[u8]| {
//!     println!("received {} bytes", data.len());
//!     data.len()
//! }))?;
//! server.start();
//! ```
//!
//! ### Client
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use simnet_tcp::{IoContext, SocketFactory, establish_connection};
//!
//! let context = IoContext::new("client")?;
//! let connection = establish_connection(
//!     &SocketFactory::new(),
//!     &context.handle(),
//!     "localhost",
//!     "24160",
//!     Duration::from_secs(5),
//! )?;
//! connection.send(b"test")?;
//! connection.close();
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::must_use_candidate
)]

mod acceptor;
mod connection;
mod context;
mod factory;
mod operations;
mod server;
pub mod socket;

pub use acceptor::{AcceptCallback, AcceptErrorCallback, Acceptor};
pub use connection::{
    Connection, DEFAULT_BUFFER_SIZE, DataCallback, ErrorCallback, MAX_SEND_ATTEMPTS,
};
pub use context::IoContext;
pub use factory::SocketFactory;
pub use operations::{establish_connection, establish_connection_to};
pub use server::{TcpServer, TcpServerBuilder, TcpServerConfig};
pub use socket::Socket;

// Re-export core types for convenience
pub use simnet_core::{
    AcceptorState, ConnectionId, ConnectionState, HandshakeRole, LogLevel, LogSink,
    NetworkError, NetworkResult, SocketConfig, TlsSettings,
};
