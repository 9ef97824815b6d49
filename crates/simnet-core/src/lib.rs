//! # simnet core
//!
//! Runtime-independent building blocks for the simnet TCP layer.
//!
//! ## Overview
//!
//! This crate defines:
//! - **Errors**: [`NetworkError`], [`NetworkResult`] and the I/O error classifiers
//! - **Synchronization**: [`TriggerVariable`], the close-coordination latch
//! - **Types**: [`ConnectionState`], [`AcceptorState`], [`StateCell`], [`ConnectionId`], [`HandshakeRole`]
//! - **Logging**: [`LogLevel`], [`LogSink`], [`Logger`]
//! - **Config**: [`SocketConfig`], [`TlsSettings`]
//! - **Addresses**: string helpers in [`address`]

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

pub mod address;
mod config;
mod error;
mod logging;
mod trigger;
mod types;

pub use address::InterfaceType;
pub use config::{SocketConfig, TlsSettings};
pub use error::{
    NetworkError, NetworkResult, OperationAborted, is_end_of_stream, is_operation_aborted,
    is_transient, operation_aborted,
};
pub use logging::{LogLevel, LogSink, Logger};
pub use trigger::TriggerVariable;
pub use types::{AcceptorState, ConnectionId, ConnectionState, HandshakeRole, StateCell};
