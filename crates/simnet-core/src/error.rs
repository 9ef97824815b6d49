//! Network error types and I/O error classification.

use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// A specialized `Result` type for network layer operations.
pub type NetworkResult<T> = std::result::Result<T, NetworkError>;

/// Errors raised synchronously by the network layer.
///
/// Errors on the asynchronous I/O path are never returned through this type;
/// they reach the caller as [`std::io::Error`] values inside completion
/// callbacks.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum NetworkError {
    /// Failed to establish a connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A host or service name could not be resolved.
    #[error("Resolution failed: {0}")]
    Resolution(String),

    /// The operation did not complete within the specified timeout.
    #[error("Operation timed out after {timeout:?}: {operation}")]
    Timeout {
        /// The operation that timed out
        operation: String,
        /// The timeout duration that was exceeded
        timeout: Duration,
    },

    /// A mutator was called after the object left its pre-start state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The component was configured with invalid parameters.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A configuration document could not be parsed.
    #[error("Configuration parse error: {0}")]
    ConfigParse(String),

    /// Building the transport security context failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Encryption was requested but the library was built without it.
    #[error("Encryption requested but the library was built without encryption support")]
    EncryptionUnavailable,

    /// An underlying I/O error occurred.
    #[error("IO error: {0}")]
    Io(String),
}

impl NetworkError {
    /// Shorthand for an [`NetworkError::InvalidState`] error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Returns true if this error reports misuse of a started component.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState(_))
    }
}

impl From<io::Error> for NetworkError {
    fn from(err: io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for NetworkError {
    fn from(err: serde_json::Error) -> Self {
        Self::ConfigParse(err.to_string())
    }
}

/// Marker carried by I/O errors produced by explicit cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationAborted;

impl fmt::Display for OperationAborted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation aborted")
    }
}

impl std::error::Error for OperationAborted {}

/// Builds the error delivered to completion callbacks of cancelled operations.
pub fn operation_aborted() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, OperationAborted)
}

/// Returns true if `err` was produced by cancelling the operation.
pub fn is_operation_aborted(err: &io::Error) -> bool {
    err.get_ref().is_some_and(|inner| inner.is::<OperationAborted>())
}

/// Returns true for errors that are the expected outcome of a peer
/// disconnecting while the local side shuts down.
pub fn is_transient(err: &io::Error) -> bool {
    is_operation_aborted(err)
        || matches!(
            err.kind(),
            io::ErrorKind::NotConnected
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof
        )
}

/// Returns true if `err` signals an orderly or abrupt end of the stream.
pub fn is_end_of_stream(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_aborted_classification() {
        let err = operation_aborted();
        assert!(is_operation_aborted(&err));
        assert!(is_transient(&err));

        let interrupted = io::Error::from(io::ErrorKind::Interrupted);
        assert!(!is_operation_aborted(&interrupted));
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::NotConnected)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[test]
    fn test_io_error_conversion() {
        let err: NetworkError = io::Error::new(io::ErrorKind::AddrInUse, "busy").into();
        assert!(matches!(err, NetworkError::Io(ref msg) if msg == "busy"));
    }

    #[test]
    fn test_json_error_conversion() {
        let parse = serde_json::from_str::<serde_json::Value>("{ not json").unwrap_err();
        let err: NetworkError = parse.into();
        assert!(matches!(err, NetworkError::ConfigParse(_)));
    }

    #[test]
    fn test_invalid_state_helper() {
        let err = NetworkError::invalid_state("already started");
        assert!(err.is_invalid_state());
        assert_eq!(err.to_string(), "Invalid state: already started");
    }
}
