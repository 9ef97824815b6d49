//! Log sink used by connections, acceptors and listeners.

use std::fmt;
use std::sync::Arc;

/// Severity passed to a [`LogSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i32)]
pub enum LogLevel {
    /// Error-class message.
    Error = 0,
    /// Informational or diagnostic message.
    Info = 1,
}

impl LogLevel {
    /// Numeric level as seen by external sinks.
    pub const fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Application-supplied sink receiving `(level, message)`.
pub type LogSink = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Routes component messages to an installed sink, or to `tracing`.
#[derive(Clone, Default)]
pub struct Logger {
    sink: Option<LogSink>,
}

impl Logger {
    /// Logger forwarding to `sink`.
    pub fn with_sink(sink: LogSink) -> Self {
        Self { sink: Some(sink) }
    }

    /// True if an application sink is installed.
    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    /// Emits one message.
    pub fn log(&self, level: LogLevel, message: &str) {
        match &self.sink {
            Some(sink) => sink(level, message),
            None => match level {
                LogLevel::Error => tracing::error!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
            },
        }
    }

    /// Emits an error-class message.
    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    /// Emits an informational message.
    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("sink", &self.sink.as_ref().map(|_| "<fn>"))
            .finish()
    }
}
