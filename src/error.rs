/// Unified error handling for ringpool
///
/// Every codec and connection boundary returns a `CacheResult`. Errors that
/// leave a socket in an unknown state are "fatal": the connection that
/// produced them is marked down and closed instead of being recycled.
use std::fmt;
use std::io;
use thiserror::Error;

pub use crate::config::ConfigError;

/// Main error type for ringpool operations
#[derive(Debug, Error)]
pub enum CacheError {
    /// Dial, read or write failure on a backend socket
    #[error("Connection error: {0}")]
    Connection(#[from] io::Error),

    /// A socket operation ran past the connection deadline
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Malformed reply or unexpected status line
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The router found no usable backend for the key
    #[error("No server available")]
    NoServerAvailable,

    /// Application level error returned by the server (e.g. `-ERR ...`)
    #[error("Command error: {0}")]
    Command(String),

    /// Command rejected before anything was sent
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Composite value could not be serialized
    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// AMQP broker errors
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Result type alias for ringpool operations
pub type CacheResult<T> = Result<T, CacheError>;

impl CacheError {
    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        CacheError::Protocol(message.into())
    }

    /// Create a command error
    pub fn command<S: Into<String>>(message: S) -> Self {
        CacheError::Command(message.into())
    }

    /// Create an invalid command error
    pub fn invalid_command<S: Into<String>>(command: S) -> Self {
        CacheError::InvalidCommand(command.into())
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        CacheError::Timeout {
            operation: operation.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        CacheError::Internal {
            message: message.into(),
        }
    }

    /// Whether the connection that produced this error must be discarded
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CacheError::Connection(_) | CacheError::Timeout { .. } | CacheError::Protocol(_)
        )
    }

    /// Check if this error is recoverable (can retry)
    pub fn is_recoverable(&self) -> bool {
        match self {
            CacheError::Connection(_) => true,
            CacheError::Timeout { .. } => true,
            CacheError::NoServerAvailable => true,
            _ => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            CacheError::Config(_) => ErrorSeverity::Critical,
            CacheError::Internal { .. } => ErrorSeverity::Critical,
            CacheError::Connection(_) => ErrorSeverity::Warning,
            CacheError::Timeout { .. } => ErrorSeverity::Warning,
            CacheError::NoServerAvailable => ErrorSeverity::Warning,
            CacheError::Command(_) => ErrorSeverity::Info,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}
