//! Error types for kvflow.

use thiserror::Error;

/// Main error type for kvflow operations.
#[derive(Error, Debug)]
pub enum KvflowError {
    /// The backing store could not be reached (refused, dropped, timed out).
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The store answered, but rejected the command.
    #[error("Store error: {0}")]
    Store(String),

    /// A queued value could not be decoded into a task.
    #[error("Malformed task {raw:?}: {reason}")]
    MalformedTask { raw: String, reason: String },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A task handler reported failure
    #[error("Task failed: {0}")]
    TaskFailed(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl KvflowError {
    /// Whether this error means the store itself is unreachable.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, KvflowError::StoreUnavailable(_))
    }
}

impl From<redis::RedisError> for KvflowError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
        {
            KvflowError::StoreUnavailable(err.to_string())
        } else {
            KvflowError::Store(err.to_string())
        }
    }
}

/// Result type alias for kvflow operations.
pub type Result<T> = std::result::Result<T, KvflowError>;
