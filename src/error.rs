//! Error types for windward.

use std::time::Duration;

use thiserror::Error;

/// Main error type for windward operations.
#[derive(Error, Debug)]
pub enum WindwardError {
    /// The backing store could not be reached or rejected an operation.
    #[error("backend error: {0}")]
    Backend(#[from] redis::RedisError),

    /// A store operation exceeded its configured timeout.
    #[error("backend operation timed out after {0:?}")]
    Timeout(Duration),

    /// The store returned data the limiter cannot interpret.
    #[error("backend returned inconsistent data: {0}")]
    Inconsistent(String),

    /// A caller-supplied argument was rejected at the configuration boundary.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration-related errors
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WindwardError {
    /// Whether this error originated in the backing store rather than in
    /// caller input. Backend errors are terminal for a single `acquire`
    /// call; they are surfaced as an outcome, not retried.
    pub fn is_backend(&self) -> bool {
        matches!(
            self,
            WindwardError::Backend(_) | WindwardError::Timeout(_) | WindwardError::Inconsistent(_)
        )
    }
}

/// Result type alias for windward operations.
pub type Result<T> = std::result::Result<T, WindwardError>;
