//! Error types for Rateswitch.

use std::time::Duration;
use thiserror::Error;

/// Main error type for rate limiting operations.
#[derive(Error, Debug)]
pub enum RateLimitError {
    /// A limit policy with a non-positive request count or window
    #[error("Invalid limit: max_requests={max_requests}, window_seconds={window_seconds} (both must be positive)")]
    InvalidLimit {
        max_requests: u64,
        window_seconds: f64,
    },

    /// The distributed backing store could not complete the request
    #[error("Backend unavailable: {0}")]
    Backend(#[from] BackendError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RateLimitError {
    /// Whether this error came from the backing store rather than from the caller.
    ///
    /// Callers use this to pick between failing open and failing closed.
    pub fn is_backend(&self) -> bool {
        matches!(self, RateLimitError::Backend(_))
    }
}

/// Failures of the external store behind the distributed strategy.
///
/// None of these imply anything about whether the atomic unit ran.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The round trip did not finish in time
    #[error("store round trip timed out after {0:?}")]
    Timeout(Duration),

    /// The store could not be reached
    #[error("connection failed: {0}")]
    Connection(String),

    /// The store rejected the script or returned an unexpected reply
    #[error("script failed: {0}")]
    Script(String),

    /// Errors reported by the Redis client
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl From<redis::RedisError> for RateLimitError {
    fn from(err: redis::RedisError) -> Self {
        RateLimitError::Backend(BackendError::Redis(err))
    }
}

/// Result type alias for rate limiting operations.
pub type Result<T> = std::result::Result<T, RateLimitError>;
