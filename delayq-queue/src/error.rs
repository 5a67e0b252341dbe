//! Error types for queue operations.

use thiserror::Error;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue-specific errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Redis connection or command error
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] delayq_redis::RedisError),

    /// Backing store error that is not tied to a specific client
    #[error("Store error: {0}")]
    Store(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Queue name not present in the registry
    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    /// Delayed enqueue on a queue without a delayed structure
    #[error("Queue {0} does not accept delayed messages")]
    DelayNotSupported(String),

    /// No handler registered for a queue the pool was asked to serve
    #[error("No handler registered for queue: {0}")]
    NoHandler(String),

    /// Engine already running
    #[error("Engine already running")]
    AlreadyRunning,

    /// Generic error
    #[error("Queue error: {0}")]
    Other(String),
}

impl QueueError {
    /// Whether a background loop should pause and try again.
    pub fn is_transient(&self) -> bool {
        match self {
            #[cfg(feature = "redis")]
            Self::Redis(e) => e.is_retryable(),
            Self::Store(_) => true,
            _ => false,
        }
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        Self::Redis(delayq_redis::RedisError::from(err))
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
