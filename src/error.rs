use thiserror::Error;

/// Convenience type alias for Results with SpiralError
pub type Result<T> = std::result::Result<T, SpiralError>;

/// Main error type for the kernel.
///
/// Each variant corresponds to one of the abstract error kinds a caller can
/// observe: timeouts on a blocking operation, explicit cancellation, lookups
/// against entities that no longer exist, capacity exhaustion, malformed
/// input, and failures a caller may or may not retry.
#[derive(Error, Debug)]
pub enum SpiralError {
    #[error("operation timed out: {message}")]
    Timeout { message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("capacity exhausted: {0}")]
    Full(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transient failure: {0}")]
    TransientFailure(String),

    #[error("permanent failure: {0}")]
    PermanentFailure(String),

    #[error("agent error: {message}")]
    Agent { message: String },

    #[error("task execution error: {task_id} - {message}")]
    TaskExecution { task_id: String, message: String },

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("rate limit exceeded: {message}")]
    RateLimit { message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl SpiralError {
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    pub fn agent(message: impl Into<String>) -> Self {
        Self::Agent {
            message: message.into(),
        }
    }
}
