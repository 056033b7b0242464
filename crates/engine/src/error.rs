//! Error types for the Carepath engine.

use thiserror::Error;

/// Engine-level errors.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Bad input to a lifecycle entry point. Surfaced synchronously to
    /// the caller, never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A referenced entity is missing. Fatal for the current job.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// A side-effecting call failed against an external dependency.
    /// Retried per the lane's backoff policy.
    #[error("Transient error: {0}")]
    Transient(String),

    /// Optimistic concurrency check failed on a versioned save.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Queue broker error.
    #[error("Queue error: {0}")]
    Queue(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether the queue should redeliver a job that failed with this error.
    ///
    /// Validation and NotFound are data problems that retrying cannot fix;
    /// Conflict is resolved by the read-modify-write loop, not the queue.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Transient(_) | EngineError::Queue(_))
    }
}

/// Result type alias using EngineError.
pub type EngineResult<T> = Result<T, EngineError>;
