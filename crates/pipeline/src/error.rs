//! Error types for the event pipeline

use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Failures of the pipeline's own bookkeeping (ledger and retry queue access)
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl PipelineError {
    /// Whether repeating the same storage call could succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::Database(_))
    }
}

/// Failure reported by (or on behalf of) an event handler
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Retried with backoff until attempts run out
    #[error("{0}")]
    Transient(String),

    /// The event can never succeed; dead-letter without further retries
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The handler panicked; treated like a transient failure
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn transient(msg: impl Into<String>) -> Self {
        HandlerError::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        HandlerError::Permanent(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, HandlerError::Permanent(_))
    }
}
