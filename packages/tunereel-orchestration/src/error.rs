use std::time::Duration;

use thiserror::Error;
use tunereel_storage::StorageError;

use crate::urlguard::UrlRejection;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{stage}: {message}")]
    Collaborator { stage: &'static str, message: String },

    #[error("url rejected ({reason}): {url}")]
    UrlRejected { url: String, reason: UrlRejection },

    #[error("transient infrastructure error: {0}")]
    TransientInfra(String),

    #[error("stage timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// What the worker does with the task after a handler error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Redeliver through the queue with backoff; no job mutation.
    Retry,
    /// Ack the task and move on; another path already advanced the job.
    Ack,
    /// Ack the task and mark the job failed with a bounded message.
    AckAndFail,
}

impl OrchestratorError {
    pub fn collaborator(stage: &'static str, message: impl Into<String>) -> Self {
        Self::Collaborator {
            stage,
            message: message.into(),
        }
    }

    pub fn invalid_input<E: std::fmt::Display>(e: E) -> Self {
        Self::InvalidInput(e.to_string())
    }

    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    pub fn transient<E: std::fmt::Display>(e: E) -> Self {
        Self::TransientInfra(e.to_string())
    }

    /// Sort an error into the retry / ack / fail-the-job buckets.
    ///
    /// A status conflict or a vanished row means some other delivery already
    /// advanced the job, so the losing task just acks. Infrastructure flaps
    /// and cancellation go back through the queue. Everything else is a
    /// business failure the job cannot recover from.
    pub fn disposition(&self) -> Disposition {
        match self {
            OrchestratorError::Storage(e) if e.is_status_conflict() => Disposition::Ack,
            OrchestratorError::Storage(e) if e.is_not_found() => Disposition::Ack,
            OrchestratorError::Storage(StorageError::Database(_)) => Disposition::Retry,
            OrchestratorError::Storage(_) => Disposition::AckAndFail,
            OrchestratorError::Queue(_) => Disposition::Retry,
            OrchestratorError::TransientInfra(_) => Disposition::Retry,
            OrchestratorError::Timeout(_) => Disposition::Retry,
            OrchestratorError::Cancelled => Disposition::Retry,
            OrchestratorError::InvalidInput(_)
            | OrchestratorError::Collaborator { .. }
            | OrchestratorError::UrlRejected { .. }
            | OrchestratorError::Crypto(_)
            | OrchestratorError::Config(_)
            | OrchestratorError::Other(_) => Disposition::AckAndFail,
        }
    }
}

impl From<redis::RedisError> for OrchestratorError {
    fn from(e: redis::RedisError) -> Self {
        OrchestratorError::Queue(e.to_string())
    }
}
