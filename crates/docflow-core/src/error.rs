//! Error types for docflow.

use thiserror::Error;
use uuid::Uuid;

use crate::models::JobStatus;

/// Result type alias using docflow's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for docflow operations.
///
/// These are infrastructure errors (storage, queue, configuration). Failures
/// inside a pipeline stage are reported as [`crate::StageError`] and recorded
/// on the job instead.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Job not found
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    /// Batch not found
    #[error("Batch not found: {0}")]
    BatchNotFound(Uuid),

    /// A job update was rejected by the job state machine
    #[error("Invalid transition for job {job_id}: {from:?} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: &'static str,
    },

    /// The durable task queue could not be reached (fatal at scheduler startup)
    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    /// Worker pool could not be allocated
    #[error("Worker pool error: {0}")]
    WorkerPool(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Request(e.to_string())
    }
}
