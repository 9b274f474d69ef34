//! Stage error taxonomy.
//!
//! Every pipeline stage returns either its typed output or a [`StageError`].
//! The error's [`ErrorKind`] is all the retry policy looks at; the
//! [`FailureCategory`] is kept for reporting and for callers deciding what to
//! re-submit.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Whether a stage failure may succeed on a later attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Retryable,
    Terminal,
}

/// What went wrong, independent of whether it is retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// Content could not be extracted (unreadable, unsupported format).
    Extraction,
    /// Classifier rejected the request.
    Classification,
    /// Classification service could not be reached or returned 5xx.
    ServiceUnavailable,
    /// Classification service answered with something unparsable.
    MalformedResponse,
    /// Upstream service asked us to slow down.
    RateLimited,
    /// Embedding request failed (normally degraded to a fallback vector).
    Embedding,
    /// Result could not be persisted.
    Storage,
    /// Stage exceeded its timeout.
    Timeout,
    /// The execution unit running the job died mid-job.
    WorkerCrash,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::Extraction => "extraction",
            FailureCategory::Classification => "classification",
            FailureCategory::ServiceUnavailable => "service_unavailable",
            FailureCategory::MalformedResponse => "malformed_response",
            FailureCategory::RateLimited => "rate_limited",
            FailureCategory::Embedding => "embedding",
            FailureCategory::Storage => "storage",
            FailureCategory::Timeout => "timeout",
            FailureCategory::WorkerCrash => "worker_crash",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed stage invocation, recorded on the job as `last_error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{category} error ({kind:?}){}: {message}", stage.as_deref().map(|s| format!(" in {s}")).unwrap_or_default())]
pub struct StageError {
    pub category: FailureCategory,
    pub kind: ErrorKind,
    /// Stage that produced the error; filled in by the pipeline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    pub message: String,
}

/// Result of a single stage call.
pub type StageOutcome<T> = std::result::Result<T, StageError>;

impl StageError {
    pub fn new(category: FailureCategory, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            category,
            kind,
            stage: None,
            message: message.into(),
        }
    }

    pub fn retryable(category: FailureCategory, message: impl Into<String>) -> Self {
        Self::new(category, ErrorKind::Retryable, message)
    }

    pub fn terminal(category: FailureCategory, message: impl Into<String>) -> Self {
        Self::new(category, ErrorKind::Terminal, message)
    }

    /// Unsupported input format; never retried.
    pub fn unsupported_format(message: impl Into<String>) -> Self {
        Self::terminal(FailureCategory::Extraction, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::retryable(FailureCategory::ServiceUnavailable, message)
    }

    pub fn malformed_response(message: impl Into<String>) -> Self {
        Self::retryable(FailureCategory::MalformedResponse, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::retryable(FailureCategory::RateLimited, message)
    }

    pub fn timeout(stage: &str, after: Duration) -> Self {
        Self::retryable(
            FailureCategory::Timeout,
            format!("stage exceeded timeout of {}ms", after.as_millis()),
        )
        .in_stage(stage)
    }

    pub fn worker_crash(message: impl Into<String>) -> Self {
        Self::retryable(FailureCategory::WorkerCrash, message)
    }

    /// Tag the error with the stage that produced it (keeps an existing tag).
    pub fn in_stage(mut self, stage: &str) -> Self {
        if self.stage.is_none() {
            self.stage = Some(stage.to_string());
        }
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::Retryable
    }
}
