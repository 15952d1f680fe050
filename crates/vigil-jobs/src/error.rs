//! Error types for the job engine.

use thiserror::Error;

/// Errors that can occur in job engine operations.
#[derive(Debug, Error)]
pub enum JobsError {
    /// Missing or malformed input, e.g. a record without an id.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The job type is disabled, already running, or blocked by its mutex group.
    #[error("job blocked: {0}")]
    JobBlocked(String),

    /// Unknown job or job type.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid engine configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Storage backend failure.
    #[error("store error: {0}")]
    Store(String),

    /// SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl JobsError {
    /// Whether this error is a lock refusal rather than a fault.
    pub fn is_blocked(&self) -> bool {
        matches!(self, JobsError::JobBlocked(_))
    }
}

/// Failure reported by a job callback.
///
/// Returned from [`JobRunnable::execute`](crate::JobRunnable::execute) and
/// consumed by the runner's restart policy. Never propagated past the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub message: String,
}

impl JobFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<String> for JobFailure {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for JobFailure {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<JobsError> for JobFailure {
    fn from(e: JobsError) -> Self {
        Self::new(e.to_string())
    }
}

impl From<std::io::Error> for JobFailure {
    fn from(e: std::io::Error) -> Self {
        Self::new(e.to_string())
    }
}
