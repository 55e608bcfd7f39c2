//! Failure taxonomy and public error types.
//!
//! `ErrorKind` is the only failure classification the runtime understands.
//! Handlers signal classified failures through [`JobError`]; anything that
//! escapes a handler unclassified is mapped to [`ErrorKind::Unexpected`].
//! `anyhow` stays internal transport — the types here are what crosses the
//! runtime's public boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::run::RunStatus;

/// Classification of run failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "error_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Input binding failure. Never retried.
    InvalidInput,
    /// A trigger referenced a name the registry does not know. Never retried.
    UnknownJob,
    /// An external store/service reported a temporary condition.
    TransientDependency,
    /// An external service reported a definitive rejection. Never retried.
    PermanentDependency,
    /// The run's deadline tripped. Retried only if the policy says so.
    Timeout,
    /// Shutdown or lease loss. Not counted against the retry budget.
    Cancelled,
    /// Anything the handler did not classify.
    Unexpected,
}

impl ErrorKind {
    /// Whether a retry policy may list this kind at all.
    ///
    /// `InvalidInput`, `UnknownJob`, and `PermanentDependency` are definitive;
    /// `Cancelled` is outside the retry budget entirely.
    pub fn retry_eligible(&self) -> bool {
        matches!(
            self,
            ErrorKind::TransientDependency | ErrorKind::Timeout | ErrorKind::Unexpected
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::UnknownJob => "unknown_job",
            ErrorKind::TransientDependency => "transient_dependency",
            ErrorKind::PermanentDependency => "permanent_dependency",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unexpected => "unexpected",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure returned by (or recorded on behalf of) a handler.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
    /// Rendered cause chain, when the failure wraps an underlying error.
    pub stack: Option<String>,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stack: None,
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransientDependency, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermanentDependency, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    /// Wrap an underlying error, preserving its chain for the run record.
    pub fn with_source(kind: ErrorKind, error: anyhow::Error) -> Self {
        Self {
            kind,
            message: error.to_string(),
            stack: Some(format!("{error:?}")),
        }
    }
}

impl From<anyhow::Error> for JobError {
    fn from(error: anyhow::Error) -> Self {
        Self::with_source(ErrorKind::Unexpected, error)
    }
}

/// Errors surfaced by run store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("run {0} already exists")]
    DuplicateRun(Uuid),

    #[error("illegal status transition for run {run_id}: {from} -> {to}")]
    IllegalTransition {
        run_id: Uuid,
        from: RunStatus,
        to: RunStatus,
    },

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl From<StoreError> for JobError {
    fn from(error: StoreError) -> Self {
        JobError::with_source(ErrorKind::Unexpected, anyhow::Error::new(error))
    }
}

/// Errors raised by the job registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate job name: {0}")]
    DuplicateName(String),

    #[error("invalid definition for job {name}: {reason}")]
    InvalidDefinition { name: String, reason: String },

    #[error("unknown job: {0}")]
    UnknownJob(String),

    /// Consolidated startup failure listing every offending job.
    #[error("invalid job catalog:\n{}", problems.join("\n"))]
    InvalidCatalog { problems: Vec<String> },
}

/// Errors returned by `trigger` and the CLI `run` path.
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("unknown job: {0}")]
    UnknownJob(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The singleton lease for the computed key is held elsewhere.
    #[error("job {job} is already running (lease held by {holder})")]
    SingletonHeld { job: String, holder: String },

    /// The worker pool refused the run (queue full or admission timeout).
    #[error("worker pool rejected run for {job}: {reason}")]
    Rejected { job: String, reason: String },

    #[error("trigger depth {depth} exceeds the configured bound {max}")]
    DepthExceeded { depth: u32, max: u32 },

    #[error("runtime is shutting down")]
    ShuttingDown,

    /// A synchronous child wait was cut short by the parent's cancellation
    /// or deadline.
    #[error("wait interrupted by cancellation or deadline")]
    Interrupted,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<TriggerError> for JobError {
    fn from(error: TriggerError) -> Self {
        let message = error.to_string();
        match error {
            TriggerError::UnknownJob(_) => JobError::new(ErrorKind::UnknownJob, message),
            TriggerError::InvalidInput(_) | TriggerError::DepthExceeded { .. } => {
                JobError::new(ErrorKind::InvalidInput, message)
            }
            TriggerError::SingletonHeld { .. } | TriggerError::Rejected { .. } => {
                JobError::new(ErrorKind::TransientDependency, message)
            }
            TriggerError::ShuttingDown | TriggerError::Interrupted => {
                JobError::new(ErrorKind::Cancelled, message)
            }
            TriggerError::Store(source) => JobError::from(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definitive_kinds_are_not_retry_eligible() {
        assert!(!ErrorKind::InvalidInput.retry_eligible());
        assert!(!ErrorKind::UnknownJob.retry_eligible());
        assert!(!ErrorKind::PermanentDependency.retry_eligible());
        assert!(!ErrorKind::Cancelled.retry_eligible());
    }

    #[test]
    fn transient_and_timeout_are_retry_eligible() {
        assert!(ErrorKind::TransientDependency.retry_eligible());
        assert!(ErrorKind::Timeout.retry_eligible());
        assert!(ErrorKind::Unexpected.retry_eligible());
    }

    #[test]
    fn unclassified_errors_map_to_unexpected() {
        let err: JobError = anyhow::anyhow!("boom").into();
        assert_eq!(err.kind, ErrorKind::Unexpected);
        assert_eq!(err.message, "boom");
        assert!(err.stack.is_some());
    }

    #[test]
    fn store_errors_map_to_unexpected() {
        let err: JobError = StoreError::RunNotFound(Uuid::new_v4()).into();
        assert_eq!(err.kind, ErrorKind::Unexpected);
        assert!(err.message.contains("not found"));
        assert!(err.stack.is_some());
    }

    #[test]
    fn catalog_error_lists_every_problem() {
        let err = RegistryError::InvalidCatalog {
            problems: vec!["a: bad timeout".into(), "b: bad schedule".into()],
        };
        let text = err.to_string();
        assert!(text.contains("a: bad timeout"));
        assert!(text.contains("b: bad schedule"));
    }
}
