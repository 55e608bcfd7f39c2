//! Run records: one row per attempt, with monotonic status transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::ErrorKind;

/// Lifecycle state of one attempt.
///
/// Transitions are monotonic: `queued → leased → running` followed by exactly
/// one terminal state. Leased may be skipped for non-singleton runs going
/// straight from queued to running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "run_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Queued,
    Leased,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
    Dead,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded
                | RunStatus::Failed
                | RunStatus::TimedOut
                | RunStatus::Cancelled
                | RunStatus::Dead
        )
    }

    /// Whether a transition from `self` to `next` is allowed.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        if *self == next {
            return false;
        }
        match self {
            RunStatus::Queued => matches!(
                next,
                RunStatus::Leased | RunStatus::Running | RunStatus::Cancelled
            ),
            RunStatus::Leased => matches!(next, RunStatus::Running | RunStatus::Cancelled),
            RunStatus::Running => next.is_terminal(),
            // Terminal states are frozen.
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Leased => "leased",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::TimedOut => "timed_out",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Dead => "dead",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempt of one fire, as persisted in the run store.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub job_name: String,
    /// 1-based; retries of the same fire increment it.
    pub attempt: i32,
    /// The fire this attempt serves. Null for manual and event runs.
    pub scheduled_for: Option<DateTime<Utc>>,
    pub enqueued_at: DateTime<Utc>,
    pub leased_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub replica_id: String,
    pub status: RunStatus,
    /// The bound inputs this attempt executed with. Retries reuse it verbatim.
    pub input_snapshot: Value,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub error_stack: Option<String>,
    /// Free-form numeric counters recorded by the handler, plus duration_ms.
    pub metrics: Value,
    /// Bounded tail of the run's structured log records.
    pub log_tail: Value,
    /// Set when the run was enqueued by another run through the registry.
    pub parent_run_id: Option<Uuid>,
    /// Event source or operator note that caused a non-scheduled run.
    pub trigger_cause: Option<String>,
    /// Caller-supplied idempotent-enqueue key, when provided.
    pub dedupe_key: Option<String>,
}

impl RunRecord {
    /// A freshly enqueued record, before lease or execution.
    pub fn new(
        run_id: Uuid,
        job_name: impl Into<String>,
        attempt: i32,
        scheduled_for: Option<DateTime<Utc>>,
        input_snapshot: Value,
        replica_id: impl Into<String>,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            job_name: job_name.into(),
            attempt,
            scheduled_for,
            enqueued_at,
            leased_at: None,
            started_at: None,
            finished_at: None,
            replica_id: replica_id.into(),
            status: RunStatus::Queued,
            input_snapshot,
            error_kind: None,
            error_message: None,
            error_stack: None,
            metrics: Value::Object(serde_json::Map::new()),
            log_tail: Value::Array(Vec::new()),
            parent_run_id: None,
            trigger_cause: None,
            dedupe_key: None,
        }
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// Partial update applied by the dispatcher and workers.
///
/// `update_run` rejects patches whose status would violate the monotonic
/// transition rules; metrics and the log tail stay writable on terminal
/// records.
#[derive(Debug, Clone, Default)]
pub struct RunPatch {
    pub status: Option<RunStatus>,
    pub leased_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub error_stack: Option<String>,
    pub metrics: Option<Value>,
    pub log_tail: Option<Value>,
}

impl RunPatch {
    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_leased_at(mut self, at: DateTime<Utc>) -> Self {
        self.leased_at = Some(at);
        self
    }

    pub fn with_started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn with_finished_at(mut self, at: DateTime<Utc>) -> Self {
        self.finished_at = Some(at);
        self
    }

    pub fn with_error(mut self, kind: ErrorKind, message: impl Into<String>) -> Self {
        self.error_kind = Some(kind);
        self.error_message = Some(message.into());
        self
    }

    pub fn with_error_stack(mut self, stack: impl Into<String>) -> Self {
        self.error_stack = Some(stack.into());
        self
    }

    pub fn with_metrics(mut self, metrics: Value) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_log_tail(mut self, log_tail: Value) -> Self {
        self.log_tail = Some(log_tail);
        self
    }

    /// Apply to a record in place. The caller has already checked the
    /// transition; this only copies fields.
    pub fn apply(self, record: &mut RunRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(at) = self.leased_at {
            record.leased_at = Some(at);
        }
        if let Some(at) = self.started_at {
            record.started_at = Some(at);
        }
        if let Some(at) = self.finished_at {
            record.finished_at = Some(at);
        }
        if let Some(kind) = self.error_kind {
            record.error_kind = Some(kind);
        }
        if let Some(message) = self.error_message {
            record.error_message = Some(message);
        }
        if let Some(stack) = self.error_stack {
            record.error_stack = Some(stack);
        }
        if let Some(metrics) = self.metrics {
            record.metrics = metrics;
        }
        if let Some(log_tail) = self.log_tail {
            record.log_tail = log_tail;
        }
    }
}
