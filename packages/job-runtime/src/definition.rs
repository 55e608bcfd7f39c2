//! Job definitions: the immutable description of a job and its policies.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::context::JobContext;
use crate::error::{ErrorKind, JobError};
use crate::input::{InputSchema, InputSnapshot};
use crate::schedule::{CatchUpPolicy, Schedule};
use crate::store::LeaseKey;

/// Dispatch priority, used for tie-breaking when multiple fires are due.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl JobPriority {
    /// Integer form for ordering (lower = higher priority).
    pub fn as_i16(&self) -> i16 {
        match self {
            JobPriority::Critical => 0,
            JobPriority::High => 1,
            JobPriority::Normal => 2,
            JobPriority::Low => 3,
        }
    }
}

/// Mutual-exclusion scope for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SingletonPolicy {
    /// No lease; runs of this job may overlap up to `max_concurrent`.
    #[default]
    None,
    /// At most one run of the job across all replicas.
    PerJob,
    /// At most one run per distinct bound-input hash.
    PerJobAndInputHash,
}

impl SingletonPolicy {
    pub fn is_singleton(&self) -> bool {
        !matches!(self, SingletonPolicy::None)
    }
}

/// Retry and backoff behavior for one job.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per fire, including the first. Must be ≥ 1.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub backoff_multiplier: f64,
    pub max_backoff: Duration,
    /// Which error kinds consume retry budget instead of terminating the fire.
    pub retryable_error_kinds: HashSet<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(3_600),
            retryable_error_kinds: [ErrorKind::TransientDependency, ErrorKind::Unexpected]
                .into_iter()
                .collect(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            retryable_error_kinds: HashSet::new(),
            ..Self::default()
        }
    }

    pub fn retries(&self, kind: ErrorKind) -> bool {
        kind.retry_eligible() && self.retryable_error_kinds.contains(&kind)
    }

    /// Backoff before the attempt after `failed_attempt` (1-based), without
    /// jitter: `min(initial * multiplier^(n-1), max)`.
    pub fn backoff_after(&self, failed_attempt: u32) -> Duration {
        let exp = failed_attempt.saturating_sub(1) as i32;
        let scaled = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exp);
        let capped = scaled.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts < 1 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.backoff_multiplier < 1.0 {
            return Err("backoff_multiplier must be at least 1.0".to_string());
        }
        if self.initial_backoff > self.max_backoff {
            return Err("initial_backoff exceeds max_backoff".to_string());
        }
        for kind in &self.retryable_error_kinds {
            if !kind.retry_eligible() {
                return Err(format!("{kind} can never be retried"));
            }
        }
        Ok(())
    }
}

/// The opaque callable registered with a job definition.
///
/// Handlers resolve their own dependencies (captured at registration time)
/// and signal classified failures by returning [`JobError`]; anything else
/// that escapes is recorded as `unexpected`.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: JobContext) -> Result<(), JobError>;
}

/// Adapt an async closure into a [`JobHandler`].
///
/// The closure captures its dependency bundle, in the same way domain
/// handlers capture their service clients.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    struct FnHandler<F>(F);

    #[async_trait]
    impl<F, Fut> JobHandler for FnHandler<F>
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        async fn run(&self, ctx: JobContext) -> Result<(), JobError> {
            (self.0)(ctx).await
        }
    }

    Arc::new(FnHandler(f))
}

/// The immutable description of one job. Built by the host at registration
/// time; the dispatcher caches a snapshot at lease acquisition so in-flight
/// runs are unaffected by hot reloads.
#[derive(Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct JobDefinition {
    pub name: String,

    #[builder(default)]
    pub description: String,

    pub schedule: Schedule,

    #[builder(default = InputSchema::empty())]
    pub input_schema: InputSchema,

    #[builder(default)]
    pub singleton_policy: SingletonPolicy,

    /// Ignored when the job is singleton.
    #[builder(default = 1u32)]
    pub max_concurrent: u32,

    #[builder(default = Duration::from_secs(300))]
    pub timeout: Duration,

    #[builder(default)]
    pub retry_policy: RetryPolicy,

    #[builder(default)]
    pub priority: JobPriority,

    /// Sink identifiers notified on terminal failure, in order.
    #[builder(default)]
    pub alert_channels: Vec<String>,

    /// Falls back to the runtime's `catch_up_default` when unset.
    #[builder(default, setter(strip_option))]
    pub catch_up: Option<CatchUpPolicy>,

    pub handler: Arc<dyn JobHandler>,
}

impl JobDefinition {
    /// Reasons this definition must be rejected at registration.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name must not be empty".to_string());
        }
        if self.timeout.is_zero() {
            return Err("timeout must be positive".to_string());
        }
        if self.max_concurrent < 1 {
            return Err("max_concurrent must be at least 1".to_string());
        }
        self.retry_policy.validate()?;
        self.input_schema.validate()?;
        if self.schedule.is_timed() {
            // Scheduled fires bind declared defaults only.
            for param in self.input_schema.params() {
                if param.required && param.default.is_none() {
                    return Err(format!(
                        "scheduled job cannot require parameter {} without a default",
                        param.name
                    ));
                }
            }
        }
        Ok(())
    }

    /// The lease key for a run with the given inputs, if the job is singleton.
    pub fn lease_key(&self, inputs: &InputSnapshot) -> Option<LeaseKey> {
        match self.singleton_policy {
            SingletonPolicy::None => None,
            SingletonPolicy::PerJob => Some(LeaseKey::per_job(&self.name)),
            SingletonPolicy::PerJobAndInputHash => {
                Some(LeaseKey::per_job_and_hash(&self.name, &inputs.stable_hash()))
            }
        }
    }
}

impl std::fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDefinition")
            .field("name", &self.name)
            .field("schedule", &self.schedule)
            .field("singleton_policy", &self.singleton_policy)
            .field("max_concurrent", &self.max_concurrent)
            .field("timeout", &self.timeout)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}
