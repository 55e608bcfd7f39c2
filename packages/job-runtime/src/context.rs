//! The execution context handed to every handler.
//!
//! The context carries run identity, the cancellation signal and deadline,
//! classified failure reporting, metric accumulation, a captured log tail,
//! and child-run triggering. Logging and metric recording are safe to call
//! from any number of concurrent operations spawned by the handler.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::error::{ErrorKind, JobError, StoreError, TriggerError};
use crate::input::InputSnapshot;
use crate::run::RunRecord;

/// How many log records are kept on the run for short-term retrieval.
const LOG_TAIL_CAPACITY: usize = 256;

/// One captured log record, attached to the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub at: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

/// A child-run enqueue request flowing from a handler into the runtime.
#[derive(Debug)]
pub struct ChildRequest {
    pub job_name: String,
    pub inputs: Value,
    /// Set when the request comes from inside another run.
    pub parent_run_id: Option<Uuid>,
    /// Chain depth of the requesting run plus one.
    pub depth: u32,
    pub cause: Option<String>,
    pub dedupe_key: Option<String>,
    /// When set, the runtime registers a completion watch before submitting.
    pub watch: bool,
    /// One-shot mode for the CLI: the run fails terminally instead of
    /// consuming its retry budget.
    pub suppress_retry: bool,
}

/// Result of a child trigger.
pub struct TriggeredChild {
    pub run_id: Uuid,
    /// Present when the request asked to watch; resolves with the terminal
    /// run record.
    pub completion: Option<oneshot::Receiver<RunRecord>>,
}

/// The runtime-side half of `JobContext::trigger`.
#[async_trait]
pub trait ChildTrigger: Send + Sync {
    async fn trigger_child(&self, request: ChildRequest) -> Result<TriggeredChild, TriggerError>;
}

pub(crate) struct ContextInner {
    pub job_name: String,
    pub run_id: Uuid,
    pub attempt: i32,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub replica_id: String,
    pub clock: SharedClock,
    pub cancel: CancellationToken,
    pub deadline: DateTime<Utc>,
    pub inputs: InputSnapshot,
    pub depth: u32,
    pub max_trigger_depth: u32,
    pub trigger: Arc<dyn ChildTrigger>,
    metrics: Mutex<BTreeMap<String, f64>>,
    logs: Mutex<VecDeque<LogRecord>>,
    failure: Mutex<Option<JobError>>,
}

/// Cheaply cloneable handle; all state lives behind the shared inner.
#[derive(Clone)]
pub struct JobContext {
    inner: Arc<ContextInner>,
}

impl JobContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        job_name: String,
        run_id: Uuid,
        attempt: i32,
        scheduled_for: Option<DateTime<Utc>>,
        replica_id: String,
        clock: SharedClock,
        cancel: CancellationToken,
        deadline: DateTime<Utc>,
        inputs: InputSnapshot,
        depth: u32,
        max_trigger_depth: u32,
        trigger: Arc<dyn ChildTrigger>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                job_name,
                run_id,
                attempt,
                scheduled_for,
                replica_id,
                clock,
                cancel,
                deadline,
                inputs,
                depth,
                max_trigger_depth,
                trigger,
                metrics: Mutex::new(BTreeMap::new()),
                logs: Mutex::new(VecDeque::new()),
                failure: Mutex::new(None),
            }),
        }
    }

    pub fn job_name(&self) -> &str {
        &self.inner.job_name
    }

    pub fn run_id(&self) -> Uuid {
        self.inner.run_id
    }

    pub fn attempt(&self) -> i32 {
        self.inner.attempt
    }

    pub fn scheduled_for(&self) -> Option<DateTime<Utc>> {
        self.inner.scheduled_for
    }

    pub fn replica_id(&self) -> &str {
        &self.inner.replica_id
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    pub fn inputs(&self) -> &InputSnapshot {
        &self.inner.inputs
    }

    /// The instant at which [`JobContext::done`] will fire.
    pub fn deadline(&self) -> DateTime<Utc> {
        self.inner.deadline
    }

    /// Resolves when the run is cancelled or its deadline trips. Handlers are
    /// expected to observe this at I/O boundaries.
    pub async fn done(&self) {
        self.inner.cancel.cancelled().await;
    }

    pub fn is_done(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Record a classified failure and get the error value to return.
    pub fn fail(&self, kind: ErrorKind, message: impl Into<String>) -> JobError {
        let error = JobError::new(kind, message);
        self.record_failure(&error);
        error
    }

    /// Record a classified failure wrapping an underlying error.
    pub fn fail_with(&self, kind: ErrorKind, error: anyhow::Error) -> JobError {
        let error = JobError::with_source(kind, error);
        self.record_failure(&error);
        error
    }

    fn record_failure(&self, error: &JobError) {
        let mut slot = self.inner.failure.lock().unwrap_or_else(|e| e.into_inner());
        // First classification wins; later calls refine nothing.
        slot.get_or_insert_with(|| error.clone());
    }

    /// The failure recorded through `fail`/`fail_with`, if any. Consulted by
    /// the execution engine when a handler returns `Ok` anyway.
    pub(crate) fn recorded_failure(&self) -> Option<JobError> {
        self.inner
            .failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Accumulate a numeric counter on the run record.
    pub fn metric(&self, name: &str, value: f64) {
        let mut metrics = self.inner.metrics.lock().unwrap_or_else(|e| e.into_inner());
        *metrics.entry(name.to_string()).or_insert(0.0) += value;
    }

    pub(crate) fn metrics_json(&self) -> Value {
        let metrics = self.inner.metrics.lock().unwrap_or_else(|e| e.into_inner());
        Value::Object(
            metrics
                .iter()
                .map(|(k, v)| {
                    let number = serde_json::Number::from_f64(*v)
                        .unwrap_or_else(|| serde_json::Number::from(0));
                    (k.clone(), Value::Number(number))
                })
                .collect(),
        )
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log("debug", message.into());
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log("info", message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log("warn", message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log("error", message.into());
    }

    fn log(&self, level: &str, message: String) {
        match level {
            "debug" => tracing::debug!(
                job_name = %self.inner.job_name,
                run_id = %self.inner.run_id,
                attempt = self.inner.attempt,
                "{message}"
            ),
            "warn" => tracing::warn!(
                job_name = %self.inner.job_name,
                run_id = %self.inner.run_id,
                attempt = self.inner.attempt,
                "{message}"
            ),
            "error" => tracing::error!(
                job_name = %self.inner.job_name,
                run_id = %self.inner.run_id,
                attempt = self.inner.attempt,
                "{message}"
            ),
            _ => tracing::info!(
                job_name = %self.inner.job_name,
                run_id = %self.inner.run_id,
                attempt = self.inner.attempt,
                "{message}"
            ),
        }

        let mut logs = self.inner.logs.lock().unwrap_or_else(|e| e.into_inner());
        if logs.len() == LOG_TAIL_CAPACITY {
            logs.pop_front();
        }
        logs.push_back(LogRecord {
            at: self.inner.clock.now(),
            level: level.to_string(),
            message,
        });
    }

    pub(crate) fn log_tail_json(&self) -> Value {
        let logs = self.inner.logs.lock().unwrap_or_else(|e| e.into_inner());
        serde_json::to_value(logs.iter().collect::<Vec<_>>()).unwrap_or(Value::Array(Vec::new()))
    }

    /// Enqueue a child run through the registry; returns immediately with the
    /// child's run id. The child obeys its own retry and singleton policies.
    pub async fn trigger(&self, job_name: &str, inputs: Value) -> Result<Uuid, TriggerError> {
        let child = self.trigger_inner(job_name, inputs, false).await?;
        Ok(child.run_id)
    }

    /// Enqueue a child run and block until it reaches a terminal state,
    /// honoring this run's deadline and cancellation.
    pub async fn trigger_and_wait(
        &self,
        job_name: &str,
        inputs: Value,
    ) -> Result<RunRecord, TriggerError> {
        let child = self.trigger_inner(job_name, inputs, true).await?;
        let completion = child.completion.ok_or_else(|| {
            TriggerError::Store(StoreError::Backend(anyhow::anyhow!(
                "no completion watch registered"
            )))
        })?;

        tokio::select! {
            biased;
            _ = self.done() => Err(TriggerError::Interrupted),
            record = completion => {
                record.map_err(|_| TriggerError::Store(StoreError::Backend(anyhow::anyhow!(
                    "child run completion channel closed"
                ))))
            }
        }
    }

    async fn trigger_inner(
        &self,
        job_name: &str,
        inputs: Value,
        watch: bool,
    ) -> Result<TriggeredChild, TriggerError> {
        let depth = self.inner.depth + 1;
        if depth > self.inner.max_trigger_depth {
            return Err(TriggerError::DepthExceeded {
                depth,
                max: self.inner.max_trigger_depth,
            });
        }

        self.inner
            .trigger
            .trigger_child(ChildRequest {
                job_name: job_name.to_string(),
                inputs,
                parent_run_id: Some(self.inner.run_id),
                depth,
                cause: None,
                dedupe_key: None,
                watch,
                suppress_retry: false,
            })
            .await
    }

    /// Internal cancellation handle used by the execution engine.
    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }
}

#[cfg(test)]
mod tests {
    use crate::clock::SystemClock;

    use super::*;

    struct NoTrigger;

    #[async_trait]
    impl ChildTrigger for NoTrigger {
        async fn trigger_child(
            &self,
            _request: ChildRequest,
        ) -> Result<TriggeredChild, TriggerError> {
            Err(TriggerError::ShuttingDown)
        }
    }

    fn context(depth: u32) -> JobContext {
        JobContext::new(
            "sync_trips".to_string(),
            Uuid::new_v4(),
            1,
            None,
            "replica-1".to_string(),
            Arc::new(SystemClock),
            CancellationToken::new(),
            Utc::now() + chrono::Duration::seconds(60),
            InputSnapshot::default(),
            depth,
            8,
            Arc::new(NoTrigger),
        )
    }

    #[tokio::test]
    async fn metrics_accumulate() {
        let ctx = context(0);
        ctx.metric("rows", 10.0);
        ctx.metric("rows", 5.0);
        ctx.metric("bytes", 128.0);

        let json = ctx.metrics_json();
        assert_eq!(json["rows"], 15.0);
        assert_eq!(json["bytes"], 128.0);
    }

    #[tokio::test]
    async fn first_recorded_failure_wins() {
        let ctx = context(0);
        let _ = ctx.fail(ErrorKind::TransientDependency, "first");
        let _ = ctx.fail(ErrorKind::PermanentDependency, "second");

        let recorded = ctx.recorded_failure().unwrap();
        assert_eq!(recorded.kind, ErrorKind::TransientDependency);
        assert_eq!(recorded.message, "first");
    }

    #[tokio::test]
    async fn log_tail_is_bounded() {
        let ctx = context(0);
        for i in 0..300 {
            ctx.info(format!("line {i}"));
        }
        let tail = ctx.log_tail_json();
        let array = tail.as_array().unwrap();
        assert_eq!(array.len(), LOG_TAIL_CAPACITY);
        assert_eq!(array[0]["message"], "line 44");
    }

    #[tokio::test]
    async fn trigger_depth_is_bounded() {
        let ctx = context(8);
        let err = ctx
            .trigger("child", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, TriggerError::DepthExceeded { depth: 9, max: 8 }));
    }

    #[tokio::test]
    async fn done_fires_on_cancellation() {
        let ctx = context(0);
        let token = ctx.cancel_token();
        assert!(!ctx.is_done());
        token.cancel();
        ctx.done().await;
        assert!(ctx.is_done());
    }
}
