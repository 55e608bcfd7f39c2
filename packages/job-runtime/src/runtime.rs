//! The runtime facade: wiring, lifecycle, and the host-facing surface.
//!
//! `JobRuntime::builder(...)` assembles the dispatcher, worker pool, alert
//! router, and completion hub around a registry and a run store, `start`
//! brings the loops up, and `shutdown` tears them down gracefully or
//! immediately. Triggers, status queries, and dead-letter replay all go
//! through here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::alert::{AlertRouter, AlertSink};
use crate::clock::{ReplicaId, SharedClock, SystemClock};
use crate::context::{ChildRequest, ChildTrigger, TriggeredChild};
use crate::dispatcher::{DispatchCore, DispatchMsg, Dispatcher};
use crate::error::{JobError, StoreError, TriggerError};
use crate::metrics::{NullMetrics, SharedMetrics};
use crate::registry::JobRegistry;
use crate::run::RunRecord;
use crate::store::{RunFilter, RunStore};
use crate::worker::{Admission, CompletionHub, ExecEnv, WorkerPool};
use crate::RuntimeConfig;

/// How to stop the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Stop dispatching, cancel in-flight runs, wait out the grace window.
    Graceful,
    /// Abort everything now; in-flight runs are marked cancelled.
    Immediate,
}

/// Optional attributes for an imperative trigger.
#[derive(Debug, Clone, Default)]
pub struct TriggerOptions {
    /// Recorded on the run as its cause (event id, operator note).
    pub cause: Option<String>,
    /// Idempotent-enqueue key: an active run with the same key is reused.
    pub dedupe_key: Option<String>,
    /// One-shot mode: a failure terminates the run instead of consuming its
    /// retry budget (the CLI default).
    pub suppress_retry: bool,
}

/// Channel-backed trigger service; the dispatcher loop does the actual
/// lease acquisition and submission.
struct TriggerService {
    tx: mpsc::UnboundedSender<DispatchMsg>,
}

#[async_trait]
impl ChildTrigger for TriggerService {
    async fn trigger_child(&self, request: ChildRequest) -> Result<TriggeredChild, TriggerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(DispatchMsg::Trigger {
                request,
                reply: reply_tx,
            })
            .map_err(|_| TriggerError::ShuttingDown)?;
        reply_rx.await.map_err(|_| TriggerError::ShuttingDown)?
    }
}

pub struct RuntimeBuilder {
    config: RuntimeConfig,
    clock: SharedClock,
    replica_id: Option<ReplicaId>,
    registry: Arc<JobRegistry>,
    store: Arc<dyn RunStore>,
    metrics: SharedMetrics,
    alert_sinks: Vec<(String, Arc<dyn AlertSink>)>,
}

impl RuntimeBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn replica_id(mut self, replica_id: ReplicaId) -> Self {
        self.replica_id = Some(replica_id);
        self
    }

    pub fn metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Register an alert sink for a channel id.
    pub fn alert_sink(mut self, channel_id: impl Into<String>, sink: Arc<dyn AlertSink>) -> Self {
        self.alert_sinks.push((channel_id.into(), sink));
        self
    }

    /// Bring up the dispatcher and worker pool.
    pub async fn start(self) -> anyhow::Result<JobRuntime> {
        self.config.validate()?;
        let replica_id = self.replica_id.unwrap_or_else(ReplicaId::detect);
        info!(
            replica_id = %replica_id,
            workers = self.config.workers,
            queue = self.config.queue_capacity,
            jobs = self.registry.len(),
            "job runtime starting"
        );

        let shutdown = CancellationToken::new();
        // Fired by a second shutdown signal to cut a graceful join short.
        let abort = CancellationToken::new();
        let completions = CompletionHub::default();
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let (pool_handle, pool_rx) = WorkerPool::channel(self.config.queue_capacity);

        let mut alerts = AlertRouter::new(
            Arc::clone(&self.clock),
            self.config.alert_failure_threshold,
        );
        for (channel, sink) in self.alert_sinks {
            alerts.register(channel, sink);
        }
        let alerts = Arc::new(alerts);

        let trigger_service: Arc<dyn ChildTrigger> = Arc::new(TriggerService {
            tx: dispatch_tx.clone(),
        });

        let env = Arc::new(ExecEnv {
            config: self.config.clone(),
            clock: Arc::clone(&self.clock),
            replica_id: replica_id.as_str().to_string(),
            store: Arc::clone(&self.store),
            metrics: Arc::clone(&self.metrics),
            alerts,
            completions: completions.clone(),
            child_trigger: Arc::clone(&trigger_service),
            dispatch_tx: dispatch_tx.clone(),
            shutdown: shutdown.clone(),
            admission: Admission::default(),
            running: Default::default(),
        });

        let pool = WorkerPool::start(Arc::clone(&env), pool_rx);

        let core = Arc::new(DispatchCore {
            config: self.config.clone(),
            clock: Arc::clone(&self.clock),
            replica_id: replica_id.as_str().to_string(),
            store: Arc::clone(&self.store),
            metrics: Arc::clone(&self.metrics),
            pool: pool_handle,
            completions: completions.clone(),
        });

        let dispatcher = Dispatcher::new(
            core,
            Arc::clone(&self.registry),
            dispatch_rx,
            shutdown.clone(),
        );
        let dispatcher_handle = tokio::spawn(dispatcher.run());

        Ok(JobRuntime {
            inner: Arc::new(RuntimeInner {
                config: self.config,
                clock: self.clock,
                replica_id,
                registry: self.registry,
                store: self.store,
                trigger_service,
                dispatcher_handle: Mutex::new(Some(dispatcher_handle)),
                pool: Mutex::new(Some(pool)),
                shutdown,
                abort,
                stopped: AtomicBool::new(false),
            }),
        })
    }
}

struct RuntimeInner {
    config: RuntimeConfig,
    clock: SharedClock,
    replica_id: ReplicaId,
    registry: Arc<JobRegistry>,
    store: Arc<dyn RunStore>,
    trigger_service: Arc<dyn ChildTrigger>,
    dispatcher_handle: Mutex<Option<JoinHandle<()>>>,
    pool: Mutex<Option<WorkerPool>>,
    shutdown: CancellationToken,
    /// Escalation signal: an immediate (or repeated) shutdown fires this so
    /// an in-flight graceful join stops waiting and aborts the slots.
    abort: CancellationToken,
    stopped: AtomicBool,
}

/// Handle to a running replica of the job runtime. Cheap to clone.
#[derive(Clone)]
pub struct JobRuntime {
    inner: Arc<RuntimeInner>,
}

impl JobRuntime {
    pub fn builder(registry: Arc<JobRegistry>, store: Arc<dyn RunStore>) -> RuntimeBuilder {
        RuntimeBuilder {
            config: RuntimeConfig::default(),
            clock: Arc::new(SystemClock),
            replica_id: None,
            registry,
            store,
            metrics: Arc::new(NullMetrics),
            alert_sinks: Vec::new(),
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.inner.registry
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.inner.store
    }

    pub fn replica_id(&self) -> &ReplicaId {
        &self.inner.replica_id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Imperatively enqueue a run; honors the job's singleton policy.
    pub async fn trigger(&self, job_name: &str, inputs: Value) -> Result<Uuid, TriggerError> {
        self.trigger_with(job_name, inputs, TriggerOptions::default())
            .await
    }

    pub async fn trigger_with(
        &self,
        job_name: &str,
        inputs: Value,
        options: TriggerOptions,
    ) -> Result<Uuid, TriggerError> {
        let child = self
            .inner
            .trigger_service
            .trigger_child(ChildRequest {
                job_name: job_name.to_string(),
                inputs,
                parent_run_id: None,
                depth: 0,
                cause: options.cause,
                dedupe_key: options.dedupe_key,
                watch: false,
                suppress_retry: options.suppress_retry,
            })
            .await?;
        Ok(child.run_id)
    }

    /// Enqueue a run and wait for its terminal record (CLI `run` path).
    pub async fn run_to_completion(
        &self,
        job_name: &str,
        inputs: Value,
        options: TriggerOptions,
    ) -> Result<RunRecord, TriggerError> {
        let child = self
            .inner
            .trigger_service
            .trigger_child(ChildRequest {
                job_name: job_name.to_string(),
                inputs,
                parent_run_id: None,
                depth: 0,
                cause: options.cause,
                dedupe_key: options.dedupe_key,
                watch: true,
                suppress_retry: options.suppress_retry,
            })
            .await?;

        match child.completion {
            Some(completion) => completion.await.map_err(|_| {
                TriggerError::Store(StoreError::Backend(anyhow::anyhow!(
                    "run completion channel closed"
                )))
            }),
            None => {
                // Dedupe reuse without a watch slot: fall back to polling the
                // store for the terminal record.
                self.poll_terminal(child.run_id).await
            }
        }
    }

    /// Like [`run_to_completion`](Self::run_to_completion), but when the job's
    /// retry policy schedules further attempts, follow the chain and return
    /// the fire's final record.
    pub async fn run_fire_to_completion(
        &self,
        job_name: &str,
        inputs: Value,
        options: TriggerOptions,
    ) -> Result<RunRecord, TriggerError> {
        let mut record = self.run_to_completion(job_name, inputs, options).await?;

        loop {
            let Ok(def) = self.inner.registry.lookup(&record.job_name) else {
                return Ok(record);
            };
            let expects_retry = matches!(
                record.status,
                crate::run::RunStatus::Failed | crate::run::RunStatus::TimedOut
            ) && record
                .error_kind
                .map(|kind| def.retry_policy.retries(kind))
                .unwrap_or(false)
                && (record.attempt as u32) < def.retry_policy.max_attempts;

            if !expects_retry {
                return Ok(record);
            }
            record = self.await_next_attempt(&record).await?;
        }
    }

    /// Poll for the terminal record of the attempt after `prev`.
    async fn await_next_attempt(&self, prev: &RunRecord) -> Result<RunRecord, TriggerError> {
        let filter = RunFilter::builder()
            .job_name(prev.job_name.clone())
            .build();
        let floor = prev.finished_at.unwrap_or(prev.enqueued_at);

        loop {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            let runs = self.inner.store.find_runs(&filter, 100).await?;
            let next = runs.into_iter().find(|r| {
                r.attempt == prev.attempt + 1
                    && r.scheduled_for == prev.scheduled_for
                    && r.enqueued_at >= floor
            });
            if let Some(next) = next {
                if next.status.is_terminal() {
                    return Ok(next);
                }
            }
        }
    }

    async fn poll_terminal(&self, run_id: Uuid) -> Result<RunRecord, TriggerError> {
        loop {
            match self.inner.store.get_run(run_id).await? {
                Some(record) if record.status.is_terminal() => return Ok(record),
                Some(_) => tokio::time::sleep(std::time::Duration::from_millis(100)).await,
                None => return Err(TriggerError::Store(StoreError::RunNotFound(run_id))),
            }
        }
    }

    /// Fan an event out to every job subscribed to `source_id`.
    pub async fn emit_event(&self, source_id: &str, inputs: Value) -> Result<Vec<Uuid>, JobError> {
        let mut run_ids = Vec::new();
        for def in self.inner.registry.list() {
            if def.schedule.event_source() != Some(source_id) {
                continue;
            }
            match self
                .trigger_with(
                    &def.name,
                    inputs.clone(),
                    TriggerOptions {
                        cause: Some(format!("event:{source_id}")),
                        ..TriggerOptions::default()
                    },
                )
                .await
            {
                Ok(run_id) => run_ids.push(run_id),
                Err(e) => {
                    warn!(job_name = %def.name, event = source_id, error = %e, "event trigger failed")
                }
            }
        }
        Ok(run_ids)
    }

    /// Re-enqueue a dead run with a fresh attempt chain.
    pub async fn replay(&self, run_id: Uuid) -> Result<Uuid, TriggerError> {
        let record = self
            .inner
            .store
            .get_run(run_id)
            .await?
            .ok_or(TriggerError::Store(StoreError::RunNotFound(run_id)))?;

        if record.status != crate::run::RunStatus::Dead {
            return Err(TriggerError::InvalidInput(format!(
                "run {run_id} is {}, only dead runs can be replayed",
                record.status
            )));
        }

        let child = self
            .inner
            .trigger_service
            .trigger_child(ChildRequest {
                job_name: record.job_name.clone(),
                inputs: record.input_snapshot.clone(),
                parent_run_id: Some(run_id),
                depth: 0,
                cause: Some("replay".to_string()),
                dedupe_key: None,
                watch: false,
                suppress_retry: false,
            })
            .await?;
        Ok(child.run_id)
    }

    pub async fn status(&self, run_id: Uuid) -> Result<Option<RunRecord>, JobError> {
        self.inner
            .store
            .get_run(run_id)
            .await
            .map_err(JobError::from)
    }

    pub async fn tail_runs(
        &self,
        filter: &RunFilter,
        limit: i64,
    ) -> Result<Vec<RunRecord>, JobError> {
        self.inner
            .store
            .find_runs(filter, limit)
            .await
            .map_err(JobError::from)
    }

    /// Delete run records past their retention windows.
    pub async fn purge_expired_runs(&self) -> Result<u64, JobError> {
        self.inner
            .store
            .purge_finished(
                self.inner.clock.now(),
                self.inner.config.retention_succeeded,
                self.inner.config.retention_failed,
            )
            .await
            .map_err(JobError::from)
    }

    /// Stop the runtime. Safe to call more than once; later calls escalate:
    /// a second signal during a graceful stop behaves like `Immediate` and
    /// interrupts the grace window the first caller is waiting out.
    pub async fn shutdown(&self, mode: ShutdownMode) {
        let first = !self.inner.shutdown.is_cancelled();
        self.inner.shutdown.cancel();

        let mode = if first { mode } else { ShutdownMode::Immediate };
        if mode == ShutdownMode::Immediate {
            self.inner.abort.cancel();
        }
        info!(replica_id = %self.inner.replica_id, ?mode, "shutdown requested");

        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            // Teardown is owned by the first caller; the escalation signal
            // above is all a later call contributes.
            return;
        }

        if let Some(handle) = self.inner.dispatcher_handle.lock().await.take() {
            let _ = handle.await;
        }

        let mut pool_guard = self.inner.pool.lock().await;
        if let Some(mut pool) = pool_guard.take() {
            match mode {
                ShutdownMode::Graceful => {
                    pool.join(self.inner.config.shutdown_grace, &self.inner.abort)
                        .await;
                    pool.drain_queue().await;
                }
                ShutdownMode::Immediate => {
                    pool.abort().await;
                    pool.drain_queue().await;
                }
            }
        }

        info!(replica_id = %self.inner.replica_id, "job runtime stopped");
    }
}
