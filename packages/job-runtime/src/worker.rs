//! The worker pool and execution engine.
//!
//! `W` slots pull assignments off one bounded queue; order of execution
//! across slots need not match submission order. Each run gets an execution
//! context, a deadline watchdog, and (for singletons) a lease keep-alive.
//! Outcomes are interpreted against the job's retry policy and written back
//! to the run store; retryable failures flow back to the dispatcher as
//! delayed re-enqueue requests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::alert::{AlertEvent, AlertRouter};
use crate::clock::SharedClock;
use crate::context::{ChildTrigger, JobContext};
use crate::definition::JobDefinition;
use crate::dispatcher::{DispatchMsg, RetryRequest};
use crate::error::{ErrorKind, JobError};
use crate::input::InputSnapshot;
use crate::metrics::{attempt_bucket, SharedMetrics};
use crate::run::{RunPatch, RunRecord, RunStatus};
use crate::store::{LeaseKey, RenewOutcome, RunStore};
use crate::RuntimeConfig;

/// A run handed from the dispatcher to the pool.
pub(crate) struct RunAssignment {
    pub def: Arc<JobDefinition>,
    pub record: RunRecord,
    pub inputs: InputSnapshot,
    pub lease: Option<LeaseKey>,
    pub depth: u32,
    pub suppress_retry: bool,
}

/// Submission refusal surfaced to the dispatcher as backpressure.
#[derive(Debug)]
pub(crate) struct PoolRejection {
    pub reason: String,
}

/// Cloneable submission side of the pool.
#[derive(Clone)]
pub(crate) struct PoolHandle {
    tx: mpsc::Sender<RunAssignment>,
}

impl PoolHandle {
    pub(crate) fn submit(&self, assignment: RunAssignment) -> Result<(), PoolRejection> {
        self.tx.try_send(assignment).map_err(|e| match e {
            TrySendError::Full(_) => PoolRejection {
                reason: "worker queue full".to_string(),
            },
            TrySendError::Closed(_) => PoolRejection {
                reason: "worker pool stopped".to_string(),
            },
        })
    }
}

/// Terminal-record fan-out for synchronous child waits and the CLI.
#[derive(Clone, Default)]
pub(crate) struct CompletionHub {
    inner: Arc<DashMap<Uuid, Vec<oneshot::Sender<RunRecord>>>>,
}

impl CompletionHub {
    pub(crate) fn register(&self, run_id: Uuid) -> oneshot::Receiver<RunRecord> {
        let (tx, rx) = oneshot::channel();
        self.inner.entry(run_id).or_default().push(tx);
        rx
    }

    pub(crate) fn notify(&self, record: &RunRecord) {
        if let Some((_, senders)) = self.inner.remove(&record.run_id) {
            for sender in senders {
                let _ = sender.send(record.clone());
            }
        }
    }
}

/// Per-job concurrency limits, enforced in addition to the global `W`.
#[derive(Default)]
pub(crate) struct Admission {
    semaphores: DashMap<String, Arc<Semaphore>>,
}

impl Admission {
    fn semaphore(&self, job_name: &str, limit: u32) -> Arc<Semaphore> {
        self.semaphores
            .entry(job_name.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(limit as usize)))
            .value()
            .clone()
    }
}

/// Shared dependencies of every execution slot.
pub(crate) struct ExecEnv {
    pub config: RuntimeConfig,
    pub clock: SharedClock,
    pub replica_id: String,
    pub store: Arc<dyn RunStore>,
    pub metrics: SharedMetrics,
    pub alerts: Arc<AlertRouter>,
    pub completions: CompletionHub,
    pub child_trigger: Arc<dyn ChildTrigger>,
    pub dispatch_tx: mpsc::UnboundedSender<DispatchMsg>,
    pub shutdown: CancellationToken,
    pub admission: Admission,
    /// Runs currently executing on this replica, for hard-abort cleanup.
    pub running: DashMap<Uuid, Option<LeaseKey>>,
}

pub(crate) struct WorkerPool {
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<RunAssignment>>>,
    workers: Vec<JoinHandle<()>>,
    env: Arc<ExecEnv>,
}

impl WorkerPool {
    /// Create the pool's channel before the workers exist, so the dispatcher
    /// side can be wired first.
    pub(crate) fn channel(queue_capacity: usize) -> (PoolHandle, mpsc::Receiver<RunAssignment>) {
        let (tx, rx) = mpsc::channel(queue_capacity);
        (PoolHandle { tx }, rx)
    }

    pub(crate) fn start(env: Arc<ExecEnv>, rx: mpsc::Receiver<RunAssignment>) -> Self {
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut workers = Vec::with_capacity(env.config.workers);

        for slot in 0..env.config.workers {
            let env = Arc::clone(&env);
            let rx = Arc::clone(&rx);
            workers.push(tokio::spawn(async move {
                worker_loop(slot, env, rx).await;
            }));
        }

        Self { rx, workers, env }
    }

    /// Wait for the slots to finish their in-flight runs, bounded by the
    /// shutdown grace plus slack for the terminal writes. The escalation
    /// signal (a second shutdown request) cuts the wait short and aborts the
    /// slots instead.
    pub(crate) async fn join(&mut self, grace: Duration, escalate: &CancellationToken) {
        let wait = grace + Duration::from_secs(2);
        let abort_handles: Vec<_> = self.workers.iter().map(|h| h.abort_handle()).collect();
        let mut drained = futures::future::join_all(self.workers.drain(..));

        let escalated = tokio::select! {
            result = tokio::time::timeout(wait, &mut drained) => {
                if result.is_err() {
                    warn!("worker slots did not stop within the shutdown grace");
                }
                false
            }
            _ = escalate.cancelled() => true,
        };

        if escalated {
            warn!("shutdown escalated, aborting worker slots");
            for handle in abort_handles {
                handle.abort();
            }
            let _ = drained.await;
            self.cancel_running().await;
        }
    }

    /// Hard abort: kill the slots and mark whatever was running cancelled.
    pub(crate) async fn abort(&mut self) {
        for handle in self.workers.drain(..) {
            handle.abort();
        }
        self.cancel_running().await;
    }

    /// Terminal bookkeeping for runs whose slots were killed mid-flight.
    async fn cancel_running(&self) {
        let running: Vec<(Uuid, Option<LeaseKey>)> = self
            .env
            .running
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        for (run_id, lease) in running {
            let patch = RunPatch::status(RunStatus::Cancelled)
                .with_finished_at(self.env.clock.now())
                .with_error(ErrorKind::Cancelled, "hard shutdown");
            match self.env.store.update_run(run_id, patch).await {
                Ok(record) => self.env.completions.notify(&record),
                Err(e) => warn!(run_id = %run_id, error = %e, "failed to cancel run on abort"),
            }
            if let Some(key) = lease {
                let _ = self.env.store.release_lease(&key, run_id).await;
            }
            self.env.running.remove(&run_id);
        }
    }

    /// Cancel everything still sitting in the queue after shutdown.
    pub(crate) async fn drain_queue(&self) {
        let mut rx = self.rx.lock().await;
        while let Ok(assignment) = rx.try_recv() {
            let run_id = assignment.record.run_id;
            if let Some(key) = &assignment.lease {
                let _ = self.env.store.release_lease(key, run_id).await;
            }
            let patch = RunPatch::status(RunStatus::Cancelled)
                .with_finished_at(self.env.clock.now())
                .with_error(ErrorKind::Cancelled, "shutdown");
            match self.env.store.update_run(run_id, patch).await {
                Ok(record) => self.env.completions.notify(&record),
                Err(e) => warn!(run_id = %run_id, error = %e, "failed to cancel queued run"),
            }
        }
    }
}

async fn worker_loop(
    slot: usize,
    env: Arc<ExecEnv>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<RunAssignment>>>,
) {
    debug!(slot, "worker slot started");
    loop {
        let assignment = {
            let mut guard = rx.lock().await;
            tokio::select! {
                biased;
                _ = env.shutdown.cancelled() => None,
                assignment = guard.recv() => assignment,
            }
        };

        let Some(assignment) = assignment else { break };
        execute(&env, assignment).await;
    }
    debug!(slot, "worker slot stopped");
}

/// Mark a run that never reached its handler as cancelled.
async fn cancel_before_start(env: &Arc<ExecEnv>, run_id: Uuid, reason: &str) {
    let patch = RunPatch::status(RunStatus::Cancelled)
        .with_finished_at(env.clock.now())
        .with_error(ErrorKind::Cancelled, reason);
    match env.store.update_run(run_id, patch).await {
        Ok(final_record) => env.completions.notify(&final_record),
        Err(e) => error!(run_id = %run_id, error = %e, "failed to record cancellation"),
    }
}

/// How the watchdog saw the handler finish.
enum Resolution {
    Success,
    Failure(JobError),
    TimedOut,
    ShutdownAbandoned,
}

async fn execute(env: &Arc<ExecEnv>, assignment: RunAssignment) {
    let RunAssignment {
        def,
        record,
        inputs,
        lease,
        depth,
        suppress_retry,
    } = assignment;
    let run_id = record.run_id;
    let attempt = record.attempt;

    // Per-job concurrency gate. Singletons are serialized by their lease.
    // The wait is a runtime suspension point, so it must observe shutdown.
    let _permit = if lease.is_none() {
        let semaphore = env.admission.semaphore(&def.name, def.max_concurrent);
        let waited = tokio::select! {
            biased;
            _ = env.shutdown.cancelled() => None,
            acquired = tokio::time::timeout(env.config.admission_wait, semaphore.acquire_owned()) => {
                Some(acquired)
            }
        };
        match waited {
            Some(Ok(Ok(permit))) => Some(permit),
            Some(Ok(Err(_))) => None,
            Some(Err(_)) => {
                env.metrics.counter(
                    "pool_skipped_admission",
                    1,
                    &[("job_name", &def.name)],
                );
                cancel_before_start(env, run_id, "admission wait timed out").await;
                return;
            }
            None => {
                cancel_before_start(env, run_id, "shutdown").await;
                return;
            }
        }
    } else {
        None
    };

    let started_at = env.clock.now();
    if let Err(e) = env
        .store
        .update_run(
            run_id,
            RunPatch::status(RunStatus::Running).with_started_at(started_at),
        )
        .await
    {
        error!(run_id = %run_id, job_name = %def.name, error = %e, "failed to mark run running");
        if let Some(key) = &lease {
            let _ = env.store.release_lease(key, run_id).await;
        }
        return;
    }

    env.running.insert(run_id, lease.clone());

    let token = CancellationToken::new();
    let deadline = started_at
        + chrono::Duration::from_std(def.timeout).unwrap_or_else(|_| chrono::Duration::seconds(300));

    let ctx = JobContext::new(
        def.name.clone(),
        run_id,
        attempt,
        record.scheduled_for,
        env.replica_id.clone(),
        Arc::clone(&env.clock),
        token.clone(),
        deadline,
        inputs,
        depth,
        env.config.max_trigger_depth,
        Arc::clone(&env.child_trigger),
    );

    // Lease keep-alive: renew at ttl/3; on loss, cancel the context so the
    // handler aborts its writes.
    let lease_lost = Arc::new(AtomicBool::new(false));
    let heartbeat = lease.clone().map(|key| {
        let store = Arc::clone(&env.store);
        let token = token.clone();
        let lost = Arc::clone(&lease_lost);
        let interval = env.config.heartbeat_interval();
        let ttl = env.config.lease_ttl;
        let job_name = def.name.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip the immediate tick
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        match store.renew_lease(&key, run_id, ttl).await {
                            Ok(RenewOutcome::Renewed) => {}
                            Ok(RenewOutcome::Lost) => {
                                warn!(job_name = %job_name, run_id = %run_id, "lease lost, cancelling run");
                                lost.store(true, Ordering::SeqCst);
                                token.cancel();
                                break;
                            }
                            Err(e) => {
                                warn!(job_name = %job_name, run_id = %run_id, error = %e, "lease heartbeat failed");
                            }
                        }
                    }
                }
            }
        })
    });

    let handler = Arc::clone(&def.handler);
    let handler_ctx = ctx.clone();
    let mut task = tokio::spawn(async move { handler.run(handler_ctx).await });

    let mut shutdown_seen = false;
    let timeout_sleep = tokio::time::sleep(def.timeout);
    tokio::pin!(timeout_sleep);

    let resolution = tokio::select! {
        res = &mut task => interpret_join(res, &ctx, &lease_lost),
        () = &mut timeout_sleep => {
            // Deadline tripped: fire done(), give the handler the grace
            // period to return, then detach it.
            token.cancel();
            if tokio::time::timeout(env.config.grace_period, &mut task).await.is_err() {
                warn!(job_name = %def.name, run_id = %run_id, "handler did not return within grace, detaching");
            }
            Resolution::TimedOut
        }
        _ = env.shutdown.cancelled() => {
            shutdown_seen = true;
            token.cancel();
            match tokio::time::timeout(env.config.shutdown_grace, &mut task).await {
                Ok(res) => interpret_join(res, &ctx, &lease_lost),
                Err(_) => Resolution::ShutdownAbandoned,
            }
        }
    };

    token.cancel();
    if let Some(handle) = heartbeat {
        let _ = handle.await;
    }

    finish(
        env,
        &def,
        &record,
        &ctx,
        lease.as_ref(),
        resolution,
        shutdown_seen,
        depth,
        suppress_retry,
    )
    .await;

    env.running.remove(&run_id);
}

fn interpret_join(
    result: Result<Result<(), JobError>, tokio::task::JoinError>,
    ctx: &JobContext,
    lease_lost: &AtomicBool,
) -> Resolution {
    if lease_lost.load(Ordering::SeqCst) {
        return Resolution::Failure(JobError::cancelled("lease lost"));
    }
    match result {
        Ok(Ok(())) => match ctx.recorded_failure() {
            Some(recorded) => Resolution::Failure(recorded),
            None => Resolution::Success,
        },
        Ok(Err(error)) => Resolution::Failure(error),
        Err(join_error) if join_error.is_panic() => Resolution::Failure(JobError::new(
            ErrorKind::Unexpected,
            format!("handler panicked: {join_error}"),
        )),
        Err(_) => Resolution::Failure(JobError::cancelled("handler aborted")),
    }
}

#[allow(clippy::too_many_arguments)]
async fn finish(
    env: &Arc<ExecEnv>,
    def: &Arc<JobDefinition>,
    record: &RunRecord,
    ctx: &JobContext,
    lease: Option<&LeaseKey>,
    resolution: Resolution,
    shutdown_seen: bool,
    depth: u32,
    suppress_retry: bool,
) {
    let run_id = record.run_id;
    let attempt = record.attempt;
    let policy = &def.retry_policy;
    let now = env.clock.now();

    // `dead` is reserved for a retryable kind whose budget ran out; a run
    // with suppressed retries fails plainly instead.
    let classify = |error: JobError| {
        let retryable = policy.retries(error.kind);
        let budget_left = (attempt as u32) < policy.max_attempts;
        let will_retry = retryable && budget_left && !suppress_retry;
        let exhausted = retryable && !budget_left && !suppress_retry;
        let status = if exhausted {
            RunStatus::Dead
        } else if error.kind == ErrorKind::Timeout {
            RunStatus::TimedOut
        } else {
            RunStatus::Failed
        };
        (status, Some(error), will_retry)
    };

    let (status, error, will_retry) = match resolution {
        Resolution::Success => (RunStatus::Succeeded, None, false),
        Resolution::TimedOut => classify(JobError::new(ErrorKind::Timeout, "deadline exceeded")),
        Resolution::ShutdownAbandoned => (
            RunStatus::Cancelled,
            Some(JobError::cancelled("shutdown")),
            false,
        ),
        Resolution::Failure(error) => {
            if error.kind == ErrorKind::Cancelled {
                let message = if shutdown_seen { "shutdown" } else { error.message.as_str() };
                (
                    RunStatus::Cancelled,
                    Some(JobError::cancelled(message)),
                    false,
                )
            } else {
                classify(error)
            }
        }
    };

    let mut patch = RunPatch::status(status)
        .with_finished_at(now)
        .with_metrics(ctx.metrics_json())
        .with_log_tail(ctx.log_tail_json());
    if let Some(error) = &error {
        patch = patch.with_error(error.kind, error.message.as_str());
        if let Some(stack) = &error.stack {
            patch = patch.with_error_stack(stack.as_str());
        }
    }

    let final_record = match env.store.update_run(run_id, patch).await {
        Ok(updated) => updated,
        Err(e) => {
            error!(run_id = %run_id, job_name = %def.name, error = %e, "failed to persist run outcome");
            // Best-effort local copy so watchers still resolve.
            let mut fallback = record.clone();
            fallback.status = status;
            fallback.finished_at = Some(now);
            fallback
        }
    };

    if let Some(key) = lease {
        if let Err(e) = env.store.release_lease(key, run_id).await {
            warn!(run_id = %run_id, lease_key = %key, error = %e, "failed to release lease");
        }
    }

    let duration_ms = final_record.duration_ms().unwrap_or(0) as f64;
    let labels = [
        ("job_name", def.name.as_str()),
        ("status", status.as_str()),
        ("attempt_bucket", attempt_bucket(attempt)),
    ];
    env.metrics.counter("pool_runs_completed", 1, &labels);
    env.metrics.histogram("pool_run_duration_ms", duration_ms, &labels);

    match status {
        RunStatus::Succeeded => {
            debug!(job_name = %def.name, run_id = %run_id, attempt, "run succeeded");
        }
        RunStatus::Cancelled => {
            info!(job_name = %def.name, run_id = %run_id, attempt, "run cancelled");
        }
        _ => {
            warn!(
                job_name = %def.name,
                run_id = %run_id,
                attempt,
                status = %status,
                will_retry,
                error = error.as_ref().map(|e| e.message.as_str()).unwrap_or(""),
                "run failed"
            );
        }
    }

    if will_retry {
        let backoff = policy.backoff_after(attempt as u32);
        // Up to 20% uniform jitter, never below the computed backoff.
        let jitter = backoff.mul_f64(fastrand::f64() * 0.2);
        let not_before = now
            + chrono::Duration::from_std(backoff + jitter)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));

        let retry = RetryRequest {
            def: Arc::clone(def),
            attempt: attempt + 1,
            scheduled_for: record.scheduled_for,
            input_snapshot: record.input_snapshot.clone(),
            not_before,
            depth,
            parent_run_id: record.parent_run_id,
        };
        if env.dispatch_tx.send(DispatchMsg::Retry(retry)).is_err() {
            warn!(job_name = %def.name, run_id = %run_id, "dispatcher gone, dropping retry");
        }
    } else if matches!(
        status,
        RunStatus::Failed | RunStatus::TimedOut | RunStatus::Dead
    ) && !def.alert_channels.is_empty()
    {
        let event = AlertEvent::from_record(&final_record);
        env.alerts.route(&def.alert_channels, &event).await;
    }

    env.completions.notify(&final_record);
}
