//! The dispatcher: one logical loop per replica.
//!
//! The loop keeps a min-heap of upcoming fire times seeded from every timed
//! schedule, sleeps until the earlier of the heap head, a control message
//! (trigger or retry), or a registry reload, and dispatches everything due.
//! Replicas run the same loop independently and race for leases; losing the
//! race is a skipped tick, not an error.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::{new_run_id, SharedClock};
use crate::context::{ChildRequest, TriggeredChild};
use crate::definition::JobDefinition;
use crate::error::{ErrorKind, StoreError, TriggerError};
use crate::input::InputSnapshot;
use crate::metrics::SharedMetrics;
use crate::registry::JobRegistry;
use crate::run::{RunPatch, RunRecord, RunStatus};
use crate::schedule::CatchUpPolicy;
use crate::store::{LeaseGrant, RunStore};
use crate::worker::{CompletionHub, PoolHandle, RunAssignment};
use crate::RuntimeConfig;

/// Control messages feeding the dispatcher loop.
pub(crate) enum DispatchMsg {
    /// An explicit or event-driven trigger; the reply resolves once the run
    /// is enqueued (or refused).
    Trigger {
        request: ChildRequest,
        reply: oneshot::Sender<Result<TriggeredChild, TriggerError>>,
    },
    /// A delayed re-enqueue after a retryable failure.
    Retry(RetryRequest),
}

/// Re-enqueue request preserving the fire identity and input snapshot.
pub(crate) struct RetryRequest {
    pub def: Arc<JobDefinition>,
    pub attempt: i32,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub input_snapshot: Value,
    pub not_before: DateTime<Utc>,
    pub depth: u32,
    pub parent_run_id: Option<Uuid>,
}

/// Why a dispatch attempt did not hand a run to the pool.
pub(crate) enum DispatchOutcome {
    Submitted {
        run_id: Uuid,
        /// Present when the caller asked to watch for the terminal record.
        completion: Option<oneshot::Receiver<RunRecord>>,
    },
    /// Idempotent enqueue: an active run with the same dedupe key exists.
    Existing(Uuid),
    SkippedHeld { holder: String },
    Rejected { run_id: Uuid, reason: String },
}

/// Everything needed to turn "this job should run now" into a leased,
/// persisted, pool-submitted run. Shared by the scheduled path and triggers.
pub(crate) struct DispatchCore {
    pub config: RuntimeConfig,
    pub clock: SharedClock,
    pub replica_id: String,
    pub store: Arc<dyn RunStore>,
    pub metrics: SharedMetrics,
    pub pool: PoolHandle,
    pub completions: CompletionHub,
}

impl DispatchCore {
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn dispatch_run(
        &self,
        def: &Arc<JobDefinition>,
        inputs: InputSnapshot,
        attempt: i32,
        scheduled_for: Option<DateTime<Utc>>,
        parent_run_id: Option<Uuid>,
        depth: u32,
        cause: Option<String>,
        dedupe_key: Option<String>,
        watch: bool,
        suppress_retry: bool,
    ) -> Result<DispatchOutcome, StoreError> {
        if let Some(key) = &dedupe_key {
            if let Some(existing) = self.store.find_active_by_dedupe(key).await? {
                debug!(
                    job_name = %def.name,
                    run_id = %existing.run_id,
                    dedupe_key = %key,
                    "dedupe hit, reusing active run"
                );
                return Ok(DispatchOutcome::Existing(existing.run_id));
            }
        }

        let run_id = new_run_id();
        let now = self.clock.now();

        let lease = match def.lease_key(&inputs) {
            Some(key) => {
                let grant = self
                    .store
                    .try_acquire_lease(&key, self.config.lease_ttl, run_id, &self.replica_id)
                    .await?;
                match grant {
                    LeaseGrant::Acquired { recovered_from } => {
                        if let Some(previous) = recovered_from {
                            warn!(
                                job_name = %def.name,
                                lease_key = %key,
                                previous_holder = %previous,
                                "acquired lease over expired holder"
                            );
                            self.metrics.counter(
                                "dispatcher_lease_recovered",
                                1,
                                &[("job_name", &def.name)],
                            );
                        }
                        Some(key)
                    }
                    LeaseGrant::HeldBy { holder } => {
                        return Ok(DispatchOutcome::SkippedHeld { holder });
                    }
                }
            }
            None => None,
        };

        let mut record = RunRecord::new(
            run_id,
            def.name.clone(),
            attempt,
            scheduled_for,
            inputs.to_json(),
            self.replica_id.clone(),
            now,
        );
        if lease.is_some() {
            record.status = RunStatus::Leased;
            record.leased_at = Some(now);
        }
        record.parent_run_id = parent_run_id;
        record.trigger_cause = cause;
        record.dedupe_key = dedupe_key;

        if let Err(error) = self.store.create_run(&record).await {
            if let Some(key) = &lease {
                let _ = self.store.release_lease(key, run_id).await;
            }
            return Err(error);
        }

        let completion = watch.then(|| self.completions.register(run_id));

        let assignment = RunAssignment {
            def: Arc::clone(def),
            record,
            inputs,
            lease: lease.clone(),
            depth,
            suppress_retry,
        };

        if let Err(rejected) = self.pool.submit(assignment) {
            if let Some(key) = &lease {
                let _ = self.store.release_lease(key, run_id).await;
            }
            let patch = RunPatch::status(RunStatus::Cancelled)
                .with_finished_at(self.clock.now())
                .with_error(ErrorKind::Cancelled, &rejected.reason);
            match self.store.update_run(run_id, patch).await {
                Ok(final_record) => self.completions.notify(&final_record),
                Err(error) => {
                    error!(run_id = %run_id, error = %error, "failed to record pool rejection")
                }
            }
            self.metrics.counter(
                "dispatcher_skipped_backpressure",
                1,
                &[("job_name", &def.name)],
            );
            return Ok(DispatchOutcome::Rejected {
                run_id,
                reason: rejected.reason,
            });
        }

        Ok(DispatchOutcome::Submitted { run_id, completion })
    }
}

/// One entry in the fire-time heap.
struct HeapEntry {
    at: DateTime<Utc>,
    priority: i16,
    job_name: String,
    seq: u64,
    kind: EntryKind,
}

enum EntryKind {
    /// A scheduled fire. `reschedule` is false for catch-up entries so the
    /// regular next-future entry is not double-pushed.
    Fire {
        def: Arc<JobDefinition>,
        scheduled_for: DateTime<Utc>,
        reschedule: bool,
    },
    Retry(RetryRequest),
}

impl HeapEntry {
    fn ord_key(&self) -> (DateTime<Utc>, i16, &str, u64) {
        (self.at, self.priority, self.job_name.as_str(), self.seq)
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.ord_key() == other.ord_key()
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.ord_key().cmp(&other.ord_key())
    }
}

/// The per-replica scheduling loop.
pub(crate) struct Dispatcher {
    core: Arc<DispatchCore>,
    registry: Arc<JobRegistry>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    msg_rx: mpsc::UnboundedReceiver<DispatchMsg>,
    reload_rx: watch::Receiver<u64>,
    shutdown: tokio_util::sync::CancellationToken,
    seq: u64,
    /// (priority tier, consecutive dispatches) for anti-starvation.
    streak: Option<(i16, usize)>,
}

impl Dispatcher {
    pub(crate) fn new(
        core: Arc<DispatchCore>,
        registry: Arc<JobRegistry>,
        msg_rx: mpsc::UnboundedReceiver<DispatchMsg>,
        shutdown: tokio_util::sync::CancellationToken,
    ) -> Self {
        let reload_rx = registry.subscribe();
        Self {
            core,
            registry,
            heap: BinaryHeap::new(),
            msg_rx,
            reload_rx,
            shutdown,
            seq: 0,
            streak: None,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(replica_id = %self.core.replica_id, "dispatcher starting");
        self.seed().await;

        loop {
            let sleep_for = self.sleep_until_next();

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                changed = self.reload_rx.changed() => {
                    if changed.is_ok() {
                        info!("registry reloaded, reseeding schedules");
                        self.seed().await;
                    }
                }
                msg = self.msg_rx.recv() => {
                    match msg {
                        Some(msg) => self.handle_msg(msg).await,
                        None => break,
                    }
                }
                _ = tokio::time::sleep(sleep_for) => {}
            }

            self.drain_due().await;
        }

        info!(replica_id = %self.core.replica_id, "dispatcher stopped");
    }

    fn sleep_until_next(&self) -> Duration {
        const IDLE: Duration = Duration::from_secs(3_600);
        match self.heap.peek() {
            Some(Reverse(entry)) => {
                let now = self.core.clock.now();
                (entry.at - now).to_std().unwrap_or(Duration::ZERO).min(IDLE)
            }
            None => IDLE,
        }
    }

    /// Rebuild the heap from the current catalog, applying each job's
    /// catch-up policy to fires missed while no replica was dispatching.
    async fn seed(&mut self) {
        self.heap.clear();
        let now = self.core.clock.now();
        let catalog = self.registry.snapshot();

        for def in catalog.values() {
            if !def.schedule.is_timed() {
                continue;
            }

            let policy = def.catch_up.unwrap_or(self.core.config.catch_up_default);
            match self.core.store.latest_scheduled_for(&def.name).await {
                Ok(Some(last)) => {
                    let resume = last + chrono::Duration::milliseconds(1);
                    let missed: Vec<DateTime<Utc>> =
                        def.schedule.iterate(resume, now).collect();
                    if !missed.is_empty() {
                        match policy {
                            CatchUpPolicy::SkipMissed => {
                                debug!(
                                    job_name = %def.name,
                                    missed = missed.len(),
                                    "discarding missed fires"
                                );
                            }
                            CatchUpPolicy::FireOnce => {
                                let latest = *missed.last().unwrap();
                                info!(
                                    job_name = %def.name,
                                    missed = missed.len(),
                                    scheduled_for = %latest,
                                    "catching up latest missed fire"
                                );
                                self.push_fire(def, latest, false);
                            }
                            CatchUpPolicy::FireAll => {
                                info!(
                                    job_name = %def.name,
                                    missed = missed.len(),
                                    "catching up all missed fires"
                                );
                                for fire in missed {
                                    self.push_fire(def, fire, false);
                                }
                            }
                        }
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    error!(job_name = %def.name, error = %error, "catch-up query failed");
                }
            }

            if let Some(next) = def.schedule.next_after(now) {
                self.push_fire(def, next, true);
            }
        }
    }

    fn push_fire(&mut self, def: &Arc<JobDefinition>, scheduled_for: DateTime<Utc>, reschedule: bool) {
        self.seq += 1;
        self.heap.push(Reverse(HeapEntry {
            at: scheduled_for,
            priority: def.priority.as_i16(),
            job_name: def.name.clone(),
            seq: self.seq,
            kind: EntryKind::Fire {
                def: Arc::clone(def),
                scheduled_for,
                reschedule,
            },
        }));
    }

    async fn handle_msg(&mut self, msg: DispatchMsg) {
        match msg {
            DispatchMsg::Trigger { request, reply } => {
                let result = self.handle_trigger(request).await;
                let _ = reply.send(result);
            }
            DispatchMsg::Retry(retry) => {
                self.seq += 1;
                self.heap.push(Reverse(HeapEntry {
                    at: retry.not_before,
                    priority: retry.def.priority.as_i16(),
                    job_name: retry.def.name.clone(),
                    seq: self.seq,
                    kind: EntryKind::Retry(retry),
                }));
            }
        }
    }

    async fn handle_trigger(
        &mut self,
        request: ChildRequest,
    ) -> Result<TriggeredChild, TriggerError> {
        let def = self
            .registry
            .lookup(&request.job_name)
            .map_err(|_| TriggerError::UnknownJob(request.job_name.clone()))?;

        let inputs = def
            .input_schema
            .bind(&request.inputs)
            .map_err(|e| TriggerError::InvalidInput(e.message))?;

        let watch = request.watch;
        let outcome = self
            .core
            .dispatch_run(
                &def,
                inputs,
                1,
                None,
                request.parent_run_id,
                request.depth,
                request.cause,
                request.dedupe_key,
                watch,
                request.suppress_retry,
            )
            .await?;

        match outcome {
            DispatchOutcome::Submitted { run_id, completion } => Ok(TriggeredChild {
                run_id,
                completion,
            }),
            // The reused run may already be terminal; callers that need the
            // outcome poll the store instead of racing a watch registration.
            DispatchOutcome::Existing(run_id) => Ok(TriggeredChild {
                run_id,
                completion: None,
            }),
            DispatchOutcome::SkippedHeld { holder } => Err(TriggerError::SingletonHeld {
                job: def.name.clone(),
                holder,
            }),
            DispatchOutcome::Rejected { reason, .. } => Err(TriggerError::Rejected {
                job: def.name.clone(),
                reason,
            }),
        }
    }

    async fn drain_due(&mut self) {
        let now = self.core.clock.now();
        let mut due = Vec::new();
        while let Some(Reverse(head)) = self.heap.peek() {
            if head.at > now {
                break;
            }
            due.push(self.heap.pop().unwrap().0);
        }
        if due.is_empty() {
            return;
        }

        // Priority order with anti-starvation: after `fairness_burst`
        // consecutive dispatches of one tier, service a lower tier if due.
        due.sort_by(|a, b| {
            (a.priority, a.job_name.as_str(), a.at, a.seq)
                .cmp(&(b.priority, b.job_name.as_str(), b.at, b.seq))
        });

        let burst = self.core.config.fairness_burst;
        let mut queue: Vec<Option<HeapEntry>> = due.into_iter().map(Some).collect();
        let mut dispatched = 0usize;

        while dispatched < queue.len() {
            let next_index = self.pick_next(&queue, burst);
            let entry = queue[next_index].take().expect("entry picked twice");
            dispatched += 1;

            let tier = entry.priority;
            self.streak = match self.streak {
                Some((t, n)) if t == tier => Some((t, n + 1)),
                _ => Some((tier, 1)),
            };

            self.dispatch_entry(entry).await;
        }
    }

    /// Index of the next entry to dispatch, honoring the fairness burst.
    fn pick_next(&self, queue: &[Option<HeapEntry>], burst: usize) -> usize {
        let first = queue
            .iter()
            .position(|slot| slot.is_some())
            .expect("pick_next on drained queue");

        if let Some((tier, count)) = self.streak {
            if count >= burst {
                let first_tier = queue[first].as_ref().map(|e| e.priority).unwrap_or(i16::MAX);
                if first_tier == tier {
                    if let Some(lower) = queue
                        .iter()
                        .position(|slot| slot.as_ref().is_some_and(|e| e.priority > tier))
                    {
                        return lower;
                    }
                }
            }
        }
        first
    }

    async fn dispatch_entry(&mut self, entry: HeapEntry) {
        match entry.kind {
            EntryKind::Fire {
                def,
                scheduled_for,
                reschedule,
            } => {
                self.dispatch_fire(&def, scheduled_for).await;

                if reschedule {
                    if let Some(next) = def
                        .schedule
                        .next_after(scheduled_for + chrono::Duration::milliseconds(1))
                    {
                        self.push_fire(&def, next, true);
                    }
                }
            }
            EntryKind::Retry(retry) => {
                let inputs = match retry.def.input_schema.bind(&retry.input_snapshot) {
                    Ok(inputs) => inputs,
                    Err(error) => {
                        // Snapshots rebind against the definition they were
                        // bound with, so this only fires on store corruption.
                        error!(
                            job_name = %retry.def.name,
                            error = %error,
                            "retry snapshot failed to rebind"
                        );
                        return;
                    }
                };

                let def = Arc::clone(&retry.def);
                match self
                    .core
                    .dispatch_run(
                        &def,
                        inputs,
                        retry.attempt,
                        retry.scheduled_for,
                        retry.parent_run_id,
                        retry.depth,
                        None,
                        None,
                        false,
                        false,
                    )
                    .await
                {
                    Ok(DispatchOutcome::SkippedHeld { holder }) => {
                        // Singleton retries wait for the holder rather than
                        // dropping the fire's remaining budget.
                        warn!(
                            job_name = %def.name,
                            attempt = retry.attempt,
                            holder = %holder,
                            "retry blocked by held lease, backing off"
                        );
                        self.core.metrics.counter(
                            "dispatcher_skipped_held",
                            1,
                            &[("job_name", &def.name)],
                        );
                        let not_before =
                            self.core.clock.now() + chrono::Duration::seconds(1);
                        self.seq += 1;
                        self.heap.push(Reverse(HeapEntry {
                            at: not_before,
                            priority: def.priority.as_i16(),
                            job_name: def.name.clone(),
                            seq: self.seq,
                            kind: EntryKind::Retry(RetryRequest {
                                not_before,
                                ..retry
                            }),
                        }));
                    }
                    Ok(_) => {}
                    Err(error) => {
                        error!(job_name = %def.name, error = %error, "retry dispatch failed");
                    }
                }
            }
        }
    }

    async fn dispatch_fire(&mut self, def: &Arc<JobDefinition>, scheduled_for: DateTime<Utc>) {
        // Scheduled fires bind declared defaults; registration guarantees
        // required parameters of timed jobs carry defaults.
        let inputs = match def.input_schema.bind(&Value::Null) {
            Ok(inputs) => inputs,
            Err(error) => {
                error!(job_name = %def.name, error = %error, "failed to bind scheduled inputs");
                return;
            }
        };

        match self
            .core
            .dispatch_run(
                def,
                inputs,
                1,
                Some(scheduled_for),
                None,
                0,
                None,
                None,
                false,
                false,
            )
            .await
        {
            Ok(DispatchOutcome::Submitted { run_id, .. }) => {
                debug!(
                    job_name = %def.name,
                    run_id = %run_id,
                    scheduled_for = %scheduled_for,
                    "fire dispatched"
                );
                self.core
                    .metrics
                    .counter("dispatcher_fires", 1, &[("job_name", &def.name)]);
            }
            Ok(DispatchOutcome::SkippedHeld { holder }) => {
                // A missed tick for singletons; the fire is not rescheduled.
                debug!(
                    job_name = %def.name,
                    scheduled_for = %scheduled_for,
                    holder = %holder,
                    "fire skipped, lease held"
                );
                self.core.metrics.counter(
                    "dispatcher_skipped_held",
                    1,
                    &[("job_name", &def.name)],
                );
            }
            Ok(DispatchOutcome::Rejected { .. }) | Ok(DispatchOutcome::Existing(_)) => {}
            Err(error) => {
                error!(job_name = %def.name, error = %error, "fire dispatch failed");
            }
        }
    }
}
