//! End-to-end scenarios against the in-memory run store.
//!
//! Tests run under paused tokio time with the simulated clock, so schedules,
//! backoffs, and deadlines are exercised deterministically in virtual time.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use job_runtime::testing::{RecordingAlertSink, RecordingMetrics, ScriptedHandler, SimClock};
use job_runtime::{
    handler_fn, ErrorKind, InputSchema, JobDefinition, JobError, JobHandler, JobRegistry,
    JobRuntime,
    MemoryRunStore, ParamSpec, ParamType, ReplicaId, RetryPolicy, RunRecord, RunStatus, RunStore,
    RuntimeConfig, Schedule, ShutdownMode, SingletonPolicy, TriggerError, TriggerOptions,
};

fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
}

struct Harness {
    runtime: JobRuntime,
    store: Arc<MemoryRunStore>,
    metrics: Arc<RecordingMetrics>,
    alerts: Arc<RecordingAlertSink>,
}

async fn start(definitions: Vec<JobDefinition>, config: RuntimeConfig) -> Harness {
    let clock = Arc::new(SimClock::at(epoch()));
    start_with(definitions, config, clock, "replica-1").await
}

async fn start_with(
    definitions: Vec<JobDefinition>,
    config: RuntimeConfig,
    clock: Arc<SimClock>,
    replica: &str,
) -> Harness {
    let store = Arc::new(MemoryRunStore::new(clock.clone()));
    start_on(definitions, config, clock, store, replica).await
}

async fn start_on(
    definitions: Vec<JobDefinition>,
    config: RuntimeConfig,
    clock: Arc<SimClock>,
    store: Arc<MemoryRunStore>,
    replica: &str,
) -> Harness {
    let registry = Arc::new(JobRegistry::new());
    for def in definitions {
        registry.register(def).unwrap();
    }

    let metrics = RecordingMetrics::new();
    let alerts = RecordingAlertSink::new();

    let runtime = JobRuntime::builder(registry, store.clone() as Arc<dyn RunStore>)
        .config(config)
        .clock(clock)
        .replica_id(ReplicaId::from_string(replica))
        .metrics(metrics.clone())
        .alert_sink("ops", alerts.clone())
        .alert_sink("pager", alerts.clone())
        .start()
        .await
        .unwrap();

    Harness {
        runtime,
        store,
        metrics,
        alerts,
    }
}

fn manual_job(name: &str) -> JobDefinition {
    JobDefinition::builder()
        .name(name)
        .schedule(Schedule::Manual)
        .handler(handler_fn(|_ctx| async { Ok(()) }))
        .build()
}

async fn wait_terminal(store: &MemoryRunStore, run_id: Uuid) -> RunRecord {
    loop {
        if let Some(record) = store.all_runs().into_iter().find(|r| r.run_id == run_id) {
            if record.status.is_terminal() {
                return record;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_until<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..5_000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(start_paused = true)]
async fn manual_trigger_succeeds_and_records_everything() {
    let schema = InputSchema::new(vec![
        ParamSpec::required("region", ParamType::String),
        ParamSpec::with_default("batch_size", ParamType::Integer, "100"),
    ]);
    let def = JobDefinition::builder()
        .name("sync_trips")
        .schedule(Schedule::Manual)
        .input_schema(schema)
        .handler(handler_fn(|ctx| async move {
            ctx.info("starting sync");
            ctx.metric("rows", 42.0);
            Ok(())
        }))
        .build();

    let h = start(vec![def], RuntimeConfig::default()).await;
    let record = h
        .runtime
        .run_to_completion("sync_trips", json!({ "region": "houston" }), TriggerOptions::default())
        .await
        .unwrap();

    assert_eq!(record.status, RunStatus::Succeeded);
    assert_eq!(record.attempt, 1);
    assert_eq!(record.input_snapshot["region"], "houston");
    assert_eq!(record.input_snapshot["batch_size"], 100);
    assert_eq!(record.metrics["rows"], 42.0);
    assert!(record.started_at.is_some() && record.finished_at.is_some());
    let tail = record.log_tail.as_array().unwrap();
    assert_eq!(tail[0]["message"], "starting sync");

    h.runtime.shutdown(ShutdownMode::Graceful).await;
}

#[tokio::test(start_paused = true)]
async fn unknown_job_and_bad_inputs_are_refused() {
    let h = start(vec![manual_job("known")], RuntimeConfig::default()).await;

    let err = h.runtime.trigger("missing", Value::Null).await.unwrap_err();
    assert!(matches!(err, TriggerError::UnknownJob(_)));

    let err = h
        .runtime
        .trigger("known", json!({ "surprise": true }))
        .await
        .unwrap_err();
    assert!(matches!(err, TriggerError::InvalidInput(_)));

    h.runtime.shutdown(ShutdownMode::Graceful).await;
}

// Scenario B: transient failures retried with exponential backoff.
#[tokio::test(start_paused = true)]
async fn transient_failures_retry_with_backoff() {
    let handler = ScriptedHandler::fail_times(2, JobError::transient("dependency flapped"));
    let def = JobDefinition::builder()
        .name("compensate_incentives")
        .schedule(Schedule::Manual)
        .retry_policy(RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(60),
            retryable_error_kinds: [ErrorKind::TransientDependency].into_iter().collect(),
        })
        .handler(handler.clone() as Arc<dyn JobHandler>)
        .build();

    let h = start(vec![def], RuntimeConfig::default()).await;
    let last = h
        .runtime
        .run_fire_to_completion(
            "compensate_incentives",
            Value::Null,
            TriggerOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(last.status, RunStatus::Succeeded);
    assert_eq!(last.attempt, 3);
    assert_eq!(handler.invocations(), 3);

    let mut runs = h.store.all_runs();
    runs.sort_by_key(|r| r.attempt);
    assert_eq!(runs.len(), 3);
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert_eq!(runs[0].error_kind, Some(ErrorKind::TransientDependency));
    assert_eq!(runs[1].status, RunStatus::Failed);
    assert_eq!(runs[2].status, RunStatus::Succeeded);

    // Attempt numbers are exactly 1..=3 with no gaps.
    assert_eq!(
        runs.iter().map(|r| r.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );

    // Backoff lower bound plus at most 20% jitter (and timer rounding).
    let gap1 = (runs[1].started_at.unwrap() - runs[0].finished_at.unwrap()).num_milliseconds();
    let gap2 = (runs[2].started_at.unwrap() - runs[1].finished_at.unwrap()).num_milliseconds();
    assert!((1_000..=1_250).contains(&gap1), "gap1 = {gap1}ms");
    assert!((2_000..=2_450).contains(&gap2), "gap2 = {gap2}ms");

    h.runtime.shutdown(ShutdownMode::Graceful).await;
}

// Scenario C: permanent failures terminate on the first attempt and alert
// every configured channel.
#[tokio::test(start_paused = true)]
async fn permanent_failure_is_terminal_and_alerts() {
    let def = JobDefinition::builder()
        .name("validate_migration")
        .schedule(Schedule::Manual)
        .alert_channels(vec!["ops".to_string(), "pager".to_string()])
        .handler(handler_fn(|ctx| async move {
            Err(ctx.fail(ErrorKind::PermanentDependency, "schema rejected"))
        }))
        .build();

    let h = start(vec![def], RuntimeConfig::default()).await;
    let record = h
        .runtime
        .run_to_completion("validate_migration", Value::Null, TriggerOptions::default())
        .await
        .unwrap();

    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.error_kind, Some(ErrorKind::PermanentDependency));

    assert_eq!(h.store.all_runs().len(), 1, "no second attempt");

    wait_until(|| h.alerts.count() == 2).await;
    let events = h.alerts.events();
    let mut channels: Vec<_> = events.iter().map(|(c, _)| c.clone()).collect();
    channels.sort();
    assert_eq!(channels, vec!["ops", "pager"]);
    assert_eq!(events[0].1.error_message.as_deref(), Some("schema rejected"));

    h.runtime.shutdown(ShutdownMode::Graceful).await;
}

// Scenario D: timeouts consume the retry budget and end in `dead`.
#[tokio::test(start_paused = true)]
async fn timeout_retries_then_dead() {
    let def = JobDefinition::builder()
        .name("trajectory_export")
        .schedule(Schedule::Manual)
        .timeout(Duration::from_millis(500))
        .retry_policy(RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(60),
            retryable_error_kinds: [ErrorKind::Timeout].into_iter().collect(),
        })
        .handler(handler_fn(|_ctx| async move {
            // Ignores cancellation entirely; the runtime detaches it.
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }))
        .build();

    let h = start(vec![def], RuntimeConfig::default()).await;
    h.runtime
        .trigger("trajectory_export", Value::Null)
        .await
        .unwrap();

    wait_until(|| {
        h.store
            .all_runs()
            .iter()
            .any(|r| r.status == RunStatus::Dead)
    })
    .await;

    let mut runs = h.store.all_runs();
    runs.sort_by_key(|r| r.attempt);
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].status, RunStatus::TimedOut);
    assert_eq!(runs[0].error_kind, Some(ErrorKind::Timeout));
    assert_eq!(runs[1].status, RunStatus::Dead);
    assert_eq!(runs[1].error_kind, Some(ErrorKind::Timeout));

    // Deadline respect: timeout plus the detach grace.
    for run in &runs {
        assert!(run.duration_ms().unwrap() <= 1_600, "run held its slot too long");
    }

    h.runtime.shutdown(ShutdownMode::Graceful).await;
}

// Scenario A: two replicas race for a per-job singleton lease; runs never
// overlap and lost races are counted.
#[tokio::test(start_paused = true)]
async fn singleton_runs_never_overlap_across_replicas() {
    let clock = Arc::new(SimClock::at(epoch()));
    let store = Arc::new(MemoryRunStore::new(clock.clone()));

    let slow_singleton = || {
        JobDefinition::builder()
            .name("settle_escrow")
            .schedule(Schedule::parse("every 1s").unwrap())
            .singleton_policy(SingletonPolicy::PerJob)
            .retry_policy(RetryPolicy::none())
            .handler(handler_fn(|ctx| async move {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(3)) => {}
                    _ = ctx.done() => {}
                }
                Ok(())
            }))
            .build()
    };

    let config = RuntimeConfig {
        shutdown_grace: Duration::from_secs(1),
        ..RuntimeConfig::default()
    };

    let r1 = start_on(
        vec![slow_singleton()],
        config.clone(),
        clock.clone(),
        store.clone(),
        "replica-1",
    )
    .await;
    let r2 = start_on(
        vec![slow_singleton()],
        config,
        clock.clone(),
        store.clone(),
        "replica-2",
    )
    .await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    r1.runtime.shutdown(ShutdownMode::Graceful).await;
    r2.runtime.shutdown(ShutdownMode::Graceful).await;

    let runs = store.all_runs();
    assert!(runs.len() >= 2, "expected some runs, got {}", runs.len());

    let mut intervals: Vec<(DateTime<Utc>, DateTime<Utc>)> = runs
        .iter()
        .filter_map(|r| Some((r.started_at?, r.finished_at?)))
        .collect();
    intervals.sort();
    for pair in intervals.windows(2) {
        assert!(
            pair[0].1 <= pair[1].0,
            "singleton intervals overlap: {pair:?}"
        );
    }

    let skipped = r1.metrics.counter_total("dispatcher_skipped_held")
        + r2.metrics.counter_total("dispatcher_skipped_held");
    assert!(skipped >= 5, "expected lost races, got {skipped}");
}

// Scenario F: graceful shutdown cancels in-flight runs; cooperative handlers
// finish, stubborn ones are marked cancelled.
#[tokio::test(start_paused = true)]
async fn graceful_shutdown_cancels_in_flight_runs() {
    let cooperative = JobDefinition::builder()
        .name("cooperative")
        .schedule(Schedule::Manual)
        .handler(handler_fn(|ctx| async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(10)) => {}
                _ = ctx.done() => {}
            }
            Ok(())
        }))
        .build();
    let stubborn = JobDefinition::builder()
        .name("stubborn")
        .schedule(Schedule::Manual)
        .handler(handler_fn(|_ctx| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        }))
        .build();

    let config = RuntimeConfig {
        shutdown_grace: Duration::from_secs(3),
        ..RuntimeConfig::default()
    };
    let h = start(vec![cooperative, stubborn], config).await;

    let coop_id = h.runtime.trigger("cooperative", Value::Null).await.unwrap();
    let stub_id = h.runtime.trigger("stubborn", Value::Null).await.unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    h.runtime.shutdown(ShutdownMode::Graceful).await;

    let runs = h.store.all_runs();
    let coop = runs.iter().find(|r| r.run_id == coop_id).unwrap();
    let stub = runs.iter().find(|r| r.run_id == stub_id).unwrap();

    assert_eq!(coop.status, RunStatus::Succeeded);
    assert_eq!(stub.status, RunStatus::Cancelled);
    assert_eq!(stub.error_message.as_deref(), Some("shutdown"));

    // No new runs were dispatched after the signal.
    assert_eq!(runs.len(), 2);
}

// A second shutdown signal escalates: the graceful grace window is cut
// short and stubborn runs are hard-aborted.
#[tokio::test(start_paused = true)]
async fn second_shutdown_signal_bypasses_the_grace_window() {
    let stubborn = JobDefinition::builder()
        .name("stubborn")
        .schedule(Schedule::Manual)
        .handler(handler_fn(|_ctx| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }))
        .build();

    let config = RuntimeConfig {
        shutdown_grace: Duration::from_secs(20),
        ..RuntimeConfig::default()
    };
    let h = start(vec![stubborn], config).await;

    let run_id = h.runtime.trigger("stubborn", Value::Null).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let graceful = {
        let runtime = h.runtime.clone();
        tokio::spawn(async move {
            runtime.shutdown(ShutdownMode::Graceful).await;
        })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;

    // The second signal interrupts the in-flight graceful join.
    h.runtime.shutdown(ShutdownMode::Immediate).await;
    graceful.await.unwrap();

    let record = h
        .store
        .all_runs()
        .into_iter()
        .find(|r| r.run_id == run_id)
        .unwrap();
    assert_eq!(record.status, RunStatus::Cancelled);
    assert_eq!(record.error_message.as_deref(), Some("hard shutdown"));

    // Aborted well before the 20s grace window would have elapsed.
    let stopped_after = record.finished_at.unwrap() - epoch();
    assert!(
        stopped_after < chrono::Duration::seconds(10),
        "escalation waited out the grace window: {stopped_after}"
    );
}

// A run parked on the per-job admission gate unwinds as soon as shutdown is
// signalled instead of waiting out the admission window.
#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_the_admission_wait() {
    let def = JobDefinition::builder()
        .name("serial_export")
        .schedule(Schedule::Manual)
        .max_concurrent(1u32)
        .handler(handler_fn(|ctx| async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                _ = ctx.done() => {}
            }
            Ok(())
        }))
        .build();

    let config = RuntimeConfig {
        workers: 4,
        admission_wait: Duration::from_secs(60),
        shutdown_grace: Duration::from_secs(3),
        ..RuntimeConfig::default()
    };
    let h = start(vec![def], config).await;

    let first = h.runtime.trigger("serial_export", Value::Null).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = h.runtime.trigger("serial_export", Value::Null).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    h.runtime.shutdown(ShutdownMode::Graceful).await;

    let runs = h.store.all_runs();
    let first_record = runs.iter().find(|r| r.run_id == first).unwrap();
    let second_record = runs.iter().find(|r| r.run_id == second).unwrap();

    assert_eq!(first_record.status, RunStatus::Succeeded);
    assert_eq!(second_record.status, RunStatus::Cancelled);
    assert_eq!(second_record.error_message.as_deref(), Some("shutdown"));

    // Unwound at the shutdown signal, nowhere near the 60s admission wait.
    let waited = second_record.finished_at.unwrap() - epoch();
    assert!(
        waited < chrono::Duration::seconds(10),
        "admission wait ignored shutdown: {waited}"
    );
}

// Catch-up: with fire_once, exactly the latest missed fire is enqueued.
#[tokio::test(start_paused = true)]
async fn fire_once_catch_up_enqueues_latest_missed_fire() {
    let clock = Arc::new(SimClock::at(epoch()));
    let store = Arc::new(MemoryRunStore::new(clock.clone()));

    // The replica last served the fire 5.5 minutes ago.
    let last_fire = epoch() - chrono::Duration::seconds(330);
    let mut seeded = RunRecord::new(
        Uuid::new_v4(),
        "poll_transit_feed",
        1,
        Some(last_fire),
        Value::Null,
        "replica-0",
        last_fire,
    );
    seeded.status = RunStatus::Succeeded;
    seeded.finished_at = Some(last_fire);
    store.create_run(&seeded).await.unwrap();

    let def = JobDefinition::builder()
        .name("poll_transit_feed")
        .schedule(Schedule::parse("every 1m").unwrap())
        .retry_policy(RetryPolicy::none())
        .handler(handler_fn(|_ctx| async { Ok(()) }))
        .build();

    let h = start_on(
        vec![def],
        RuntimeConfig::default(),
        clock,
        store.clone(),
        "replica-1",
    )
    .await;

    // Let the catch-up fire and the on-the-minute fire at the epoch execute.
    tokio::time::sleep(Duration::from_secs(5)).await;
    h.runtime.shutdown(ShutdownMode::Graceful).await;

    let runs: Vec<_> = store
        .all_runs()
        .into_iter()
        .filter(|r| r.run_id != seeded.run_id)
        .collect();

    let latest_missed = epoch() - chrono::Duration::seconds(60);
    assert!(
        runs.iter()
            .any(|r| r.scheduled_for == Some(latest_missed)),
        "latest missed fire was not enqueued"
    );
    // Older missed fires were discarded.
    for r in &runs {
        let fire = r.scheduled_for.unwrap();
        assert!(
            fire >= latest_missed,
            "older missed fire {fire} should have been skipped"
        );
    }
}

// Child runs carry parent_run_id and the trigger depth is bounded.
#[tokio::test(start_paused = true)]
async fn child_triggers_set_parentage_and_depth_is_bounded() {
    let parent = JobDefinition::builder()
        .name("close_trip")
        .schedule(Schedule::Manual)
        .handler(handler_fn(|ctx| async move {
            let child = ctx
                .trigger_and_wait("notify_rider", Value::Null)
                .await
                .map_err(JobError::from)?;
            ctx.metric("child_attempts", child.attempt as f64);
            Ok(())
        }))
        .build();
    let child = manual_job("notify_rider");

    let h = start(vec![parent, child], RuntimeConfig::default()).await;
    let parent_record = h
        .runtime
        .run_to_completion("close_trip", Value::Null, TriggerOptions::default())
        .await
        .unwrap();
    assert_eq!(parent_record.status, RunStatus::Succeeded);

    let child_record = h
        .store
        .all_runs()
        .into_iter()
        .find(|r| r.job_name == "notify_rider")
        .unwrap();
    assert_eq!(child_record.parent_run_id, Some(parent_record.run_id));

    h.runtime.shutdown(ShutdownMode::Graceful).await;
}

#[tokio::test(start_paused = true)]
async fn recursive_triggers_stop_at_the_depth_bound() {
    let def = JobDefinition::builder()
        .name("reindex_shard")
        .schedule(Schedule::Manual)
        .retry_policy(RetryPolicy::none())
        .handler(handler_fn(|ctx| async move {
            match ctx.trigger("reindex_shard", Value::Null).await {
                Ok(_) => Ok(()),
                Err(e) => Err(e.into()),
            }
        }))
        .build();

    let h = start(vec![def], RuntimeConfig::default()).await;
    h.runtime.trigger("reindex_shard", Value::Null).await.unwrap();

    wait_until(|| {
        h.store
            .all_runs()
            .iter()
            .any(|r| r.error_kind == Some(ErrorKind::InvalidInput))
    })
    .await;

    // depth 0..=8 ran; the ninth run's trigger was refused.
    let runs = h.store.all_runs();
    assert_eq!(runs.len(), 9);
    assert_eq!(
        runs.iter()
            .filter(|r| r.status == RunStatus::Failed)
            .count(),
        1
    );

    h.runtime.shutdown(ShutdownMode::Graceful).await;
}

// Backpressure: a full pool queue rejects the trigger and releases state.
#[tokio::test(start_paused = true)]
async fn full_queue_surfaces_backpressure() {
    let def = JobDefinition::builder()
        .name("crunch")
        .schedule(Schedule::Manual)
        .max_concurrent(4u32)
        .handler(handler_fn(|ctx| async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                _ = ctx.done() => {}
            }
            Ok(())
        }))
        .build();

    let config = RuntimeConfig {
        workers: 1,
        queue_capacity: 1,
        shutdown_grace: Duration::from_millis(100),
        ..RuntimeConfig::default()
    };
    let h = start(vec![def], config).await;

    h.runtime.trigger("crunch", Value::Null).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.runtime.trigger("crunch", Value::Null).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = h.runtime.trigger("crunch", Value::Null).await.unwrap_err();
    assert!(matches!(err, TriggerError::Rejected { .. }), "got {err:?}");
    assert!(h.metrics.counter_total("dispatcher_skipped_backpressure") >= 1);

    h.runtime.shutdown(ShutdownMode::Graceful).await;
}

// Per-job concurrency: the second run waits for admission and is cancelled
// when the wait times out.
#[tokio::test(start_paused = true)]
async fn admission_timeout_cancels_the_waiting_run() {
    let def = JobDefinition::builder()
        .name("serial_import")
        .schedule(Schedule::Manual)
        .max_concurrent(1u32)
        .handler(handler_fn(|ctx| async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(2)) => {}
                _ = ctx.done() => {}
            }
            Ok(())
        }))
        .build();

    let config = RuntimeConfig {
        workers: 4,
        admission_wait: Duration::from_millis(100),
        ..RuntimeConfig::default()
    };
    let h = start(vec![def], config).await;

    let first = h.runtime.trigger("serial_import", Value::Null).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = h.runtime.trigger("serial_import", Value::Null).await.unwrap();

    let second_record = wait_terminal(&h.store, second).await;
    assert_eq!(second_record.status, RunStatus::Cancelled);
    assert_eq!(
        second_record.error_message.as_deref(),
        Some("admission wait timed out")
    );
    assert_eq!(h.metrics.counter_total("pool_skipped_admission"), 1);

    let first_record = wait_terminal(&h.store, first).await;
    assert_eq!(first_record.status, RunStatus::Succeeded);

    h.runtime.shutdown(ShutdownMode::Graceful).await;
}

// Singleton by input hash: same inputs are mutually exclusive, different
// inputs run independently.
#[tokio::test(start_paused = true)]
async fn input_hash_singleton_scopes_exclusion_to_the_inputs() {
    let schema = InputSchema::new(vec![ParamSpec::required("resource", ParamType::String)]);
    let def = JobDefinition::builder()
        .name("sync_provider")
        .schedule(Schedule::Manual)
        .input_schema(schema)
        .singleton_policy(SingletonPolicy::PerJobAndInputHash)
        .handler(handler_fn(|ctx| async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(2)) => {}
                _ = ctx.done() => {}
            }
            Ok(())
        }))
        .build();

    let h = start(vec![def], RuntimeConfig::default()).await;

    h.runtime
        .trigger("sync_provider", json!({ "resource": "metro" }))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Different inputs: a separate singleton key, so it is admitted.
    h.runtime
        .trigger("sync_provider", json!({ "resource": "rail" }))
        .await
        .unwrap();

    // Same inputs: the lease is held.
    let err = h
        .runtime
        .trigger("sync_provider", json!({ "resource": "metro" }))
        .await
        .unwrap_err();
    assert!(matches!(err, TriggerError::SingletonHeld { .. }), "got {err:?}");

    h.runtime.shutdown(ShutdownMode::Graceful).await;
}

// Event-driven schedules fire on emit_event and record their cause.
#[tokio::test(start_paused = true)]
async fn events_fan_out_to_subscribed_jobs() {
    let subscribed = JobDefinition::builder()
        .name("notify_rider")
        .schedule(Schedule::parse("on_event: trip_closed").unwrap())
        .handler(handler_fn(|_ctx| async { Ok(()) }))
        .build();
    let other = manual_job("unrelated");

    let h = start(vec![subscribed, other], RuntimeConfig::default()).await;

    let run_ids = h
        .runtime
        .emit_event("trip_closed", Value::Null)
        .await
        .unwrap();
    assert_eq!(run_ids.len(), 1);

    let record = wait_terminal(&h.store, run_ids[0]).await;
    assert_eq!(record.job_name, "notify_rider");
    assert_eq!(record.trigger_cause.as_deref(), Some("event:trip_closed"));
    assert!(record.scheduled_for.is_none());

    h.runtime.shutdown(ShutdownMode::Graceful).await;
}

// Dedupe keys make triggers idempotent while a run is active.
#[tokio::test(start_paused = true)]
async fn dedupe_key_reuses_the_active_run() {
    let def = JobDefinition::builder()
        .name("refresh_cache")
        .schedule(Schedule::Manual)
        .handler(handler_fn(|ctx| async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(2)) => {}
                _ = ctx.done() => {}
            }
            Ok(())
        }))
        .build();

    let h = start(vec![def], RuntimeConfig::default()).await;
    let options = TriggerOptions {
        dedupe_key: Some("refresh:tenant-7".to_string()),
        ..TriggerOptions::default()
    };

    let first = h
        .runtime
        .trigger_with("refresh_cache", Value::Null, options.clone())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = h
        .runtime
        .trigger_with("refresh_cache", Value::Null, options)
        .await
        .unwrap();

    assert_eq!(first, second, "active dedupe key should reuse the run");
    assert_eq!(h.store.all_runs().len(), 1);

    h.runtime.shutdown(ShutdownMode::Graceful).await;
}

// Dead runs can be replayed with lineage back to the original.
#[tokio::test(start_paused = true)]
async fn dead_runs_can_be_replayed() {
    let handler = ScriptedHandler::fail_times(2, JobError::transient("still down"));
    let def = JobDefinition::builder()
        .name("export_ledger")
        .schedule(Schedule::Manual)
        .retry_policy(RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(1),
            retryable_error_kinds: [ErrorKind::TransientDependency].into_iter().collect(),
        })
        .handler(handler as Arc<dyn JobHandler>)
        .build();

    let h = start(vec![def], RuntimeConfig::default()).await;
    h.runtime.trigger("export_ledger", Value::Null).await.unwrap();

    wait_until(|| {
        h.store
            .all_runs()
            .iter()
            .any(|r| r.status == RunStatus::Dead)
    })
    .await;
    let dead = h
        .store
        .all_runs()
        .into_iter()
        .find(|r| r.status == RunStatus::Dead)
        .unwrap();

    // Replaying a non-dead run is refused.
    let ok_run = h
        .store
        .all_runs()
        .into_iter()
        .find(|r| r.status == RunStatus::Failed)
        .unwrap();
    assert!(h.runtime.replay(ok_run.run_id).await.is_err());

    let replay_id = h.runtime.replay(dead.run_id).await.unwrap();
    let replayed = wait_terminal(&h.store, replay_id).await;
    assert_eq!(replayed.parent_run_id, Some(dead.run_id));
    assert_eq!(replayed.attempt, 1, "replay starts a fresh attempt chain");
    assert_eq!(replayed.status, RunStatus::Succeeded);

    h.runtime.shutdown(ShutdownMode::Graceful).await;
}

// Scheduled fires bind declared defaults into the snapshot.
#[tokio::test(start_paused = true)]
async fn scheduled_fires_bind_defaults() {
    let schema = InputSchema::new(vec![ParamSpec::with_default(
        "window_minutes",
        ParamType::Integer,
        "15",
    )]);
    let def = JobDefinition::builder()
        .name("window_rollup")
        .schedule(Schedule::parse("every 1s").unwrap())
        .input_schema(schema)
        .retry_policy(RetryPolicy::none())
        .handler(handler_fn(|ctx| async move {
            assert_eq!(ctx.inputs().get("window_minutes").unwrap().as_i64(), Some(15));
            Ok(())
        }))
        .build();

    let h = start(vec![def], RuntimeConfig::default()).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    h.runtime.shutdown(ShutdownMode::Graceful).await;

    let runs = h.store.all_runs();
    assert!(!runs.is_empty());
    for run in runs.iter().filter(|r| r.status == RunStatus::Succeeded) {
        assert_eq!(run.input_snapshot["window_minutes"], 15);
        assert!(run.scheduled_for.is_some());
    }
}

// The CLI run path suppresses retries without --retry.
#[tokio::test(start_paused = true)]
async fn suppressed_retry_fails_without_consuming_budget() {
    let handler = ScriptedHandler::fail_times(5, JobError::transient("down"));
    let def = JobDefinition::builder()
        .name("flaky")
        .schedule(Schedule::Manual)
        .handler(handler.clone() as Arc<dyn JobHandler>)
        .build();

    let h = start(vec![def], RuntimeConfig::default()).await;
    let record = h
        .runtime
        .run_to_completion(
            "flaky",
            Value::Null,
            TriggerOptions {
                suppress_retry: true,
                ..TriggerOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(record.status, RunStatus::Failed);
    tokio::time::sleep(Duration::from_secs(90)).await;
    assert_eq!(h.store.all_runs().len(), 1, "no retry was scheduled");
    assert_eq!(handler.invocations(), 1);

    h.runtime.shutdown(ShutdownMode::Graceful).await;
}
