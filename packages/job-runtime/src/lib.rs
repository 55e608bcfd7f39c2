//! Background job runtime for the platform's scheduled and on-demand work.
//!
//! The runtime hosts a catalog of job definitions and takes care of
//! everything around the job bodies: schedule resolution (cron, interval,
//! one-shot, event-driven), lease-based singleton execution across replicas,
//! a bounded worker pool with per-job concurrency, retry/backoff with a
//! small failure taxonomy, durable run records, and alert/metric fan-out.
//!
//! # Architecture
//!
//! ```text
//! Schedule resolver ─► Dispatcher ─► Run store (lease) ─► Worker pool
//!                          ▲                                  │
//!                          │         retries, triggers        ▼
//!                          └─────────────◄──────────── Handler + JobContext
//! ```
//!
//! Job bodies are opaque: a handler receives a [`JobContext`] (identity,
//! deadline, cancellation, metrics, child triggers) and returns `Ok` or a
//! classified [`JobError`]. Everything else is the runtime's problem.
//!
//! # Example
//!
//! ```ignore
//! let registry = Arc::new(JobRegistry::new());
//! registry.register(
//!     JobDefinition::builder()
//!         .name("trip_reconciliation")
//!         .schedule(Schedule::parse("0 2 * * * @America/Chicago")?)
//!         .singleton_policy(SingletonPolicy::PerJob)
//!         .handler(handler_fn(move |ctx| {
//!             let db = db.clone();
//!             async move {
//!                 let rows = db.reconcile(ctx.inputs()).await
//!                     .map_err(|e| ctx.fail_with(ErrorKind::TransientDependency, e))?;
//!                 ctx.metric("rows", rows as f64);
//!                 Ok(())
//!             }
//!         }))
//!         .build(),
//! )?;
//!
//! let store = Arc::new(MemoryRunStore::new(Arc::new(SystemClock)));
//! let runtime = JobRuntime::builder(registry, store).start().await?;
//! ```

pub mod alert;
pub mod cli;
pub mod clock;
mod config;
pub mod context;
pub mod definition;
mod dispatcher;
pub mod error;
pub mod input;
pub mod metrics;
pub mod registry;
pub mod run;
pub mod schedule;
pub mod store;
pub mod testing;
mod worker;

mod runtime;

pub use alert::{AlertEvent, AlertRouter, AlertSink, TracingAlertSink};
pub use clock::{new_run_id, Clock, ReplicaId, SharedClock, SystemClock};
pub use config::RuntimeConfig;
pub use context::{ChildTrigger, JobContext, LogRecord};
pub use definition::{
    handler_fn, JobDefinition, JobHandler, JobPriority, RetryPolicy, SingletonPolicy,
};
pub use error::{ErrorKind, JobError, RegistryError, StoreError, TriggerError};
pub use input::{InputSchema, InputSnapshot, ParamSpec, ParamType, ParamValue};
pub use metrics::{MetricsSink, NullMetrics, SharedMetrics, TracingMetrics};
pub use registry::JobRegistry;
pub use run::{RunPatch, RunRecord, RunStatus};
pub use runtime::{JobRuntime, RuntimeBuilder, ShutdownMode, TriggerOptions};
pub use schedule::{CatchUpPolicy, Schedule, ScheduleParseError};
pub use store::{
    LeaseGrant, LeaseKey, MemoryRunStore, PostgresRunStore, RenewOutcome, RunFilter, RunStore,
};
