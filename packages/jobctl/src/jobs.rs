//! Built-in maintenance jobs every deployment registers.
//!
//! Domain jobs are registered by their own crates at startup; the two jobs
//! here keep the run store itself healthy.

use std::sync::Arc;

use anyhow::Result;
use job_runtime::store::RunFilter;
use job_runtime::{
    handler_fn, ErrorKind, JobDefinition, JobPriority, JobRegistry, RetryPolicy, RunStatus,
    RunStore, RuntimeConfig, Schedule, SingletonPolicy,
};

/// Build the base registry with the maintenance jobs installed.
pub fn build_registry(
    store: Arc<dyn RunStore>,
    config: &RuntimeConfig,
) -> Result<Arc<JobRegistry>> {
    let registry = JobRegistry::new();

    registry.register(retention_sweep(Arc::clone(&store), config)?)?;
    registry.register(dead_letter_digest(store)?)?;

    Ok(Arc::new(registry))
}

/// Daily purge of run records past their retention windows.
fn retention_sweep(store: Arc<dyn RunStore>, config: &RuntimeConfig) -> Result<JobDefinition> {
    let succeeded_ttl = config.retention_succeeded;
    let failed_ttl = config.retention_failed;

    let definition = JobDefinition::builder()
        .name("run_retention_sweep")
        .description("Delete run records past their retention windows")
        .schedule(Schedule::parse("0 4 * * *")?)
        .singleton_policy(SingletonPolicy::PerJob)
        .priority(JobPriority::Low)
        .retry_policy(RetryPolicy::none())
        .handler(handler_fn(move |ctx| {
            let store = Arc::clone(&store);
            async move {
                let purged = store
                    .purge_finished(ctx.now(), succeeded_ttl, failed_ttl)
                    .await
                    .map_err(|e| ctx.fail_with(ErrorKind::TransientDependency, e.into()))?;
                ctx.metric("purged", purged as f64);
                ctx.info(format!("purged {purged} expired run records"));
                Ok(())
            }
        }))
        .build();
    Ok(definition)
}

/// Daily summary of dead-lettered runs awaiting operator attention.
fn dead_letter_digest(store: Arc<dyn RunStore>) -> Result<JobDefinition> {
    let definition = JobDefinition::builder()
        .name("dead_letter_digest")
        .description("Log a summary of dead runs so they do not rot unseen")
        .schedule(Schedule::parse("0 6 * * *")?)
        .singleton_policy(SingletonPolicy::PerJob)
        .priority(JobPriority::Low)
        .retry_policy(RetryPolicy::none())
        .handler(handler_fn(move |ctx| {
            let store = Arc::clone(&store);
            async move {
                let filter = RunFilter::builder().status(RunStatus::Dead).build();
                let dead = store
                    .find_runs(&filter, 200)
                    .await
                    .map_err(|e| ctx.fail_with(ErrorKind::TransientDependency, e.into()))?;

                ctx.metric("dead_runs", dead.len() as f64);
                if dead.is_empty() {
                    ctx.info("no dead runs");
                } else {
                    for run in &dead {
                        ctx.warn(format!(
                            "dead run {} of {} after {} attempts: {}",
                            run.run_id,
                            run.job_name,
                            run.attempt,
                            run.error_message.as_deref().unwrap_or("unknown error")
                        ));
                    }
                }
                Ok(())
            }
        }))
        .build();
    Ok(definition)
}
