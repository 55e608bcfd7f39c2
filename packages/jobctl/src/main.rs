//! Operational CLI and daemon entrypoint for the job runtime.
//!
//! `jobctl serve` runs the dispatcher and worker pool until a shutdown
//! signal (a second signal hard-aborts). The other subcommands are thin
//! wrappers over the runtime's host surface.

mod jobs;

use std::process::exit;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use job_runtime::{
    cli, JobRuntime, MemoryRunStore, PostgresRunStore, RunStore, RuntimeConfig, ShutdownMode,
    SystemClock, TracingAlertSink,
};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "jobctl", about = "Background job runtime control")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler and worker pool until shutdown.
    Serve,
    /// Execute one job synchronously, bypassing the schedule.
    Run {
        job_name: String,
        /// Inputs as key=value pairs.
        inputs: Vec<String>,
        /// Honor the job's retry policy instead of failing on the first error.
        #[arg(long)]
        retry: bool,
    },
    /// Print registered jobs and their next fire times.
    List,
    /// Print one run record.
    Status { run_id: String },
    /// List dead-lettered runs.
    Dead {
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Re-enqueue a dead run.
    Replay { run_id: String },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,job_runtime=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let runtime = match start_runtime().await {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("startup failed: {error:#}");
            exit(cli::EXIT_STARTUP);
        }
    };

    let code = match cli.command {
        Command::Serve => serve(&runtime).await,
        Command::Run {
            job_name,
            inputs,
            retry,
        } => {
            let code = cli::cmd_run(&runtime, &job_name, &inputs, retry).await;
            runtime.shutdown(ShutdownMode::Graceful).await;
            code
        }
        Command::List => {
            let code = cli::cmd_list(&runtime).await;
            runtime.shutdown(ShutdownMode::Graceful).await;
            code
        }
        Command::Status { run_id } => {
            let code = cli::cmd_status(&runtime, &run_id).await;
            runtime.shutdown(ShutdownMode::Graceful).await;
            code
        }
        Command::Dead { limit } => {
            let code = cli::cmd_dead(&runtime, limit).await;
            runtime.shutdown(ShutdownMode::Graceful).await;
            code
        }
        Command::Replay { run_id } => {
            let code = cli::cmd_replay(&runtime, &run_id).await;
            runtime.shutdown(ShutdownMode::Graceful).await;
            code
        }
    };

    exit(code);
}

async fn start_runtime() -> Result<JobRuntime> {
    let config = RuntimeConfig::from_env().context("failed to load runtime configuration")?;
    let store = connect_store().await?;
    let registry = jobs::build_registry(Arc::clone(&store), &config)
        .context("failed to build job registry")?;

    JobRuntime::builder(registry, store)
        .config(config)
        .alert_sink("ops", Arc::new(TracingAlertSink))
        .start()
        .await
        .context("failed to start job runtime")
}

async fn connect_store() -> Result<Arc<dyn RunStore>> {
    match std::env::var("DATABASE_URL") {
        Ok(url) => {
            tracing::info!("connecting to run store");
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(&url)
                .await
                .context("failed to connect to the run store database")?;
            let store = PostgresRunStore::new(pool);
            store
                .migrate()
                .await
                .context("failed to migrate the run store schema")?;
            Ok(Arc::new(store))
        }
        Err(_) => {
            tracing::warn!("DATABASE_URL not set, using the in-memory run store");
            Ok(Arc::new(MemoryRunStore::new(Arc::new(SystemClock))))
        }
    }
}

/// Run until a shutdown signal; a second signal hard-aborts with a non-zero
/// exit.
async fn serve(runtime: &JobRuntime) -> i32 {
    tracing::info!(replica_id = %runtime.replica_id(), "serving");

    if tokio::signal::ctrl_c().await.is_err() {
        tracing::error!("failed to install the signal handler");
        runtime.shutdown(ShutdownMode::Immediate).await;
        return cli::EXIT_STARTUP;
    }
    tracing::info!("shutdown signal received, finishing in-flight runs");

    let graceful = runtime.clone();
    let drain = tokio::spawn(async move {
        graceful.shutdown(ShutdownMode::Graceful).await;
    });

    tokio::select! {
        _ = drain => cli::EXIT_SUCCESS,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("second signal, aborting");
            runtime.shutdown(ShutdownMode::Immediate).await;
            cli::EXIT_JOB_FAILED
        }
    }
}
