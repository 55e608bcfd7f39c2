//! Runtime configuration loaded from the environment.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

use crate::schedule::CatchUpPolicy;

/// Tunables for one replica of the runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Worker pool slots (`W`).
    pub workers: usize,
    /// Bounded ingress queue in front of the pool (`Q`).
    pub queue_capacity: usize,
    /// Singleton lease ttl. Heartbeats renew at ttl/3.
    pub lease_ttl: Duration,
    /// How long in-flight runs get to finish after a graceful shutdown signal.
    pub shutdown_grace: Duration,
    /// How long a run waits for a per-job concurrency slot before the pool
    /// reports admission timeout.
    pub admission_wait: Duration,
    /// How long a handler gets to return after its deadline trips before the
    /// runtime detaches it.
    pub grace_period: Duration,
    /// Catch-up behavior for jobs that do not declare their own.
    pub catch_up_default: CatchUpPolicy,
    /// Bound on parent→child trigger chains.
    pub max_trigger_depth: u32,
    /// Consecutive dispatches of one priority tier before a lower tier must
    /// be serviced.
    pub fairness_burst: usize,
    /// Retention for succeeded run records.
    pub retention_succeeded: Duration,
    /// Retention for non-success run records.
    pub retention_failed: Duration,
    /// Consecutive alert-sink failures before the sink is circuit-broken.
    pub alert_failure_threshold: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            queue_capacity: 64,
            lease_ttl: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(30),
            admission_wait: Duration::from_secs(5),
            grace_period: Duration::from_secs(1),
            catch_up_default: CatchUpPolicy::FireOnce,
            max_trigger_depth: 8,
            fairness_burst: 8,
            retention_succeeded: Duration::from_secs(30 * 86_400),
            retention_failed: Duration::from_secs(90 * 86_400),
            alert_failure_threshold: 5,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration, consulting the `RUNTIME_*` environment variables
    /// and falling back to defaults.
    pub fn from_env() -> Result<Self> {
        // Load .env if present (development).
        let _ = dotenv();

        let mut config = Self::default();

        if let Ok(raw) = env::var("RUNTIME_WORKERS") {
            config.workers = raw
                .parse()
                .context("RUNTIME_WORKERS must be a positive integer")?;
        }
        if let Ok(raw) = env::var("RUNTIME_QUEUE") {
            config.queue_capacity = raw
                .parse()
                .context("RUNTIME_QUEUE must be a positive integer")?;
        }
        if let Ok(raw) = env::var("RUNTIME_LEASE_TTL_MS") {
            let ms: u64 = raw
                .parse()
                .context("RUNTIME_LEASE_TTL_MS must be milliseconds")?;
            config.lease_ttl = Duration::from_millis(ms);
        }
        if let Ok(raw) = env::var("RUNTIME_SHUTDOWN_GRACE_MS") {
            let ms: u64 = raw
                .parse()
                .context("RUNTIME_SHUTDOWN_GRACE_MS must be milliseconds")?;
            config.shutdown_grace = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.workers >= 1, "workers must be at least 1");
        anyhow::ensure!(self.queue_capacity >= 1, "queue capacity must be at least 1");
        anyhow::ensure!(
            self.lease_ttl >= Duration::from_millis(100),
            "lease ttl below 100ms cannot be heartbeated reliably"
        );
        anyhow::ensure!(self.max_trigger_depth >= 1, "trigger depth must be at least 1");
        Ok(())
    }

    /// Heartbeat cadence for singleton lease keep-alive.
    pub fn heartbeat_interval(&self) -> Duration {
        self.lease_ttl / 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(RuntimeConfig::default().validate().is_ok());
    }

    #[test]
    fn heartbeat_is_a_third_of_the_ttl() {
        let config = RuntimeConfig {
            lease_ttl: Duration::from_secs(30),
            ..RuntimeConfig::default()
        };
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(10));
    }

    #[test]
    fn zero_workers_fails_validation() {
        let config = RuntimeConfig {
            workers: 0,
            ..RuntimeConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
