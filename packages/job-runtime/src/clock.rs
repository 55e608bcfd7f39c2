//! Clock and identity primitives shared across the runtime.
//!
//! Run timestamps flow through the [`Clock`] trait so timing-sensitive tests
//! can substitute a simulated clock; production code uses [`SystemClock`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Source of UTC timestamps for run records, leases, and schedules.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation used outside of tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub type SharedClock = Arc<dyn Clock>;

/// Allocate a globally unique run identifier.
///
/// UUIDv7 keeps run ids roughly time-ordered, which the run store indexes
/// benefit from.
pub fn new_run_id() -> Uuid {
    Uuid::now_v7()
}

/// Identity of one process instance, stable across a single boot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplicaId(String);

impl ReplicaId {
    /// Resolve the replica identity: `RUNTIME_REPLICA_ID` wins, otherwise
    /// hostname plus pid.
    pub fn detect() -> Self {
        if let Ok(id) = std::env::var("RUNTIME_REPLICA_ID") {
            if !id.trim().is_empty() {
                return Self(id);
            }
        }

        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string());
        Self(format!("{}-{}", host, std::process::id()))
    }

    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_unique() {
        let a = new_run_id();
        let b = new_run_id();
        assert_ne!(a, b);
    }

    #[test]
    fn replica_id_prefers_env_override() {
        // detect() reads the env var at call time; use from_string to avoid
        // mutating process env in parallel tests.
        let id = ReplicaId::from_string("replica-7");
        assert_eq!(id.as_str(), "replica-7");
    }

    #[test]
    fn detected_replica_id_is_nonempty() {
        let id = ReplicaId::detect();
        assert!(!id.as_str().is_empty());
    }
}
