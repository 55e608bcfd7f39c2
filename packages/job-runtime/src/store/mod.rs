//! The run store: durable run records and singleton leases.
//!
//! The dispatcher and workers coordinate across replicas exclusively through
//! these primitives. Lease acquisition must be linearizable per key; reads
//! used by the dispatcher may be bounded-stale.
//!
//! Two reference backends ship with the runtime: [`MemoryRunStore`] (single
//! process, also the test substrate) and [`PostgresRunStore`] (shared across
//! replicas, conditional updates on a uniquely-constrained lease table).

mod memory;
mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::StoreError;
use crate::run::{RunPatch, RunRecord, RunStatus};

pub use memory::MemoryRunStore;
pub use postgres::PostgresRunStore;

/// The unit of mutual exclusion: job name, optionally suffixed with a stable
/// hash of the bound inputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseKey(String);

impl LeaseKey {
    pub fn per_job(job_name: &str) -> Self {
        Self(job_name.to_string())
    }

    pub fn per_job_and_hash(job_name: &str, input_hash: &str) -> Self {
        Self(format!("{job_name}#{input_hash}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LeaseKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of a lease acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseGrant {
    Acquired {
        /// The previous holder, when the lease was taken over an expired one.
        recovered_from: Option<String>,
    },
    HeldBy {
        holder: String,
    },
}

impl LeaseGrant {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LeaseGrant::Acquired { .. })
    }
}

/// Outcome of a lease renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewOutcome {
    Renewed,
    /// The lease expired or was taken over; the holder must abort writes.
    Lost,
}

/// Query filter for `find_runs`. Unset fields match everything.
#[derive(Debug, Clone, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
pub struct RunFilter {
    pub job_name: Option<String>,
    pub status: Option<RunStatus>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub parent_run_id: Option<Uuid>,
    /// Only runs enqueued at or after this instant.
    pub since: Option<DateTime<Utc>>,
}

impl RunFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn matches(&self, record: &RunRecord) -> bool {
        if let Some(job_name) = &self.job_name {
            if &record.job_name != job_name {
                return false;
            }
        }
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        if let Some(scheduled_for) = self.scheduled_for {
            if record.scheduled_for != Some(scheduled_for) {
                return false;
            }
        }
        if let Some(parent) = self.parent_run_id {
            if record.parent_run_id != Some(parent) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if record.enqueued_at < since {
                return false;
            }
        }
        true
    }
}

/// Durable persistence contract for run records and leases.
///
/// Backends report failures through [`StoreError`]; the runtime maps them to
/// `ErrorKind::Unexpected` at its public boundary.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Atomically acquire the lease for `key` if no active lease exists.
    /// A lease whose `expires_at` has passed may be taken over; the previous
    /// holder is reported so the caller can surface the recovery.
    async fn try_acquire_lease(
        &self,
        key: &LeaseKey,
        ttl: Duration,
        run_id: Uuid,
        replica_id: &str,
    ) -> Result<LeaseGrant, StoreError>;

    /// Extend the lease only if `run_id` still holds it and it has not
    /// expired; otherwise report [`RenewOutcome::Lost`].
    async fn renew_lease(
        &self,
        key: &LeaseKey,
        run_id: Uuid,
        new_ttl: Duration,
    ) -> Result<RenewOutcome, StoreError>;

    /// Idempotent release. A lease not held by `run_id` is left untouched.
    async fn release_lease(&self, key: &LeaseKey, run_id: Uuid) -> Result<(), StoreError>;

    /// Persist a freshly enqueued (queued or leased) record.
    async fn create_run(&self, record: &RunRecord) -> Result<(), StoreError>;

    /// Apply a patch, rejecting status changes that violate the monotonic
    /// transition rules. Returns the updated record.
    async fn update_run(&self, run_id: Uuid, patch: RunPatch) -> Result<RunRecord, StoreError>;

    async fn get_run(&self, run_id: Uuid) -> Result<Option<RunRecord>, StoreError>;

    /// Newest-first query for observability and dead-letter tooling.
    async fn find_runs(
        &self,
        filter: &RunFilter,
        limit: i64,
    ) -> Result<Vec<RunRecord>, StoreError>;

    /// The most recent `scheduled_for` recorded for a job, used by the
    /// dispatcher's catch-up pass at startup.
    async fn latest_scheduled_for(
        &self,
        job_name: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// An existing queued/leased/running run carrying this dedupe key, if any.
    async fn find_active_by_dedupe(
        &self,
        dedupe_key: &str,
    ) -> Result<Option<RunRecord>, StoreError>;

    /// Delete finished records past their retention window. Returns the
    /// number of records removed.
    async fn purge_finished(
        &self,
        now: DateTime<Utc>,
        succeeded_ttl: Duration,
        failed_ttl: Duration,
    ) -> Result<u64, StoreError>;
}
