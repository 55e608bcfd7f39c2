//! In-memory run store.
//!
//! Single-process reference backend and the substrate for the runtime's own
//! tests. One mutex guards both tables, which makes every operation trivially
//! linearizable.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::error::StoreError;
use crate::run::{RunPatch, RunRecord, RunStatus};

use super::{LeaseGrant, LeaseKey, RenewOutcome, RunFilter, RunStore};

#[derive(Debug, Clone)]
struct Lease {
    holder: String,
    run_id: Uuid,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Tables {
    leases: HashMap<String, Lease>,
    runs: HashMap<Uuid, RunRecord>,
    /// Insertion order, newest last, for stable find_runs output.
    order: Vec<Uuid>,
}

pub struct MemoryRunStore {
    clock: SharedClock,
    tables: Mutex<Tables>,
}

impl MemoryRunStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            tables: Mutex::new(Tables::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of every record, for test assertions.
    pub fn all_runs(&self) -> Vec<RunRecord> {
        let tables = self.lock();
        tables
            .order
            .iter()
            .filter_map(|id| tables.runs.get(id).cloned())
            .collect()
    }

    /// Active (unexpired) lease holders, for test assertions.
    pub fn active_leases(&self) -> Vec<(String, String)> {
        let now = self.clock.now();
        self.lock()
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at > now)
            .map(|(key, lease)| (key.clone(), lease.holder.clone()))
            .collect()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn try_acquire_lease(
        &self,
        key: &LeaseKey,
        ttl: Duration,
        run_id: Uuid,
        replica_id: &str,
    ) -> Result<LeaseGrant, StoreError> {
        let now = self.clock.now();
        let expires_at = now + chrono::Duration::from_std(ttl).map_err(anyhow::Error::from)?;
        let mut tables = self.lock();

        match tables.leases.get(key.as_str()) {
            Some(lease) if lease.expires_at > now => Ok(LeaseGrant::HeldBy {
                holder: lease.holder.clone(),
            }),
            previous => {
                let recovered_from = previous.map(|l| l.holder.clone());
                tables.leases.insert(
                    key.as_str().to_string(),
                    Lease {
                        holder: replica_id.to_string(),
                        run_id,
                        expires_at,
                    },
                );
                Ok(LeaseGrant::Acquired { recovered_from })
            }
        }
    }

    async fn renew_lease(
        &self,
        key: &LeaseKey,
        run_id: Uuid,
        new_ttl: Duration,
    ) -> Result<RenewOutcome, StoreError> {
        let now = self.clock.now();
        let mut tables = self.lock();
        match tables.leases.get_mut(key.as_str()) {
            Some(lease) if lease.run_id == run_id && lease.expires_at > now => {
                lease.expires_at =
                    now + chrono::Duration::from_std(new_ttl).map_err(anyhow::Error::from)?;
                Ok(RenewOutcome::Renewed)
            }
            _ => Ok(RenewOutcome::Lost),
        }
    }

    async fn release_lease(&self, key: &LeaseKey, run_id: Uuid) -> Result<(), StoreError> {
        let mut tables = self.lock();
        if tables
            .leases
            .get(key.as_str())
            .is_some_and(|lease| lease.run_id == run_id)
        {
            tables.leases.remove(key.as_str());
        }
        Ok(())
    }

    async fn create_run(&self, record: &RunRecord) -> Result<(), StoreError> {
        let mut tables = self.lock();
        if tables.runs.contains_key(&record.run_id) {
            return Err(StoreError::DuplicateRun(record.run_id));
        }
        tables.order.push(record.run_id);
        tables.runs.insert(record.run_id, record.clone());
        Ok(())
    }

    async fn update_run(&self, run_id: Uuid, patch: RunPatch) -> Result<RunRecord, StoreError> {
        let mut tables = self.lock();
        let record = tables
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;

        if let Some(next) = patch.status {
            if !record.status.can_transition_to(next) {
                return Err(StoreError::IllegalTransition {
                    run_id,
                    from: record.status,
                    to: next,
                });
            }
        }

        patch.apply(record);
        Ok(record.clone())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<RunRecord>, StoreError> {
        Ok(self.lock().runs.get(&run_id).cloned())
    }

    async fn find_runs(
        &self,
        filter: &RunFilter,
        limit: i64,
    ) -> Result<Vec<RunRecord>, StoreError> {
        let tables = self.lock();
        let mut out = Vec::new();
        for id in tables.order.iter().rev() {
            if out.len() as i64 >= limit {
                break;
            }
            if let Some(record) = tables.runs.get(id) {
                if filter.matches(record) {
                    out.push(record.clone());
                }
            }
        }
        Ok(out)
    }

    async fn latest_scheduled_for(
        &self,
        job_name: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let tables = self.lock();
        Ok(tables
            .runs
            .values()
            .filter(|r| r.job_name == job_name)
            .filter_map(|r| r.scheduled_for)
            .max())
    }

    async fn find_active_by_dedupe(
        &self,
        dedupe_key: &str,
    ) -> Result<Option<RunRecord>, StoreError> {
        let tables = self.lock();
        Ok(tables
            .runs
            .values()
            .find(|r| {
                r.dedupe_key.as_deref() == Some(dedupe_key) && !r.status.is_terminal()
            })
            .cloned())
    }

    async fn purge_finished(
        &self,
        now: DateTime<Utc>,
        succeeded_ttl: Duration,
        failed_ttl: Duration,
    ) -> Result<u64, StoreError> {
        let succeeded_cutoff =
            now - chrono::Duration::from_std(succeeded_ttl).map_err(anyhow::Error::from)?;
        let failed_cutoff =
            now - chrono::Duration::from_std(failed_ttl).map_err(anyhow::Error::from)?;
        let mut tables = self.lock();

        let expired: Vec<Uuid> = tables
            .runs
            .values()
            .filter(|r| {
                let Some(finished) = r.finished_at else {
                    return false;
                };
                match r.status {
                    RunStatus::Succeeded => finished < succeeded_cutoff,
                    s if s.is_terminal() => finished < failed_cutoff,
                    _ => false,
                }
            })
            .map(|r| r.run_id)
            .collect();

        for id in &expired {
            tables.runs.remove(id);
        }
        tables.order.retain(|id| !expired.contains(id));
        Ok(expired.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::Value;

    use crate::clock::SystemClock;

    use super::*;

    fn store() -> MemoryRunStore {
        MemoryRunStore::new(Arc::new(SystemClock))
    }

    fn record(job: &str) -> RunRecord {
        RunRecord::new(
            crate::clock::new_run_id(),
            job,
            1,
            None,
            Value::Null,
            "replica-1",
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn lease_is_exclusive_while_active() {
        let store = store();
        let key = LeaseKey::per_job("sweep");
        let ttl = Duration::from_secs(60);

        let first = store
            .try_acquire_lease(&key, ttl, Uuid::new_v4(), "r1")
            .await
            .unwrap();
        assert!(first.is_acquired());

        let second = store
            .try_acquire_lease(&key, ttl, Uuid::new_v4(), "r2")
            .await
            .unwrap();
        assert_eq!(
            second,
            LeaseGrant::HeldBy {
                holder: "r1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn expired_lease_is_recovered_with_previous_holder() {
        let store = store();
        let key = LeaseKey::per_job("sweep");

        store
            .try_acquire_lease(&key, Duration::ZERO, Uuid::new_v4(), "r1")
            .await
            .unwrap();

        let grant = store
            .try_acquire_lease(&key, Duration::from_secs(60), Uuid::new_v4(), "r2")
            .await
            .unwrap();
        assert_eq!(
            grant,
            LeaseGrant::Acquired {
                recovered_from: Some("r1".to_string())
            }
        );
    }

    #[tokio::test]
    async fn renew_after_expiry_reports_lost() {
        let store = store();
        let key = LeaseKey::per_job("sweep");
        let run_id = Uuid::new_v4();

        store
            .try_acquire_lease(&key, Duration::ZERO, run_id, "r1")
            .await
            .unwrap();

        let outcome = store
            .renew_lease(&key, run_id, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(outcome, RenewOutcome::Lost);
    }

    #[tokio::test]
    async fn release_is_idempotent_and_holder_checked() {
        let store = store();
        let key = LeaseKey::per_job("sweep");
        let holder_run = Uuid::new_v4();

        store
            .try_acquire_lease(&key, Duration::from_secs(60), holder_run, "r1")
            .await
            .unwrap();

        // Releasing with a different run id leaves the lease untouched.
        store.release_lease(&key, Uuid::new_v4()).await.unwrap();
        assert_eq!(store.active_leases().len(), 1);

        store.release_lease(&key, holder_run).await.unwrap();
        assert!(store.active_leases().is_empty());

        // A second release of the same lease is a no-op.
        store.release_lease(&key, holder_run).await.unwrap();
    }

    #[tokio::test]
    async fn update_rejects_illegal_transition() {
        let store = store();
        let rec = record("j");
        store.create_run(&rec).await.unwrap();

        store
            .update_run(rec.run_id, RunPatch::status(RunStatus::Running))
            .await
            .unwrap();
        store
            .update_run(rec.run_id, RunPatch::status(RunStatus::Succeeded))
            .await
            .unwrap();

        let err = store
            .update_run(rec.run_id, RunPatch::status(RunStatus::Running))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("illegal status transition"));
    }

    #[tokio::test]
    async fn find_runs_is_newest_first_and_limited() {
        let store = store();
        for _ in 0..5 {
            store.create_run(&record("j")).await.unwrap();
        }
        let runs = store.find_runs(&RunFilter::all(), 3).await.unwrap();
        assert_eq!(runs.len(), 3);
        assert!(runs[0].enqueued_at >= runs[2].enqueued_at);
    }

    #[tokio::test]
    async fn dedupe_lookup_ignores_terminal_runs() {
        let store = store();
        let mut rec = record("j");
        rec.dedupe_key = Some("k1".to_string());
        store.create_run(&rec).await.unwrap();

        assert!(store.find_active_by_dedupe("k1").await.unwrap().is_some());

        store
            .update_run(rec.run_id, RunPatch::status(RunStatus::Cancelled))
            .await
            .unwrap();
        assert!(store.find_active_by_dedupe("k1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn purge_honors_per_status_retention() {
        let store = store();
        let now = Utc::now();

        let mut old_success = record("j");
        old_success.status = RunStatus::Succeeded;
        old_success.finished_at = Some(now - chrono::Duration::days(40));
        store.create_run(&old_success).await.unwrap();

        let mut old_failure = record("j");
        old_failure.status = RunStatus::Failed;
        old_failure.finished_at = Some(now - chrono::Duration::days(40));
        store.create_run(&old_failure).await.unwrap();

        let purged = store
            .purge_finished(
                now,
                Duration::from_secs(30 * 86_400),
                Duration::from_secs(90 * 86_400),
            )
            .await
            .unwrap();

        // The 40-day-old success is past its 30-day window; the failure keeps
        // its 90-day window.
        assert_eq!(purged, 1);
        assert_eq!(store.all_runs().len(), 1);
        assert_eq!(store.all_runs()[0].status, RunStatus::Failed);
    }
}
