//! PostgreSQL-backed run store.
//!
//! Lease acquisition takes a row lock on the lease key inside a transaction,
//! which makes the grant decision linearizable per key. Renewals and releases
//! are single conditional statements. Status transitions are checked under
//! `FOR UPDATE` so concurrent writers cannot interleave an illegal step.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StoreError;
use crate::run::{RunPatch, RunRecord, RunStatus};

use super::{LeaseGrant, LeaseKey, RenewOutcome, RunFilter, RunStore};

const RUN_COLUMNS: &str = "run_id, job_name, attempt, scheduled_for, enqueued_at, leased_at, \
                           started_at, finished_at, replica_id, status, input_snapshot, \
                           error_kind, error_message, error_stack, metrics, log_tail, \
                           parent_run_id, trigger_cause, dedupe_key";

pub struct PostgresRunStore {
    pool: PgPool,
}

impl PostgresRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the runtime's schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run job runtime migrations")?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RunStore for PostgresRunStore {
    async fn try_acquire_lease(
        &self,
        key: &LeaseKey,
        ttl: Duration,
        run_id: Uuid,
        replica_id: &str,
    ) -> Result<LeaseGrant, StoreError> {
        let ttl_ms = ttl.as_millis() as i64;
        let mut txn = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, (String, Uuid, DateTime<Utc>)>(
            r#"
            SELECT holder, run_id, expires_at
            FROM job_leases
            WHERE key = $1
            FOR UPDATE
            "#,
        )
        .bind(key.as_str())
        .fetch_optional(&mut *txn)
        .await?;

        let grant = match existing {
            Some((holder, _, expires_at)) if expires_at > Utc::now() => {
                LeaseGrant::HeldBy { holder }
            }
            Some((previous_holder, _, _)) => {
                sqlx::query(
                    r#"
                    UPDATE job_leases
                    SET holder = $1,
                        run_id = $2,
                        acquired_at = NOW(),
                        expires_at = NOW() + ($3 || ' milliseconds')::INTERVAL
                    WHERE key = $4
                    "#,
                )
                .bind(replica_id)
                .bind(run_id)
                .bind(ttl_ms.to_string())
                .bind(key.as_str())
                .execute(&mut *txn)
                .await?;

                LeaseGrant::Acquired {
                    recovered_from: Some(previous_holder),
                }
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO job_leases (key, holder, run_id, acquired_at, expires_at)
                    VALUES ($1, $2, $3, NOW(), NOW() + ($4 || ' milliseconds')::INTERVAL)
                    "#,
                )
                .bind(key.as_str())
                .bind(replica_id)
                .bind(run_id)
                .bind(ttl_ms.to_string())
                .execute(&mut *txn)
                .await?;

                LeaseGrant::Acquired {
                    recovered_from: None,
                }
            }
        };

        txn.commit().await?;
        Ok(grant)
    }

    async fn renew_lease(
        &self,
        key: &LeaseKey,
        run_id: Uuid,
        new_ttl: Duration,
    ) -> Result<RenewOutcome, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_leases
            SET expires_at = NOW() + ($1 || ' milliseconds')::INTERVAL
            WHERE key = $2 AND run_id = $3 AND expires_at > NOW()
            "#,
        )
        .bind((new_ttl.as_millis() as i64).to_string())
        .bind(key.as_str())
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            Ok(RenewOutcome::Renewed)
        } else {
            Ok(RenewOutcome::Lost)
        }
    }

    async fn release_lease(&self, key: &LeaseKey, run_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM job_leases WHERE key = $1 AND run_id = $2")
            .bind(key.as_str())
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_run(&self, record: &RunRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO job_runs (
                run_id, job_name, attempt, scheduled_for, enqueued_at, leased_at,
                started_at, finished_at, replica_id, status, input_snapshot,
                error_kind, error_message, error_stack, metrics, log_tail,
                parent_run_id, trigger_cause, dedupe_key
            )
            VALUES (
                $1, $2, $3, $4, $5, $6,
                $7, $8, $9, $10, $11,
                $12, $13, $14, $15, $16,
                $17, $18, $19
            )
            "#,
        )
        .bind(record.run_id)
        .bind(&record.job_name)
        .bind(record.attempt)
        .bind(record.scheduled_for)
        .bind(record.enqueued_at)
        .bind(record.leased_at)
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(&record.replica_id)
        .bind(record.status)
        .bind(&record.input_snapshot)
        .bind(record.error_kind)
        .bind(&record.error_message)
        .bind(&record.error_stack)
        .bind(&record.metrics)
        .bind(&record.log_tail)
        .bind(record.parent_run_id)
        .bind(&record.trigger_cause)
        .bind(&record.dedupe_key)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_run(&self, run_id: Uuid, patch: RunPatch) -> Result<RunRecord, StoreError> {
        let mut txn = self.pool.begin().await?;

        let current = sqlx::query_as::<_, (RunStatus,)>(
            "SELECT status FROM job_runs WHERE run_id = $1 FOR UPDATE",
        )
        .bind(run_id)
        .fetch_optional(&mut *txn)
        .await?
        .ok_or(StoreError::RunNotFound(run_id))?;

        if let Some(next) = patch.status {
            if !current.0.can_transition_to(next) {
                return Err(StoreError::IllegalTransition {
                    run_id,
                    from: current.0,
                    to: next,
                });
            }
        }

        let mut qb = sqlx::QueryBuilder::new("UPDATE job_runs SET ");
        let mut any = false;
        {
            let mut sep = qb.separated(", ");
            if let Some(status) = patch.status {
                sep.push("status = ").push_bind_unseparated(status);
                any = true;
            }
            if let Some(at) = patch.leased_at {
                sep.push("leased_at = ").push_bind_unseparated(at);
                any = true;
            }
            if let Some(at) = patch.started_at {
                sep.push("started_at = ").push_bind_unseparated(at);
                any = true;
            }
            if let Some(at) = patch.finished_at {
                sep.push("finished_at = ").push_bind_unseparated(at);
                any = true;
            }
            if let Some(kind) = patch.error_kind {
                sep.push("error_kind = ").push_bind_unseparated(kind);
                any = true;
            }
            if let Some(message) = patch.error_message {
                sep.push("error_message = ").push_bind_unseparated(message);
                any = true;
            }
            if let Some(stack) = patch.error_stack {
                sep.push("error_stack = ").push_bind_unseparated(stack);
                any = true;
            }
            if let Some(metrics) = patch.metrics {
                sep.push("metrics = ").push_bind_unseparated(metrics);
                any = true;
            }
            if let Some(log_tail) = patch.log_tail {
                sep.push("log_tail = ").push_bind_unseparated(log_tail);
                any = true;
            }
        }

        let record = if any {
            qb.push(" WHERE run_id = ").push_bind(run_id);
            qb.push(format!(" RETURNING {RUN_COLUMNS}"));
            qb.build_query_as::<RunRecord>()
                .fetch_one(&mut *txn)
                .await?
        } else {
            sqlx::query_as::<_, RunRecord>(&format!(
                "SELECT {RUN_COLUMNS} FROM job_runs WHERE run_id = $1"
            ))
            .bind(run_id)
            .fetch_one(&mut *txn)
            .await?
        };

        txn.commit().await?;
        Ok(record)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<RunRecord>, StoreError> {
        let record = sqlx::query_as::<_, RunRecord>(&format!(
            "SELECT {RUN_COLUMNS} FROM job_runs WHERE run_id = $1"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn find_runs(
        &self,
        filter: &RunFilter,
        limit: i64,
    ) -> Result<Vec<RunRecord>, StoreError> {
        let mut qb =
            sqlx::QueryBuilder::new(format!("SELECT {RUN_COLUMNS} FROM job_runs WHERE TRUE"));

        if let Some(job_name) = &filter.job_name {
            qb.push(" AND job_name = ").push_bind(job_name.clone());
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status);
        }
        if let Some(scheduled_for) = filter.scheduled_for {
            qb.push(" AND scheduled_for = ").push_bind(scheduled_for);
        }
        if let Some(parent) = filter.parent_run_id {
            qb.push(" AND parent_run_id = ").push_bind(parent);
        }
        if let Some(since) = filter.since {
            qb.push(" AND enqueued_at >= ").push_bind(since);
        }
        qb.push(" ORDER BY enqueued_at DESC LIMIT ").push_bind(limit);

        let records = qb
            .build_query_as::<RunRecord>()
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    async fn latest_scheduled_for(
        &self,
        job_name: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let latest = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT MAX(scheduled_for) FROM job_runs WHERE job_name = $1",
        )
        .bind(job_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(latest)
    }

    async fn find_active_by_dedupe(
        &self,
        dedupe_key: &str,
    ) -> Result<Option<RunRecord>, StoreError> {
        let record = sqlx::query_as::<_, RunRecord>(&format!(
            r#"
            SELECT {RUN_COLUMNS}
            FROM job_runs
            WHERE dedupe_key = $1
              AND status IN ('queued', 'leased', 'running')
            LIMIT 1
            "#
        ))
        .bind(dedupe_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
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

        let result = sqlx::query(
            r#"
            DELETE FROM job_runs
            WHERE finished_at IS NOT NULL
              AND (
                    (status = 'succeeded' AND finished_at < $1)
                 OR (status IN ('failed', 'timed_out', 'cancelled', 'dead') AND finished_at < $2)
              )
            "#,
        )
        .bind(succeeded_cutoff)
        .bind(failed_cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
