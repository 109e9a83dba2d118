//! Postgres-backed pipeline store.
//!
//! ## Concurrency
//!
//! Every state transition is a single conditional `UPDATE` (or a short
//! transaction around one) that names the prior state it expects. Workers in
//! different processes therefore never need a lock manager: the loser of a
//! race simply sees zero affected rows.
//!
//! - Claim: `UPDATE .. WHERE job_id = (SELECT .. FOR UPDATE SKIP LOCKED)`
//! - Lease-fenced writes: `WHERE status = 'RUNNING' AND lock_expires_at = $lease`
//! - Stuck-job writes: `WHERE status = 'RUNNING' AND updated_at < $cutoff`
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (other) | Any other | `Storage` |
//! | ColumnDecode / Decode | N/A | `Serialization` |
//! | PoolClosed, Io, other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use insightforge_core::{BatchId, DeadLetterId, InsightId, JobId};
use insightforge_events::{BehaviorEvent, NewBehaviorEvent};

use super::r#trait::{
    BatchStore, CompletionOutcome, DeadLetterStore, InsightStore, JobStats, JobStore,
    StoreError, StoreResult,
};
use crate::batches::{Batch, BatchStats, BatchStatus, Insight, SealPolicy};
use crate::jobs::{AnalysisJob, DeadLetterJob, JobFailure, Lease};

const JOB_COLUMNS: &str = "job_id, batch_id, status, attempt_count, max_attempts, lock_expires_at, \
     last_error, error_context, analysis_time_ms, created_at, updated_at, trigger_type";

const BATCH_COLUMNS: &str = "batch_id, status, event_count, created_at, sealed_at";

const DEAD_LETTER_COLUMNS: &str =
    "dlq_id, job_id, batch_id, attempt_count, last_error, error_context, reason, failed_at";

const INSIGHT_COLUMNS: &str =
    "insight_id, batch_id, summary, confidence, patterns, event_count, time_window, created_at";

/// Pipeline store on PostgreSQL.
///
/// `Send + Sync`; clones share the same connection pool.
#[derive(Debug, Clone)]
pub struct PostgresPipelineStore {
    pool: Arc<PgPool>,
}

impl PostgresPipelineStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect to `database_url`.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&*self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("migration failed: {e}")))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl BatchStore for PostgresPipelineStore {
    #[instrument(skip(self, event), fields(event_type = %event.event_type), err)]
    async fn append_event(
        &self,
        event: NewBehaviorEvent,
        now: DateTime<Utc>,
    ) -> StoreResult<BehaviorEvent> {
        event
            .validate()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let select_open = "SELECT batch_id FROM batches WHERE status = 'OPEN' \
             ORDER BY created_at DESC LIMIT 1 FOR UPDATE";

        let mut open: Option<String> = sqlx::query_scalar(select_open)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("select_open_batch", e))?;

        if open.is_none() {
            let batch = Batch::open(now);
            let inserted = sqlx::query(
                r#"
                INSERT INTO batches (batch_id, status, event_count, created_at)
                VALUES ($1, 'OPEN', 0, $2)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(batch.id.as_str())
            .bind(batch.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_batch", e))?;

            open = if inserted.rows_affected() == 1 {
                debug!(batch_id = %batch.id, "opened batch");
                Some(batch.id.into())
            } else {
                // A concurrent appender opened one first.
                sqlx::query_scalar(select_open)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("select_open_batch", e))?
            };
        }

        let open =
            open.ok_or_else(|| StoreError::Storage("no open batch after insert".to_string()))?;
        let batch_id = parse_batch_id(&open)?;

        let stored = BehaviorEvent::from_new(batch_id, event, now);

        sqlx::query(
            r#"
            INSERT INTO behavior_events (
                event_id, batch_id, event_type, user_id, occurred_at, metadata, received_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(stored.event_id)
        .bind(stored.batch_id.as_str())
        .bind(&stored.event_type)
        .bind(&stored.user_id)
        .bind(stored.timestamp)
        .bind(&stored.metadata)
        .bind(stored.received_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_event", e))?;

        sqlx::query("UPDATE batches SET event_count = event_count + 1 WHERE batch_id = $1")
            .bind(stored.batch_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("increment_event_count", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(stored)
    }

    #[instrument(skip(self), fields(batch_id = %batch_id), err)]
    async fn get_batch(&self, batch_id: &BatchId) -> StoreResult<Option<Batch>> {
        let sql = format!("SELECT {BATCH_COLUMNS} FROM batches WHERE batch_id = $1");
        sqlx::query_as::<_, BatchRow>(&sql)
            .bind(batch_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_batch", e))?
            .map(Batch::try_from)
            .transpose()
    }

    #[instrument(skip(self, policy), err)]
    async fn list_batches_due(
        &self,
        policy: &SealPolicy,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Batch>> {
        let sql = format!(
            "SELECT {BATCH_COLUMNS} FROM batches \
             WHERE status = 'OPEN' AND (event_count >= $1 OR created_at < $2) \
             ORDER BY created_at ASC"
        );
        let rows = sqlx::query_as::<_, BatchRow>(&sql)
            .bind(i64::try_from(policy.size_threshold).unwrap_or(i64::MAX))
            .bind(policy.age_cutoff(now))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_batches_due", e))?;
        rows.into_iter().map(Batch::try_from).collect()
    }

    #[instrument(skip(self), fields(batch_id = %batch_id), err)]
    async fn seal_batch(&self, batch_id: &BatchId, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE batches SET status = 'SEALED', sealed_at = $2 \
             WHERE batch_id = $1 AND status = 'OPEN'",
        )
        .bind(batch_id.as_str())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("seal_batch", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn list_batches_by_status(
        &self,
        status: BatchStatus,
        limit: usize,
    ) -> StoreResult<Vec<Batch>> {
        let sql = format!(
            "SELECT {BATCH_COLUMNS} FROM batches WHERE status = $1 \
             ORDER BY created_at ASC, batch_id ASC LIMIT $2"
        );
        let rows = sqlx::query_as::<_, BatchRow>(&sql)
            .bind(status.as_str())
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_batches_by_status", e))?;
        rows.into_iter().map(Batch::try_from).collect()
    }

    #[instrument(skip(self), err)]
    async fn list_batches_without_jobs(&self, limit: usize) -> StoreResult<Vec<Batch>> {
        let sql = format!(
            "SELECT {BATCH_COLUMNS} FROM batches b WHERE b.status = 'SEALED' \
             AND NOT EXISTS (SELECT 1 FROM analysis_jobs j WHERE j.batch_id = b.batch_id) \
             ORDER BY b.created_at ASC, b.batch_id ASC LIMIT $1"
        );
        let rows = sqlx::query_as::<_, BatchRow>(&sql)
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_batches_without_jobs", e))?;
        rows.into_iter().map(Batch::try_from).collect()
    }

    #[instrument(skip(self), fields(batch_id = %batch_id), err)]
    async fn load_batch_events(&self, batch_id: &BatchId) -> StoreResult<Vec<BehaviorEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT event_id, batch_id, event_type, user_id, occurred_at, metadata, received_at
            FROM behavior_events
            WHERE batch_id = $1
            ORDER BY occurred_at ASC, received_at ASC, event_id ASC
            "#,
        )
        .bind(batch_id.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_batch_events", e))?;

        rows.into_iter()
            .map(|row| {
                Ok(BehaviorEvent {
                    event_id: row.event_id,
                    batch_id: parse_batch_id(&row.batch_id)?,
                    event_type: row.event_type,
                    user_id: row.user_id,
                    timestamp: row.occurred_at,
                    metadata: row.metadata,
                    received_at: row.received_at,
                })
            })
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn batch_stats(&self, now: DateTime<Utc>) -> StoreResult<BatchStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'OPEN') AS open,
                COUNT(*) FILTER (WHERE status = 'SEALED') AS sealed,
                COUNT(*) FILTER (WHERE status = 'ANALYZED') AS analyzed,
                COUNT(*) FILTER (WHERE status = 'ARCHIVED') AS archived,
                MIN(created_at) FILTER (WHERE status = 'OPEN') AS oldest_open
            FROM batches
            "#,
        )
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("batch_stats", e))?;

        let oldest: Option<DateTime<Utc>> = get(&row, "oldest_open")?;
        Ok(BatchStats {
            open: get::<i64>(&row, "open")? as u64,
            sealed: get::<i64>(&row, "sealed")? as u64,
            analyzed: get::<i64>(&row, "analyzed")? as u64,
            archived: get::<i64>(&row, "archived")? as u64,
            oldest_open_age_secs: oldest.map(|t| (now - t).num_seconds().max(0)),
        })
    }
}

#[async_trait]
impl JobStore for PostgresPipelineStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, batch_id = %job.batch_id), err)]
    async fn insert_job(&self, job: &AnalysisJob) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO analysis_jobs (
                job_id, batch_id, status, attempt_count, max_attempts, lock_expires_at,
                last_error, error_context, analysis_time_ms, created_at, updated_at, trigger_type
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.batch_id.as_str())
        .bind(job.status.as_str())
        .bind(job.attempt_count as i32)
        .bind(job.max_attempts as i32)
        .bind(job.lock_expires_at)
        .bind(&job.last_error)
        .bind(&job.error_context)
        .bind(job.analysis_time_ms.map(|ms| ms as i64))
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.trigger_type.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Conflict(format!("batch {} already has an active job", job.batch_id))
            } else {
                map_sqlx_error("insert_job", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get_job(&self, job_id: JobId) -> StoreResult<Option<AnalysisJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE job_id = $1");
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?
            .map(AnalysisJob::try_from)
            .transpose()
    }

    #[instrument(skip(self), fields(batch_id = %batch_id), err)]
    async fn find_active_job(&self, batch_id: &BatchId) -> StoreResult<Option<AnalysisJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM analysis_jobs \
             WHERE batch_id = $1 AND status IN ('PENDING', 'RUNNING', 'SUCCESS') LIMIT 1"
        );
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(batch_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_active_job", e))?
            .map(AnalysisJob::try_from)
            .transpose()
    }

    #[instrument(skip(self), fields(batch_id = %batch_id), err)]
    async fn find_latest_job(&self, batch_id: &BatchId) -> StoreResult<Option<AnalysisJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE batch_id = $1 \
             ORDER BY created_at DESC, job_id DESC LIMIT 1"
        );
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(batch_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_latest_job", e))?
            .map(AnalysisJob::try_from)
            .transpose()
    }

    #[instrument(skip(self), err)]
    async fn next_claimable_job(&self, now: DateTime<Utc>) -> StoreResult<Option<AnalysisJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM analysis_jobs \
             WHERE status = 'PENDING' AND (lock_expires_at IS NULL OR lock_expires_at <= $1) \
             ORDER BY created_at ASC, job_id ASC LIMIT 1"
        );
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("next_claimable_job", e))?
            .map(AnalysisJob::try_from)
            .transpose()
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn try_claim(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> StoreResult<Option<AnalysisJob>> {
        let sql = format!(
            "UPDATE analysis_jobs SET status = 'RUNNING', lock_expires_at = $2, updated_at = $1 \
             WHERE job_id = $3 AND status = 'PENDING' \
               AND (lock_expires_at IS NULL OR lock_expires_at <= $1) \
             RETURNING {JOB_COLUMNS}"
        );
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(now)
            .bind(lease_until)
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("try_claim", e))?
            .map(AnalysisJob::try_from)
            .transpose()
    }

    #[instrument(skip(self), err)]
    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> StoreResult<Option<AnalysisJob>> {
        let sql = format!(
            "UPDATE analysis_jobs SET status = 'RUNNING', lock_expires_at = $2, updated_at = $1 \
             WHERE job_id = ( \
                 SELECT job_id FROM analysis_jobs \
                 WHERE status = 'PENDING' \
                   AND (lock_expires_at IS NULL OR lock_expires_at <= $1) \
                 ORDER BY created_at ASC, job_id ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) AND status = 'PENDING' \
             RETURNING {JOB_COLUMNS}"
        );
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(now)
            .bind(lease_until)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?
            .map(AnalysisJob::try_from)
            .transpose()
    }

    #[instrument(skip(self, lease, insight), fields(job_id = %lease.job_id, batch_id = %insight.batch_id), err)]
    async fn complete_job(
        &self,
        lease: &Lease,
        insight: &Insight,
        analysis_time_ms: u64,
        now: DateTime<Utc>,
    ) -> StoreResult<CompletionOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let batch_id: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE analysis_jobs
            SET status = 'SUCCESS', lock_expires_at = NULL, analysis_time_ms = $3, updated_at = $4
            WHERE job_id = $1 AND status = 'RUNNING' AND lock_expires_at = $2
            RETURNING batch_id
            "#,
        )
        .bind(lease.job_id.as_uuid())
        .bind(lease.expires_at)
        .bind(analysis_time_ms as i64)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("complete_job", e))?;

        let Some(batch_id) = batch_id else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(CompletionOutcome::LeaseLost);
        };

        let inserted = sqlx::query(
            r#"
            INSERT INTO insights (
                insight_id, batch_id, summary, confidence, patterns, event_count, time_window, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (batch_id) DO NOTHING
            "#,
        )
        .bind(insight.id.as_uuid())
        .bind(&batch_id)
        .bind(&insight.summary)
        .bind(insight.confidence)
        .bind(Json(&insight.patterns))
        .bind(insight.event_count as i64)
        .bind(&insight.time_window)
        .bind(insight.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_insight", e))?;

        sqlx::query("UPDATE batches SET status = 'ANALYZED' WHERE batch_id = $1 AND status = 'SEALED'")
            .bind(&batch_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("mark_batch_analyzed", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(CompletionOutcome::Completed {
            insight_stored: inserted.rows_affected() == 1,
        })
    }

    #[instrument(skip(self, lease, failure), fields(job_id = %lease.job_id, error_code = %failure.code), err)]
    async fn requeue_job(
        &self,
        lease: &Lease,
        retry_at: DateTime<Utc>,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET status = 'PENDING', attempt_count = attempt_count + 1, lock_expires_at = $3,
                last_error = $4, error_context = $5, updated_at = $6
            WHERE job_id = $1 AND status = 'RUNNING' AND lock_expires_at = $2
            "#,
        )
        .bind(lease.job_id.as_uuid())
        .bind(lease.expires_at)
        .bind(retry_at)
        .bind(failure.last_error())
        .bind(&failure.context)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_job", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, lease, entry), fields(job_id = %lease.job_id, reason = %entry.reason), err)]
    async fn dead_letter_job(
        &self,
        lease: &Lease,
        entry: &DeadLetterJob,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let result = sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET status = 'FAILED', lock_expires_at = NULL, last_error = $3, error_context = $4,
                updated_at = $5
            WHERE job_id = $1 AND status = 'RUNNING' AND lock_expires_at = $2
            "#,
        )
        .bind(lease.job_id.as_uuid())
        .bind(lease.expires_at)
        .bind(&entry.last_error)
        .bind(&entry.error_context)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("fail_job", e))?;

        if result.rows_affected() != 1 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(false);
        }

        insert_dead_letter(&mut tx, entry).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(true)
    }

    #[instrument(skip(self), err)]
    async fn list_stuck_jobs(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<AnalysisJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM analysis_jobs \
             WHERE status = 'RUNNING' AND updated_at < $1 \
             ORDER BY updated_at ASC LIMIT $2"
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(updated_before)
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_stuck_jobs", e))?;
        rows.into_iter().map(AnalysisJob::try_from).collect()
    }

    #[instrument(skip(self, failure), fields(job_id = %job_id), err)]
    async fn requeue_stuck_job(
        &self,
        job_id: JobId,
        updated_before: DateTime<Utc>,
        retry_at: DateTime<Utc>,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET status = 'PENDING', attempt_count = attempt_count + 1, lock_expires_at = $3,
                last_error = $4, error_context = $5, updated_at = $6
            WHERE job_id = $1 AND status = 'RUNNING' AND updated_at < $2
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(updated_before)
        .bind(retry_at)
        .bind(failure.last_error())
        .bind(&failure.context)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_stuck_job", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, entry), fields(job_id = %entry.job_id), err)]
    async fn dead_letter_stuck_job(
        &self,
        entry: &DeadLetterJob,
        updated_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let result = sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET status = 'FAILED', lock_expires_at = NULL, last_error = $3, error_context = $4,
                updated_at = $5
            WHERE job_id = $1 AND status = 'RUNNING' AND updated_at < $2
            "#,
        )
        .bind(entry.job_id.as_uuid())
        .bind(updated_before)
        .bind(&entry.last_error)
        .bind(&entry.error_context)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("fail_stuck_job", e))?;

        if result.rows_affected() != 1 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(false);
        }

        insert_dead_letter(&mut tx, entry).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(true)
    }

    #[instrument(skip(self), err)]
    async fn release_expired_leases(&self, now: DateTime<Utc>) -> StoreResult<Vec<JobId>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE analysis_jobs
            SET status = 'PENDING',
                attempt_count = attempt_count + 1,
                lock_expires_at = NULL,
                updated_at = $1
            WHERE status = 'RUNNING'
              AND lock_expires_at < $1
              AND attempt_count < max_attempts
            RETURNING job_id
            "#,
        )
        .bind(now)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release_expired_leases", e))?;

        let mut ids: Vec<JobId> = ids.into_iter().map(JobId::from_uuid).collect();
        ids.sort();
        Ok(ids)
    }

    #[instrument(skip(self), err)]
    async fn job_stats(&self, now: DateTime<Utc>) -> StoreResult<JobStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'PENDING') AS pending,
                COUNT(*) FILTER (WHERE status = 'RUNNING') AS running,
                COUNT(*) FILTER (WHERE status = 'SUCCESS') AS success,
                COUNT(*) FILTER (WHERE status = 'FAILED') AS failed,
                MIN(created_at) FILTER (WHERE status = 'PENDING') AS oldest_pending
            FROM analysis_jobs
            "#,
        )
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("job_stats", e))?;

        let oldest: Option<DateTime<Utc>> = get(&row, "oldest_pending")?;
        Ok(JobStats {
            pending: get::<i64>(&row, "pending")? as u64,
            running: get::<i64>(&row, "running")? as u64,
            success: get::<i64>(&row, "success")? as u64,
            failed: get::<i64>(&row, "failed")? as u64,
            oldest_pending_age_secs: oldest.map(|t| (now - t).num_seconds().max(0)),
        })
    }

    #[instrument(skip(self), err)]
    async fn recent_analysis_times(&self, since: DateTime<Utc>) -> StoreResult<Vec<u64>> {
        let times: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT analysis_time_ms FROM analysis_jobs
            WHERE status = 'SUCCESS' AND updated_at >= $1 AND analysis_time_ms IS NOT NULL
            "#,
        )
        .bind(since)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("recent_analysis_times", e))?;

        Ok(times.into_iter().map(|ms| ms.max(0) as u64).collect())
    }
}

#[async_trait]
impl DeadLetterStore for PostgresPipelineStore {
    #[instrument(skip(self), fields(dlq_id = %id), err)]
    async fn get_dead_letter(&self, id: DeadLetterId) -> StoreResult<Option<DeadLetterJob>> {
        let sql = format!("SELECT {DEAD_LETTER_COLUMNS} FROM dead_letter_jobs WHERE dlq_id = $1");
        sqlx::query_as::<_, DeadLetterRow>(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_dead_letter", e))?
            .map(DeadLetterJob::try_from)
            .transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_dead_letters(
        &self,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> StoreResult<Vec<DeadLetterJob>> {
        let sql = format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letter_jobs \
             WHERE ($1::timestamptz IS NULL OR failed_at >= $1) \
             ORDER BY failed_at DESC, dlq_id DESC LIMIT $2"
        );
        let rows = sqlx::query_as::<_, DeadLetterRow>(&sql)
            .bind(since)
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_dead_letters", e))?;
        rows.into_iter().map(DeadLetterJob::try_from).collect()
    }

    #[instrument(skip(self), err)]
    async fn dead_letter_counts(&self, since: DateTime<Utc>) -> StoreResult<(u64, u64)> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total, COUNT(*) FILTER (WHERE failed_at >= $1) AS recent
            FROM dead_letter_jobs
            "#,
        )
        .bind(since)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("dead_letter_counts", e))?;

        Ok((
            get::<i64>(&row, "total")? as u64,
            get::<i64>(&row, "recent")? as u64,
        ))
    }
}

#[async_trait]
impl InsightStore for PostgresPipelineStore {
    #[instrument(skip(self), fields(batch_id = %batch_id), err)]
    async fn get_insight_for_batch(&self, batch_id: &BatchId) -> StoreResult<Option<Insight>> {
        let sql = format!("SELECT {INSIGHT_COLUMNS} FROM insights WHERE batch_id = $1");
        sqlx::query_as::<_, InsightRow>(&sql)
            .bind(batch_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_insight_for_batch", e))?
            .map(Insight::try_from)
            .transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_insights(&self, limit: usize) -> StoreResult<Vec<Insight>> {
        let sql = format!(
            "SELECT {INSIGHT_COLUMNS} FROM insights ORDER BY created_at DESC LIMIT $1"
        );
        let rows = sqlx::query_as::<_, InsightRow>(&sql)
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_insights", e))?;
        rows.into_iter().map(Insight::try_from).collect()
    }
}

async fn insert_dead_letter(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    entry: &DeadLetterJob,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO dead_letter_jobs (
            dlq_id, job_id, batch_id, attempt_count, last_error, error_context, reason, failed_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(entry.id.as_uuid())
    .bind(entry.job_id.as_uuid())
    .bind(entry.batch_id.as_str())
    .bind(entry.attempt_count as i32)
    .bind(&entry.last_error)
    .bind(&entry.error_context)
    .bind(&entry.reason)
    .bind(entry.failed_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_dead_letter", e))?;
    Ok(())
}

/// Map SQLx errors to `StoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code() {
                Some(code) if code.as_ref() == "23505" => StoreError::Conflict(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Serialization(format!("decode error in {}: {}", operation, err))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> StoreResult<T>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| StoreError::Serialization(format!("column {column}: {e}")))
}

fn parse_batch_id(raw: &str) -> StoreResult<BatchId> {
    raw.parse()
        .map_err(|e: insightforge_core::DomainError| StoreError::Serialization(e.to_string()))
}

fn parse_status<T>(raw: &str) -> StoreResult<T>
where
    T: std::str::FromStr<Err = insightforge_core::DomainError>,
{
    raw.parse()
        .map_err(|e: insightforge_core::DomainError| StoreError::Serialization(e.to_string()))
}

// SQLx row types

#[derive(Debug)]
struct BatchRow {
    batch_id: String,
    status: String,
    event_count: i64,
    created_at: DateTime<Utc>,
    sealed_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for BatchRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(BatchRow {
            batch_id: row.try_get("batch_id")?,
            status: row.try_get("status")?,
            event_count: row.try_get("event_count")?,
            created_at: row.try_get("created_at")?,
            sealed_at: row.try_get("sealed_at")?,
        })
    }
}

impl TryFrom<BatchRow> for Batch {
    type Error = StoreError;

    fn try_from(row: BatchRow) -> Result<Self, Self::Error> {
        Ok(Batch {
            id: parse_batch_id(&row.batch_id)?,
            status: parse_status(&row.status)?,
            event_count: row.event_count.max(0) as u64,
            created_at: row.created_at,
            sealed_at: row.sealed_at,
        })
    }
}

#[derive(Debug)]
struct EventRow {
    event_id: Uuid,
    batch_id: String,
    event_type: String,
    user_id: String,
    occurred_at: DateTime<Utc>,
    metadata: JsonValue,
    received_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for EventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(EventRow {
            event_id: row.try_get("event_id")?,
            batch_id: row.try_get("batch_id")?,
            event_type: row.try_get("event_type")?,
            user_id: row.try_get("user_id")?,
            occurred_at: row.try_get("occurred_at")?,
            metadata: row.try_get("metadata")?,
            received_at: row.try_get("received_at")?,
        })
    }
}

#[derive(Debug)]
struct JobRow {
    job_id: Uuid,
    batch_id: String,
    status: String,
    attempt_count: i32,
    max_attempts: i32,
    lock_expires_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    error_context: Option<JsonValue>,
    analysis_time_ms: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    trigger_type: String,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            job_id: row.try_get("job_id")?,
            batch_id: row.try_get("batch_id")?,
            status: row.try_get("status")?,
            attempt_count: row.try_get("attempt_count")?,
            max_attempts: row.try_get("max_attempts")?,
            lock_expires_at: row.try_get("lock_expires_at")?,
            last_error: row.try_get("last_error")?,
            error_context: row.try_get("error_context")?,
            analysis_time_ms: row.try_get("analysis_time_ms")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            trigger_type: row.try_get("trigger_type")?,
        })
    }
}

impl TryFrom<JobRow> for AnalysisJob {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(AnalysisJob {
            id: JobId::from_uuid(row.job_id),
            batch_id: parse_batch_id(&row.batch_id)?,
            status: parse_status(&row.status)?,
            attempt_count: row.attempt_count.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            lock_expires_at: row.lock_expires_at,
            last_error: row.last_error,
            error_context: row.error_context,
            analysis_time_ms: row.analysis_time_ms.map(|ms| ms.max(0) as u64),
            created_at: row.created_at,
            updated_at: row.updated_at,
            trigger_type: parse_status(&row.trigger_type)?,
        })
    }
}

#[derive(Debug)]
struct DeadLetterRow {
    dlq_id: Uuid,
    job_id: Uuid,
    batch_id: String,
    attempt_count: i32,
    last_error: Option<String>,
    error_context: Option<JsonValue>,
    reason: String,
    failed_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for DeadLetterRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(DeadLetterRow {
            dlq_id: row.try_get("dlq_id")?,
            job_id: row.try_get("job_id")?,
            batch_id: row.try_get("batch_id")?,
            attempt_count: row.try_get("attempt_count")?,
            last_error: row.try_get("last_error")?,
            error_context: row.try_get("error_context")?,
            reason: row.try_get("reason")?,
            failed_at: row.try_get("failed_at")?,
        })
    }
}

impl TryFrom<DeadLetterRow> for DeadLetterJob {
    type Error = StoreError;

    fn try_from(row: DeadLetterRow) -> Result<Self, Self::Error> {
        Ok(DeadLetterJob {
            id: DeadLetterId::from_uuid(row.dlq_id),
            job_id: JobId::from_uuid(row.job_id),
            batch_id: parse_batch_id(&row.batch_id)?,
            attempt_count: row.attempt_count.max(0) as u32,
            last_error: row.last_error,
            error_context: row.error_context,
            reason: row.reason,
            failed_at: row.failed_at,
        })
    }
}

#[derive(Debug)]
struct InsightRow {
    insight_id: Uuid,
    batch_id: String,
    summary: String,
    confidence: f64,
    patterns: JsonValue,
    event_count: i64,
    time_window: String,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for InsightRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(InsightRow {
            insight_id: row.try_get("insight_id")?,
            batch_id: row.try_get("batch_id")?,
            summary: row.try_get("summary")?,
            confidence: row.try_get("confidence")?,
            patterns: row.try_get("patterns")?,
            event_count: row.try_get("event_count")?,
            time_window: row.try_get("time_window")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<InsightRow> for Insight {
    type Error = StoreError;

    fn try_from(row: InsightRow) -> Result<Self, Self::Error> {
        let patterns: Vec<String> = serde_json::from_value(row.patterns)
            .map_err(|e| StoreError::Serialization(format!("insight patterns: {e}")))?;
        Ok(Insight {
            id: InsightId::from_uuid(row.insight_id),
            batch_id: parse_batch_id(&row.batch_id)?,
            summary: row.summary,
            confidence: row.confidence,
            patterns,
            event_count: row.event_count.max(0) as u64,
            time_window: row.time_window,
            created_at: row.created_at,
        })
    }
}
