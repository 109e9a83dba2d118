use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use insightforge_core::{BatchId, DeadLetterId, JobId};
use insightforge_events::{BehaviorEvent, NewBehaviorEvent};

use crate::batches::{Batch, BatchStats, BatchStatus, Insight, SealPolicy};
use crate::jobs::{AnalysisJob, DeadLetterJob, JobFailure, Lease};

/// Storage failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    /// A uniqueness rule rejected the write (e.g. a second active job for a batch).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of [`JobStore::complete_job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// Job is SUCCESS and the batch ANALYZED. `insight_stored` is false when an
    /// insight for the batch already existed.
    Completed { insight_stored: bool },
    /// The lease no longer matches the job; nothing was written.
    LeaseLost,
}

/// Counts of jobs by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: u64,
    pub running: u64,
    pub success: u64,
    pub failed: u64,
    /// Age of the oldest PENDING job in seconds
    pub oldest_pending_age_secs: Option<i64>,
}

/// Batches and the events they hold.
#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Append an event to the current OPEN batch, creating one if none exists,
    /// and increment its count.
    async fn append_event(
        &self,
        event: NewBehaviorEvent,
        now: DateTime<Utc>,
    ) -> StoreResult<BehaviorEvent>;

    async fn get_batch(&self, batch_id: &BatchId) -> StoreResult<Option<Batch>>;

    /// OPEN batches that `policy` says should be sealed at `now`.
    async fn list_batches_due(
        &self,
        policy: &SealPolicy,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Batch>>;

    /// OPEN -> SEALED. Returns false if the batch was no longer OPEN.
    async fn seal_batch(&self, batch_id: &BatchId, now: DateTime<Utc>) -> StoreResult<bool>;

    /// Batches in `status`, oldest first.
    async fn list_batches_by_status(
        &self,
        status: BatchStatus,
        limit: usize,
    ) -> StoreResult<Vec<Batch>>;

    /// SEALED batches that have never had a job, oldest first.
    async fn list_batches_without_jobs(&self, limit: usize) -> StoreResult<Vec<Batch>>;

    /// Events of a batch ordered by timestamp, ties broken by arrival.
    async fn load_batch_events(&self, batch_id: &BatchId) -> StoreResult<Vec<BehaviorEvent>>;

    async fn batch_stats(&self, now: DateTime<Utc>) -> StoreResult<BatchStats>;
}

/// Analysis jobs.
///
/// Every state change is conditional on the prior state it expects, so
/// concurrent workers and recovery loops (in-process or not) never both win.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. Fails with [`StoreError::Conflict`] if the batch
    /// already has a PENDING, RUNNING or SUCCESS job.
    async fn insert_job(&self, job: &AnalysisJob) -> StoreResult<()>;

    async fn get_job(&self, job_id: JobId) -> StoreResult<Option<AnalysisJob>>;

    /// The PENDING, RUNNING or SUCCESS job of a batch, if any.
    async fn find_active_job(&self, batch_id: &BatchId) -> StoreResult<Option<AnalysisJob>>;

    /// Most recently created job of a batch, whatever its status.
    async fn find_latest_job(&self, batch_id: &BatchId) -> StoreResult<Option<AnalysisJob>>;

    /// Oldest claimable job (FIFO by creation time).
    async fn next_claimable_job(&self, now: DateTime<Utc>) -> StoreResult<Option<AnalysisJob>>;

    /// PENDING -> RUNNING for one job, only if it is still claimable.
    /// Returns the claimed job, or `None` if another claimant won.
    async fn try_claim(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> StoreResult<Option<AnalysisJob>>;

    /// Claim the oldest claimable job.
    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> StoreResult<Option<AnalysisJob>> {
        // A lost race just means someone else took that job; look once more.
        for _ in 0..3 {
            let Some(candidate) = self.next_claimable_job(now).await? else {
                return Ok(None);
            };
            if let Some(job) = self.try_claim(candidate.id, now, lease_until).await? {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    /// Store the insight, mark the job SUCCESS and the batch ANALYZED, as one
    /// atomic change fenced on `lease`.
    async fn complete_job(
        &self,
        lease: &Lease,
        insight: &Insight,
        analysis_time_ms: u64,
        now: DateTime<Utc>,
    ) -> StoreResult<CompletionOutcome>;

    /// RUNNING -> PENDING with `attempt_count + 1`, not claimable before
    /// `retry_at`. Returns false if the lease was lost.
    async fn requeue_job(
        &self,
        lease: &Lease,
        retry_at: DateTime<Utc>,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Write `entry` to the DLQ and mark the job FAILED. Returns false (and
    /// writes nothing) if the lease was lost.
    async fn dead_letter_job(
        &self,
        lease: &Lease,
        entry: &DeadLetterJob,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// RUNNING jobs last updated before `updated_before`, oldest first.
    async fn list_stuck_jobs(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<AnalysisJob>>;

    /// Stuck RUNNING -> PENDING with `attempt_count + 1`, only if still RUNNING
    /// and still last updated before `updated_before`.
    async fn requeue_stuck_job(
        &self,
        job_id: JobId,
        updated_before: DateTime<Utc>,
        retry_at: DateTime<Utc>,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Dead-letter a stuck job, under the same condition as
    /// [`JobStore::requeue_stuck_job`].
    async fn dead_letter_stuck_job(
        &self,
        entry: &DeadLetterJob,
        updated_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// RUNNING jobs whose lease has passed go back to PENDING with the lock
    /// cleared and `attempt_count + 1`. Jobs already at `max_attempts` stay
    /// RUNNING for the stuck-job sweep to dead-letter.
    async fn release_expired_leases(&self, now: DateTime<Utc>) -> StoreResult<Vec<JobId>>;

    async fn job_stats(&self, now: DateTime<Utc>) -> StoreResult<JobStats>;

    /// `analysis_time_ms` of jobs completed since `since`.
    async fn recent_analysis_times(&self, since: DateTime<Utc>) -> StoreResult<Vec<u64>>;
}

/// The dead-letter queue (read side; writes go through [`JobStore`]).
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn get_dead_letter(&self, id: DeadLetterId) -> StoreResult<Option<DeadLetterJob>>;

    /// Most recent entries first, optionally only those failed at or after `since`.
    async fn list_dead_letters(
        &self,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> StoreResult<Vec<DeadLetterJob>>;

    /// `(total, failed at or after since)`.
    async fn dead_letter_counts(&self, since: DateTime<Utc>) -> StoreResult<(u64, u64)>;
}

#[async_trait]
pub trait InsightStore: Send + Sync {
    async fn get_insight_for_batch(&self, batch_id: &BatchId) -> StoreResult<Option<Insight>>;

    /// Most recent first.
    async fn list_insights(&self, limit: usize) -> StoreResult<Vec<Insight>>;
}

/// Everything the pipeline needs from storage.
pub trait PipelineStore: BatchStore + JobStore + DeadLetterStore + InsightStore {}

impl<T> PipelineStore for T where T: BatchStore + JobStore + DeadLetterStore + InsightStore {}
