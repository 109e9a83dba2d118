use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use insightforge_core::{BatchId, DeadLetterId, JobId};
use insightforge_events::{order_for_analysis, BehaviorEvent, NewBehaviorEvent};

use super::r#trait::{
    BatchStore, CompletionOutcome, DeadLetterStore, InsightStore, JobStats, JobStore,
    StoreError, StoreResult,
};
use crate::batches::{Batch, BatchStats, BatchStatus, Insight, SealPolicy};
use crate::jobs::{AnalysisJob, DeadLetterJob, JobFailure, JobStatus, Lease};

#[derive(Debug, Default)]
struct State {
    batches: HashMap<BatchId, Batch>,
    events: HashMap<BatchId, Vec<BehaviorEvent>>,
    jobs: HashMap<JobId, AnalysisJob>,
    dead_letters: Vec<DeadLetterJob>,
    insights: HashMap<BatchId, Insight>,
}

impl State {
    fn held_job(&mut self, lease: &Lease) -> Option<&mut AnalysisJob> {
        self.jobs
            .get_mut(&lease.job_id)
            .filter(|job| job.lease().as_ref() == Some(lease))
    }

    fn stuck_job(&mut self, job_id: JobId, updated_before: DateTime<Utc>) -> Option<&mut AnalysisJob> {
        self.jobs
            .get_mut(&job_id)
            .filter(|job| job.status == JobStatus::Running && job.updated_at < updated_before)
    }
}

fn requeue(job: &mut AnalysisJob, retry_at: DateTime<Utc>, failure: &JobFailure, now: DateTime<Utc>) {
    job.status = JobStatus::Pending;
    job.attempt_count += 1;
    job.lock_expires_at = Some(retry_at);
    job.last_error = Some(failure.last_error());
    job.error_context = Some(failure.context.clone());
    job.updated_at = now;
}

fn fail(job: &mut AnalysisJob, entry: &DeadLetterJob, now: DateTime<Utc>) {
    job.status = JobStatus::Failed;
    job.lock_expires_at = None;
    job.last_error = entry.last_error.clone();
    job.error_context = entry.error_context.clone();
    job.updated_at = now;
}

/// In-memory pipeline store.
///
/// Intended for tests/dev. A single lock guards all tables, so every
/// operation is trivially atomic.
#[derive(Debug, Default)]
pub struct InMemoryPipelineStore {
    state: RwLock<State>,
}

impl InMemoryPipelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }

    /// Insert a batch as-is. Test helper for arranging arbitrary states.
    pub fn insert_batch(&self, batch: Batch) -> StoreResult<()> {
        let mut state = self.write()?;
        state.events.entry(batch.id.clone()).or_default();
        state.batches.insert(batch.id.clone(), batch);
        Ok(())
    }

    /// Overwrite a job as-is. Test helper for arranging arbitrary states.
    pub fn put_job(&self, job: AnalysisJob) -> StoreResult<()> {
        self.write()?.jobs.insert(job.id, job);
        Ok(())
    }
}

#[async_trait]
impl BatchStore for InMemoryPipelineStore {
    async fn append_event(
        &self,
        event: NewBehaviorEvent,
        now: DateTime<Utc>,
    ) -> StoreResult<BehaviorEvent> {
        event
            .validate()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut state = self.write()?;

        let open = state
            .batches
            .values()
            .filter(|b| b.status == BatchStatus::Open)
            .max_by_key(|b| b.created_at)
            .map(|b| b.id.clone());

        let batch_id = match open {
            Some(id) => id,
            None => {
                let batch = Batch::open(now);
                let id = batch.id.clone();
                state.batches.insert(id.clone(), batch);
                id
            }
        };

        let stored = BehaviorEvent::from_new(batch_id.clone(), event, now);
        state
            .events
            .entry(batch_id.clone())
            .or_default()
            .push(stored.clone());
        if let Some(batch) = state.batches.get_mut(&batch_id) {
            batch.event_count += 1;
        }

        Ok(stored)
    }

    async fn get_batch(&self, batch_id: &BatchId) -> StoreResult<Option<Batch>> {
        Ok(self.read()?.batches.get(batch_id).cloned())
    }

    async fn list_batches_due(
        &self,
        policy: &SealPolicy,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Batch>> {
        let state = self.read()?;
        let mut due: Vec<Batch> = state
            .batches
            .values()
            .filter(|b| policy.is_due(b, now))
            .cloned()
            .collect();
        due.sort_by_key(|b| b.created_at);
        Ok(due)
    }

    async fn seal_batch(&self, batch_id: &BatchId, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut state = self.write()?;
        match state.batches.get_mut(batch_id) {
            Some(batch) if batch.status == BatchStatus::Open => {
                batch.status = BatchStatus::Sealed;
                batch.sealed_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_batches_by_status(
        &self,
        status: BatchStatus,
        limit: usize,
    ) -> StoreResult<Vec<Batch>> {
        let state = self.read()?;
        let mut batches: Vec<Batch> = state
            .batches
            .values()
            .filter(|b| b.status == status)
            .cloned()
            .collect();
        batches.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        batches.truncate(limit);
        Ok(batches)
    }

    async fn list_batches_without_jobs(&self, limit: usize) -> StoreResult<Vec<Batch>> {
        let state = self.read()?;
        let mut batches: Vec<Batch> = state
            .batches
            .values()
            .filter(|b| b.status == BatchStatus::Sealed)
            .filter(|b| !state.jobs.values().any(|j| j.batch_id == b.id))
            .cloned()
            .collect();
        batches.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        batches.truncate(limit);
        Ok(batches)
    }

    async fn load_batch_events(&self, batch_id: &BatchId) -> StoreResult<Vec<BehaviorEvent>> {
        let mut events = self
            .read()?
            .events
            .get(batch_id)
            .cloned()
            .unwrap_or_default();
        order_for_analysis(&mut events);
        Ok(events)
    }

    async fn batch_stats(&self, now: DateTime<Utc>) -> StoreResult<BatchStats> {
        let state = self.read()?;
        let mut stats = BatchStats::default();
        let mut oldest_open: Option<DateTime<Utc>> = None;

        for batch in state.batches.values() {
            match batch.status {
                BatchStatus::Open => {
                    stats.open += 1;
                    oldest_open = Some(oldest_open.map_or(batch.created_at, |t| t.min(batch.created_at)));
                }
                BatchStatus::Sealed => stats.sealed += 1,
                BatchStatus::Analyzed => stats.analyzed += 1,
                BatchStatus::Archived => stats.archived += 1,
            }
        }
        stats.oldest_open_age_secs = oldest_open.map(|t| (now - t).num_seconds().max(0));

        Ok(stats)
    }
}

#[async_trait]
impl JobStore for InMemoryPipelineStore {
    async fn insert_job(&self, job: &AnalysisJob) -> StoreResult<()> {
        let mut state = self.write()?;

        if state.jobs.contains_key(&job.id) {
            return Err(StoreError::Conflict(format!("job {} already exists", job.id)));
        }
        if job.status.is_active()
            && state
                .jobs
                .values()
                .any(|j| j.batch_id == job.batch_id && j.status.is_active())
        {
            return Err(StoreError::Conflict(format!(
                "batch {} already has an active job",
                job.batch_id
            )));
        }

        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: JobId) -> StoreResult<Option<AnalysisJob>> {
        Ok(self.read()?.jobs.get(&job_id).cloned())
    }

    async fn find_active_job(&self, batch_id: &BatchId) -> StoreResult<Option<AnalysisJob>> {
        Ok(self
            .read()?
            .jobs
            .values()
            .find(|j| &j.batch_id == batch_id && j.status.is_active())
            .cloned())
    }

    async fn find_latest_job(&self, batch_id: &BatchId) -> StoreResult<Option<AnalysisJob>> {
        Ok(self
            .read()?
            .jobs
            .values()
            .filter(|j| &j.batch_id == batch_id)
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
            .cloned())
    }

    async fn next_claimable_job(&self, now: DateTime<Utc>) -> StoreResult<Option<AnalysisJob>> {
        Ok(self
            .read()?
            .jobs
            .values()
            .filter(|j| j.is_claimable(now))
            .min_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
            .cloned())
    }

    async fn try_claim(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> StoreResult<Option<AnalysisJob>> {
        let mut state = self.write()?;
        match state.jobs.get_mut(&job_id) {
            Some(job) if job.is_claimable(now) => {
                job.status = JobStatus::Running;
                job.lock_expires_at = Some(lease_until);
                job.updated_at = now;
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> StoreResult<Option<AnalysisJob>> {
        let mut state = self.write()?;
        let next = state
            .jobs
            .values_mut()
            .filter(|j| j.is_claimable(now))
            .min_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        Ok(next.map(|job| {
            job.status = JobStatus::Running;
            job.lock_expires_at = Some(lease_until);
            job.updated_at = now;
            job.clone()
        }))
    }

    async fn complete_job(
        &self,
        lease: &Lease,
        insight: &Insight,
        analysis_time_ms: u64,
        now: DateTime<Utc>,
    ) -> StoreResult<CompletionOutcome> {
        let mut state = self.write()?;

        let Some(job) = state.held_job(lease) else {
            return Ok(CompletionOutcome::LeaseLost);
        };
        job.status = JobStatus::Success;
        job.lock_expires_at = None;
        job.analysis_time_ms = Some(analysis_time_ms);
        job.updated_at = now;
        let batch_id = job.batch_id.clone();

        let insight_stored = !state.insights.contains_key(&batch_id);
        if insight_stored {
            state.insights.insert(batch_id.clone(), insight.clone());
        }

        if let Some(batch) = state.batches.get_mut(&batch_id) {
            if batch.status == BatchStatus::Sealed {
                batch.status = BatchStatus::Analyzed;
            }
        }

        Ok(CompletionOutcome::Completed { insight_stored })
    }

    async fn requeue_job(
        &self,
        lease: &Lease,
        retry_at: DateTime<Utc>,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut state = self.write()?;
        match state.held_job(lease) {
            Some(job) => {
                requeue(job, retry_at, failure, now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn dead_letter_job(
        &self,
        lease: &Lease,
        entry: &DeadLetterJob,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut state = self.write()?;
        match state.held_job(lease) {
            Some(job) => {
                fail(job, entry, now);
                state.dead_letters.push(entry.clone());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_stuck_jobs(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<AnalysisJob>> {
        let state = self.read()?;
        let mut stuck: Vec<AnalysisJob> = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Running && j.updated_at < updated_before)
            .cloned()
            .collect();
        stuck.sort_by_key(|j| j.updated_at);
        stuck.truncate(limit);
        Ok(stuck)
    }

    async fn requeue_stuck_job(
        &self,
        job_id: JobId,
        updated_before: DateTime<Utc>,
        retry_at: DateTime<Utc>,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut state = self.write()?;
        match state.stuck_job(job_id, updated_before) {
            Some(job) => {
                requeue(job, retry_at, failure, now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn dead_letter_stuck_job(
        &self,
        entry: &DeadLetterJob,
        updated_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut state = self.write()?;
        match state.stuck_job(entry.job_id, updated_before) {
            Some(job) => {
                fail(job, entry, now);
                state.dead_letters.push(entry.clone());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn release_expired_leases(&self, now: DateTime<Utc>) -> StoreResult<Vec<JobId>> {
        let mut state = self.write()?;
        let mut released = Vec::new();

        for job in state.jobs.values_mut() {
            let expired = job.status == JobStatus::Running
                && job.can_retry()
                && job.lock_expires_at.map_or(false, |at| at < now);
            if expired {
                job.status = JobStatus::Pending;
                job.attempt_count += 1;
                job.lock_expires_at = None;
                job.updated_at = now;
                released.push(job.id);
            }
        }

        released.sort();
        Ok(released)
    }

    async fn job_stats(&self, now: DateTime<Utc>) -> StoreResult<JobStats> {
        let state = self.read()?;
        let mut stats = JobStats::default();
        let mut oldest_pending: Option<DateTime<Utc>> = None;

        for job in state.jobs.values() {
            match job.status {
                JobStatus::Pending => {
                    stats.pending += 1;
                    oldest_pending =
                        Some(oldest_pending.map_or(job.created_at, |t| t.min(job.created_at)));
                }
                JobStatus::Running => stats.running += 1,
                JobStatus::Success => stats.success += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        stats.oldest_pending_age_secs = oldest_pending.map(|t| (now - t).num_seconds().max(0));

        Ok(stats)
    }

    async fn recent_analysis_times(&self, since: DateTime<Utc>) -> StoreResult<Vec<u64>> {
        Ok(self
            .read()?
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Success && j.updated_at >= since)
            .filter_map(|j| j.analysis_time_ms)
            .collect())
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryPipelineStore {
    async fn get_dead_letter(&self, id: DeadLetterId) -> StoreResult<Option<DeadLetterJob>> {
        Ok(self.read()?.dead_letters.iter().find(|d| d.id == id).cloned())
    }

    async fn list_dead_letters(
        &self,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> StoreResult<Vec<DeadLetterJob>> {
        let state = self.read()?;
        let mut entries: Vec<DeadLetterJob> = state
            .dead_letters
            .iter()
            .filter(|d| since.map_or(true, |s| d.failed_at >= s))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.failed_at.cmp(&a.failed_at).then_with(|| b.id.cmp(&a.id)));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn dead_letter_counts(&self, since: DateTime<Utc>) -> StoreResult<(u64, u64)> {
        let state = self.read()?;
        let total = state.dead_letters.len() as u64;
        let recent = state
            .dead_letters
            .iter()
            .filter(|d| d.failed_at >= since)
            .count() as u64;
        Ok((total, recent))
    }
}

#[async_trait]
impl InsightStore for InMemoryPipelineStore {
    async fn get_insight_for_batch(&self, batch_id: &BatchId) -> StoreResult<Option<Insight>> {
        Ok(self.read()?.insights.get(batch_id).cloned())
    }

    async fn list_insights(&self, limit: usize) -> StoreResult<Vec<Insight>> {
        let state = self.read()?;
        let mut insights: Vec<Insight> = state.insights.values().cloned().collect();
        insights.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        insights.truncate(limit);
        Ok(insights)
    }
}
