//! Crash recovery: reclaims jobs whose worker went away.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use insightforge_core::{Clock, SharedClock};

use super::types::{reasons, AnalysisJob, DeadLetterJob, JobFailure, RetryPolicy};
use crate::store::{PipelineStore, StoreResult};

/// Failure code recorded on jobs reclaimed by the stuck-job sweep.
pub const STUCK_JOB_CODE: &str = "stuck_job";

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub interval: Duration,
    /// RUNNING jobs untouched for longer than this are considered abandoned.
    /// Looser than the worker's lock timeout, so a slow but alive worker is
    /// not raced.
    pub stuck_timeout: Duration,
    /// Stuck jobs handled per pass
    pub batch_limit: usize,
    /// How far back the forensics pass looks into the DLQ
    pub forensics_window: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stuck_timeout: Duration::from_secs(15 * 60),
            batch_limit: 100,
            forensics_window: Duration::from_secs(60 * 60),
        }
    }
}

/// Outcome of one recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub dead_lettered: usize,
    pub released: usize,
    /// DLQ entries inside the forensics window
    pub recent_dead_letters: usize,
}

pub struct RecoveryLoop {
    store: Arc<dyn PipelineStore>,
    clock: SharedClock,
    retry: RetryPolicy,
    config: RecoveryConfig,
}

impl RecoveryLoop {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        clock: SharedClock,
        retry: RetryPolicy,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            store,
            clock,
            retry,
            config,
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub async fn run_once(&self) -> StoreResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        self.sweep_stuck(&mut report).await?;

        let released = self.store.release_expired_leases(self.clock.now()).await?;
        for job_id in &released {
            warn!(job_id = %job_id, "expired lease released");
        }
        report.released = released.len();

        report.recent_dead_letters = self.log_recent_dead_letters().await?;

        if report.requeued + report.dead_lettered + report.released > 0 {
            info!(
                requeued = report.requeued,
                dead_lettered = report.dead_lettered,
                released = report.released,
                "recovery pass complete"
            );
        }

        Ok(report)
    }

    async fn sweep_stuck(&self, report: &mut RecoveryReport) -> StoreResult<()> {
        let now = self.clock.now();
        let cutoff = lookback(now, self.config.stuck_timeout);

        let stuck = self
            .store
            .list_stuck_jobs(cutoff, self.config.batch_limit)
            .await?;

        for job in stuck {
            let failure = stuck_failure(&job, now);

            if job.can_retry() {
                let attempt = job.attempt_count + 1;
                let retry_at = self.retry.retry_at(now, attempt);
                match self
                    .store
                    .requeue_stuck_job(job.id, cutoff, retry_at, &failure, now)
                    .await
                {
                    Ok(true) => {
                        report.requeued += 1;
                        warn!(
                            job_id = %job.id,
                            batch_id = %job.batch_id,
                            attempt,
                            retry_at = %retry_at,
                            "stuck job requeued"
                        );
                    }
                    Ok(false) => debug!(job_id = %job.id, "stuck job moved on before requeue"),
                    Err(err) => warn!(job_id = %job.id, error = %err, "failed to requeue stuck job"),
                }
            } else {
                let entry =
                    DeadLetterJob::from_job(&job, reasons::STUCK_JOB_MAX_ATTEMPTS, &failure, now);
                match self.store.dead_letter_stuck_job(&entry, cutoff, now).await {
                    Ok(true) => {
                        report.dead_lettered += 1;
                        error!(
                            job_id = %job.id,
                            batch_id = %job.batch_id,
                            dlq_id = %entry.id,
                            attempt = job.attempt_count,
                            "stuck job dead-lettered"
                        );
                    }
                    Ok(false) => debug!(job_id = %job.id, "stuck job moved on before dead-letter"),
                    Err(err) => {
                        warn!(job_id = %job.id, error = %err, "failed to dead-letter stuck job")
                    }
                }
            }
        }

        Ok(())
    }

    /// Read-only: surfaces recent DLQ entries in the logs.
    async fn log_recent_dead_letters(&self) -> StoreResult<usize> {
        let since = lookback(self.clock.now(), self.config.forensics_window);
        let recent = self
            .store
            .list_dead_letters(Some(since), self.config.batch_limit)
            .await?;

        for entry in &recent {
            info!(
                dlq_id = %entry.id,
                job_id = %entry.job_id,
                batch_id = %entry.batch_id,
                attempt = entry.attempt_count,
                reason = %entry.reason,
                last_error = entry.last_error.as_deref().unwrap_or(""),
                failed_at = %entry.failed_at,
                "recent dead letter"
            );
        }

        Ok(recent.len())
    }
}

fn stuck_failure(job: &AnalysisJob, now: chrono::DateTime<chrono::Utc>) -> JobFailure {
    let idle_secs = (now - job.updated_at).num_seconds();
    JobFailure::new(
        STUCK_JOB_CODE,
        format!("job was RUNNING without progress for {idle_secs}s"),
        json!({
            "class": "TRANSIENT",
            "code": STUCK_JOB_CODE,
            "idle_secs": idle_secs,
            "lock_expires_at": job.lock_expires_at.map(|t| t.to_rfc3339()),
        }),
    )
}

/// `now - window`, floored at the Unix epoch.
fn lookback(now: chrono::DateTime<chrono::Utc>, window: Duration) -> chrono::DateTime<chrono::Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(chrono::DateTime::<chrono::Utc>::UNIX_EPOCH)
        .max(chrono::DateTime::<chrono::Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{TimeZone, Utc};
    use insightforge_core::ManualClock;

    use crate::jobs::{JobStatus, TriggerType};
    use crate::store::{DeadLetterStore, InMemoryPipelineStore, JobStore};

    fn setup() -> (Arc<ManualClock>, Arc<InMemoryPipelineStore>, RecoveryLoop) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap(),
        ));
        let store = Arc::new(InMemoryPipelineStore::new());
        let recovery = RecoveryLoop::new(
            store.clone(),
            clock.clone(),
            RetryPolicy::new(5, Duration::from_secs(30)).with_jitter(0.0),
            RecoveryConfig::default(),
        );
        (clock, store, recovery)
    }

    /// A RUNNING job claimed `minutes_ago` with a lease that outlives the sweep.
    fn running_job(clock: &ManualClock, attempt_count: u32, minutes_ago: i64) -> AnalysisJob {
        let claimed_at = clock.now() - chrono::Duration::minutes(minutes_ago);
        let mut job = AnalysisJob::new("batch_a".parse().unwrap(), 5, TriggerType::Scheduled, claimed_at);
        job.status = JobStatus::Running;
        job.attempt_count = attempt_count;
        job.lock_expires_at = Some(clock.now() + chrono::Duration::hours(1));
        job.updated_at = claimed_at;
        job
    }

    #[tokio::test]
    async fn stuck_job_is_requeued_with_an_extra_attempt() {
        let (clock, store, recovery) = setup();
        let job = running_job(&clock, 2, 16);
        store.put_job(job.clone()).unwrap();

        let report = recovery.run_once().await.unwrap();
        assert_eq!(report.requeued, 1);

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt_count, 3);
        // 30s * 2^3
        assert_eq!(
            job.lock_expires_at,
            Some(clock.now() + chrono::Duration::seconds(240))
        );
        assert!(job.last_error.unwrap().starts_with("stuck_job:"));
    }

    #[tokio::test]
    async fn recently_updated_job_is_left_alone() {
        let (clock, store, recovery) = setup();
        let job = running_job(&clock, 2, 14);
        store.put_job(job.clone()).unwrap();

        assert_eq!(recovery.run_once().await.unwrap(), RecoveryReport::default());
        assert_eq!(
            store.get_job(job.id).await.unwrap().unwrap().status,
            JobStatus::Running
        );
    }

    #[tokio::test]
    async fn stuck_job_at_max_attempts_is_dead_lettered() {
        let (clock, store, recovery) = setup();
        let job = running_job(&clock, 5, 20);
        store.put_job(job.clone()).unwrap();

        let report = recovery.run_once().await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.recent_dead_letters, 1);

        let dlq = store.list_dead_letters(None, 10).await.unwrap();
        assert_eq!(dlq[0].job_id, job.id);
        assert_eq!(dlq[0].reason, reasons::STUCK_JOB_MAX_ATTEMPTS);
        assert_eq!(
            store.get_job(job.id).await.unwrap().unwrap().status,
            JobStatus::Failed
        );
    }

    #[tokio::test]
    async fn expired_lease_is_released_and_counted() {
        let (clock, store, recovery) = setup();
        let mut job = running_job(&clock, 1, 11);
        job.lock_expires_at = Some(clock.now() - chrono::Duration::minutes(1));
        store.put_job(job.clone()).unwrap();

        let report = recovery.run_once().await.unwrap();
        assert_eq!(report.released, 1);
        assert_eq!(report.requeued, 0);

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt_count, 2);
        assert!(job.is_claimable(clock.now()));
    }

    #[tokio::test]
    async fn expired_lease_at_max_attempts_waits_for_the_stuck_sweep() {
        let (clock, store, recovery) = setup();
        let mut job = running_job(&clock, 5, 11);
        job.lock_expires_at = Some(clock.now() - chrono::Duration::minutes(1));
        store.put_job(job.clone()).unwrap();

        assert_eq!(recovery.run_once().await.unwrap().released, 0);
        assert_eq!(
            store.get_job(job.id).await.unwrap().unwrap().status,
            JobStatus::Running
        );

        clock.advance(chrono::Duration::minutes(5));
        assert_eq!(recovery.run_once().await.unwrap().dead_lettered, 1);
    }

    #[test]
    fn lookback_is_floored_at_the_epoch() {
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap();
        assert_eq!(
            lookback(now, Duration::from_secs(900)),
            now - chrono::Duration::minutes(15)
        );
        assert_eq!(
            lookback(now, Duration::from_secs(u64::MAX)),
            chrono::DateTime::<Utc>::UNIX_EPOCH
        );
    }
}
