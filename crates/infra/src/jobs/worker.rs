//! Job worker: claims one job at a time and drives it to a persisted outcome.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use insightforge_ai::{AnalysisError, Analyzer};
use insightforge_core::{Clock, JobId, SharedClock};

use super::classify::{classify, error_context, Classification};
use super::error::ProcessError;
use super::types::{
    reasons, retry_deadline, AnalysisJob, DeadLetterJob, JobFailure, Lease, RetryPolicy,
};
use crate::batches::{BatchStatus, Insight};
use crate::breaker::CircuitBreaker;
use crate::scheduler::{LoopHandle, PeriodicLoop};
use crate::store::{CompletionOutcome, PipelineStore, StoreError, StoreResult};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging
    pub name: String,
    /// Wait between iterations
    pub poll_interval: Duration,
    /// Lease length granted by a claim
    pub lock_timeout: Duration,
    /// Upper bound on one analysis call
    pub analysis_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            poll_interval: Duration::from_secs(5),
            lock_timeout: Duration::from_secs(10 * 60),
            analysis_timeout: Duration::from_secs(120),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// What one iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    /// Nothing claimable.
    Idle,
    Completed {
        job_id: JobId,
        insight_stored: bool,
        analysis_time_ms: u64,
    },
    Retried {
        job_id: JobId,
        attempt: u32,
        retry_at: DateTime<Utc>,
        code: &'static str,
    },
    DeadLettered {
        job_id: JobId,
        code: &'static str,
        reason: &'static str,
    },
    /// The lease was taken over (expired and reclaimed) before we finished;
    /// nothing was written.
    LeaseLost { job_id: JobId },
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
    pub leases_lost: u64,
    pub claim_errors: u64,
    pub last_error: Option<String>,
}

pub struct JobWorker {
    config: WorkerConfig,
    store: Arc<dyn PipelineStore>,
    analyzer: Arc<dyn Analyzer>,
    breaker: Arc<CircuitBreaker>,
    clock: SharedClock,
    retry: RetryPolicy,
    stats: Arc<Mutex<WorkerStats>>,
}

impl JobWorker {
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn PipelineStore>,
        analyzer: Arc<dyn Analyzer>,
        breaker: Arc<CircuitBreaker>,
        clock: SharedClock,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            config,
            store,
            analyzer,
            breaker,
            clock,
            retry,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, update: impl FnOnce(&mut WorkerStats)) {
        update(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    fn lease_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.config.lock_timeout)
            .ok()
            .and_then(|lease| now.checked_add_signed(lease))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Claim at most one job and process it.
    pub async fn run_once(&self) -> StoreResult<WorkOutcome> {
        let now = self.clock.now();
        let Some(job) = self
            .store
            .claim_next(now, self.lease_expiry(now))
            .await?
        else {
            return Ok(WorkOutcome::Idle);
        };

        let lease = job
            .lease()
            .ok_or_else(|| StoreError::Storage(format!("claimed job {} has no lease", job.id)))?;

        info!(
            worker = %self.config.name,
            job_id = %job.id,
            batch_id = %job.batch_id,
            attempt = job.attempt_count,
            trigger = job.trigger_type.as_str(),
            lease_until = %lease.expires_at,
            "job claimed"
        );

        let started = Instant::now();
        let outcome = match self.process(&job).await {
            Ok(insight) => {
                let analysis_time_ms = started.elapsed().as_millis() as u64;
                match self
                    .store
                    .complete_job(&lease, &insight, analysis_time_ms, self.clock.now())
                    .await
                {
                    Ok(CompletionOutcome::Completed { insight_stored }) => {
                        info!(
                            worker = %self.config.name,
                            job_id = %job.id,
                            batch_id = %job.batch_id,
                            elapsed_ms = analysis_time_ms,
                            insight_stored,
                            "job completed"
                        );
                        WorkOutcome::Completed {
                            job_id: job.id,
                            insight_stored,
                            analysis_time_ms,
                        }
                    }
                    Ok(CompletionOutcome::LeaseLost) => self.lease_lost(&job),
                    Err(err) => self.handle_failure(&job, &lease, err.into()).await?,
                }
            }
            Err(err) => self.handle_failure(&job, &lease, err).await?,
        };

        self.record(|s| {
            s.jobs_processed += 1;
            match &outcome {
                WorkOutcome::Completed { .. } => s.jobs_succeeded += 1,
                WorkOutcome::Retried { code, .. } => {
                    s.jobs_retried += 1;
                    s.last_error = Some(code.to_string());
                }
                WorkOutcome::DeadLettered { code, .. } => {
                    s.jobs_dead_lettered += 1;
                    s.last_error = Some(code.to_string());
                }
                WorkOutcome::LeaseLost { .. } => s.leases_lost += 1,
                WorkOutcome::Idle => {}
            }
        });

        Ok(outcome)
    }

    /// Validate the batch, run the analysis and build the insight.
    async fn process(&self, job: &AnalysisJob) -> Result<Insight, ProcessError> {
        let batch = self
            .store
            .get_batch(&job.batch_id)
            .await?
            .ok_or_else(|| ProcessError::BatchNotFound(job.batch_id.clone()))?;

        if batch.status != BatchStatus::Sealed {
            return Err(ProcessError::BatchNotSealed {
                batch_id: batch.id,
                status: batch.status,
            });
        }

        let events = self.store.load_batch_events(&batch.id).await?;
        if events.is_empty() {
            return Err(ProcessError::NoEvents(batch.id));
        }

        debug!(
            job_id = %job.id,
            batch_id = %batch.id,
            event_count = events.len(),
            analyzer = self.analyzer.name(),
            "invoking analysis"
        );

        let limit = self.config.analysis_timeout;
        let output = self
            .breaker
            .execute(|| async {
                match tokio::time::timeout(limit, self.analyzer.analyze(&events)).await {
                    Ok(result) => result.map_err(ProcessError::from),
                    Err(_) => Err(ProcessError::Timeout(limit)),
                }
            })
            .await
            .map_err(ProcessError::from)?;

        Ok(Insight::from_output(
            &batch,
            output,
            events.len() as u64,
            self.clock.now(),
        ))
    }

    async fn handle_failure(
        &self,
        job: &AnalysisJob,
        lease: &Lease,
        err: ProcessError,
    ) -> StoreResult<WorkOutcome> {
        let classification = classify(&err);
        let failure = JobFailure::new(
            classification.code,
            classification.message.clone(),
            error_context(&err, &classification),
        );
        let now = self.clock.now();

        if classification.is_transient() && job.can_retry() {
            let attempt = job.attempt_count + 1;
            let retry_at = self.retry_at(&err, now, attempt);

            if !self.store.requeue_job(lease, retry_at, &failure, now).await? {
                return Ok(self.lease_lost(job));
            }

            warn!(
                worker = %self.config.name,
                job_id = %job.id,
                batch_id = %job.batch_id,
                attempt,
                max_attempts = job.max_attempts,
                error_code = classification.code,
                error = %classification.message,
                retry_at = %retry_at,
                "job failed, retrying"
            );
            return Ok(WorkOutcome::Retried {
                job_id: job.id,
                attempt,
                retry_at,
                code: classification.code,
            });
        }

        let reason = dead_letter_reason(&classification);
        let entry = DeadLetterJob::from_job(job, reason, &failure, now);

        if !self.store.dead_letter_job(lease, &entry, now).await? {
            return Ok(self.lease_lost(job));
        }

        error!(
            worker = %self.config.name,
            job_id = %job.id,
            batch_id = %job.batch_id,
            dlq_id = %entry.id,
            attempt = job.attempt_count,
            error_code = classification.code,
            error = %classification.message,
            reason,
            "job dead-lettered"
        );
        Ok(WorkOutcome::DeadLettered {
            job_id: job.id,
            code: classification.code,
            reason,
        })
    }

    /// Backoff deadline; a provider's `Retry-After` is honored when longer,
    /// up to [`super::MAX_RETRY_DELAY`].
    fn retry_at(&self, err: &ProcessError, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        let backoff = self.retry.retry_at(now, attempt);
        match err {
            ProcessError::Analysis(AnalysisError::RateLimited {
                retry_after_secs: Some(secs),
            }) => backoff.max(retry_deadline(now, Duration::from_secs(*secs))),
            _ => backoff,
        }
    }

    fn lease_lost(&self, job: &AnalysisJob) -> WorkOutcome {
        warn!(
            worker = %self.config.name,
            job_id = %job.id,
            batch_id = %job.batch_id,
            "lease lost before the outcome was recorded, discarding result"
        );
        WorkOutcome::LeaseLost { job_id: job.id }
    }

    /// Run the worker loop until `shutdown` is cancelled.
    pub fn spawn(self: Arc<Self>, shutdown: &CancellationToken) -> WorkerHandle {
        let stats = self.stats.clone();
        let name = self.config.name.clone();
        let worker = self.clone();

        let handle = PeriodicLoop::new(name, self.config.poll_interval).spawn(shutdown, move || {
            let worker = worker.clone();
            async move {
                if let Err(err) = worker.run_once().await {
                    worker.record(|s| {
                        s.claim_errors += 1;
                        s.last_error = Some(err.to_string());
                    });
                    error!(worker = %worker.config.name, error = %err, "worker iteration failed");
                }
            }
        });

        WorkerHandle { handle, stats }
    }
}

fn dead_letter_reason(classification: &Classification) -> &'static str {
    if classification.is_transient() {
        reasons::MAX_ATTEMPTS_EXCEEDED
    } else {
        reasons::FATAL_ERROR
    }
}

/// Handle to a running worker loop.
#[derive(Debug)]
pub struct WorkerHandle {
    handle: LoopHandle,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stop after the in-flight job, wait, and return the final stats.
    pub async fn shutdown(self) -> WorkerStats {
        self.handle.shutdown().await;
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
