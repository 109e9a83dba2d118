//! Administrative trigger: analyze a batch now, or replay a dead letter.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use insightforge_core::{BatchId, Clock, DeadLetterId, JobId, SharedClock};

use super::types::{AnalysisJob, JobStatus, TriggerType};
use crate::batches::BatchStatus;
use crate::store::{PipelineStore, StoreError};

#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    /// A MANUAL job was created.
    Queued(AnalysisJob),
    /// Nothing to do; the batch already has its insight.
    AlreadyAnalyzed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TriggerError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("job {job_id} is already {status} for this batch")]
    Conflict { job_id: JobId, status: JobStatus },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct ManualTrigger {
    store: Arc<dyn PipelineStore>,
    clock: SharedClock,
    max_attempts: u32,
}

impl ManualTrigger {
    pub fn new(store: Arc<dyn PipelineStore>, clock: SharedClock, max_attempts: u32) -> Self {
        Self {
            store,
            clock,
            max_attempts,
        }
    }

    pub async fn analyze_now(&self, batch_id: &BatchId) -> Result<TriggerOutcome, TriggerError> {
        let batch = self
            .store
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| TriggerError::NotFound(format!("batch {batch_id}")))?;

        match batch.status {
            BatchStatus::Analyzed | BatchStatus::Archived => {
                return Ok(TriggerOutcome::AlreadyAnalyzed);
            }
            BatchStatus::Open => {
                if self.store.seal_batch(batch_id, self.clock.now()).await? {
                    info!(batch_id = %batch_id, "batch sealed by manual trigger");
                }
            }
            BatchStatus::Sealed => {}
        }

        if let Some(job) = self.store.find_active_job(batch_id).await? {
            return existing(job);
        }

        let job = AnalysisJob::new(
            batch_id.clone(),
            self.max_attempts,
            TriggerType::Manual,
            self.clock.now(),
        );

        match self.store.insert_job(&job).await {
            Ok(()) => {
                info!(job_id = %job.id, batch_id = %batch_id, "manual analysis job queued");
                Ok(TriggerOutcome::Queued(job))
            }
            Err(StoreError::Conflict(_)) => {
                let job = self.store.find_active_job(batch_id).await?.ok_or_else(|| {
                    StoreError::Conflict(format!("active job for batch {batch_id} vanished"))
                })?;
                existing(job)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Replay a dead-lettered batch. The DLQ record itself is left untouched.
    pub async fn requeue_dead_letter(
        &self,
        dlq_id: DeadLetterId,
    ) -> Result<TriggerOutcome, TriggerError> {
        let entry = self
            .store
            .get_dead_letter(dlq_id)
            .await?
            .ok_or_else(|| TriggerError::NotFound(format!("dead letter {dlq_id}")))?;

        let outcome = self.analyze_now(&entry.batch_id).await;
        match &outcome {
            Ok(TriggerOutcome::Queued(job)) => info!(
                dlq_id = %dlq_id,
                job_id = %job.id,
                batch_id = %entry.batch_id,
                "dead letter requeued"
            ),
            Ok(TriggerOutcome::AlreadyAnalyzed) => {
                info!(dlq_id = %dlq_id, batch_id = %entry.batch_id, "dead letter batch already analyzed")
            }
            Err(err) => warn!(dlq_id = %dlq_id, error = %err, "dead letter requeue rejected"),
        }
        outcome
    }
}

fn existing(job: AnalysisJob) -> Result<TriggerOutcome, TriggerError> {
    if job.status == JobStatus::Success {
        Ok(TriggerOutcome::AlreadyAnalyzed)
    } else {
        Err(TriggerError::Conflict {
            job_id: job.id,
            status: job.status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{TimeZone, Utc};
    use insightforge_core::ManualClock;
    use insightforge_events::NewBehaviorEvent;
    use serde_json::json;

    use crate::jobs::{DeadLetterJob, JobFailure};
    use crate::store::{BatchStore, InMemoryPipelineStore, JobStore};

    async fn setup() -> (Arc<InMemoryPipelineStore>, ManualTrigger, BatchId) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 5, 4, 8, 0, 0).unwrap(),
        ));
        let store = Arc::new(InMemoryPipelineStore::new());
        let e = store
            .append_event(NewBehaviorEvent::new("signup", "u1", clock.now()), clock.now())
            .await
            .unwrap();
        let trigger = ManualTrigger::new(store.clone(), clock, 5);
        (store, trigger, e.batch_id)
    }

    #[tokio::test]
    async fn unknown_batch_is_not_found() {
        let (_store, trigger, _) = setup().await;
        let err = trigger
            .analyze_now(&"batch_missing".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, TriggerError::NotFound(_)));
    }

    #[tokio::test]
    async fn open_batch_is_sealed_and_queued() {
        let (store, trigger, batch_id) = setup().await;

        let TriggerOutcome::Queued(job) = trigger.analyze_now(&batch_id).await.unwrap() else {
            panic!("expected a queued job");
        };
        assert_eq!(job.trigger_type, TriggerType::Manual);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(
            store.get_batch(&batch_id).await.unwrap().unwrap().status,
            BatchStatus::Sealed
        );
    }

    #[tokio::test]
    async fn pending_job_conflicts() {
        let (_store, trigger, batch_id) = setup().await;
        let TriggerOutcome::Queued(job) = trigger.analyze_now(&batch_id).await.unwrap() else {
            panic!("expected a queued job");
        };

        let err = trigger.analyze_now(&batch_id).await.unwrap_err();
        assert_eq!(
            err,
            TriggerError::Conflict {
                job_id: job.id,
                status: JobStatus::Pending
            }
        );
    }

    #[tokio::test]
    async fn successful_job_means_already_analyzed() {
        let (store, trigger, batch_id) = setup().await;
        let TriggerOutcome::Queued(mut job) = trigger.analyze_now(&batch_id).await.unwrap() else {
            panic!("expected a queued job");
        };
        job.status = JobStatus::Success;
        store.put_job(job).unwrap();

        assert_eq!(
            trigger.analyze_now(&batch_id).await.unwrap(),
            TriggerOutcome::AlreadyAnalyzed
        );
    }

    #[tokio::test]
    async fn dead_letter_requeue_creates_a_fresh_job() {
        let (store, trigger, batch_id) = setup().await;
        let TriggerOutcome::Queued(job) = trigger.analyze_now(&batch_id).await.unwrap() else {
            panic!("expected a queued job");
        };

        let t = job.created_at;
        let claimed = store
            .claim_next(t, t + chrono::Duration::minutes(10))
            .await
            .unwrap()
            .unwrap();
        let failure = JobFailure::new("forbidden", "denied", json!({}));
        let entry = DeadLetterJob::from_job(&claimed, "fatal_error", &failure, t);
        assert!(store
            .dead_letter_job(&claimed.lease().unwrap(), &entry, t)
            .await
            .unwrap());

        let TriggerOutcome::Queued(replay) = trigger.requeue_dead_letter(entry.id).await.unwrap()
        else {
            panic!("expected a queued job");
        };
        assert_ne!(replay.id, job.id);
        assert_eq!(replay.attempt_count, 0);

        let missing = trigger.requeue_dead_letter(DeadLetterId::new()).await;
        assert!(matches!(missing, Err(TriggerError::NotFound(_))));
    }
}
