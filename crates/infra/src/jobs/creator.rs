use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use insightforge_core::{Clock, SharedClock};

use super::types::{AnalysisJob, JobStatus, TriggerType};
use crate::store::{PipelineStore, StoreError, StoreResult};

/// Job-less sealed batches examined per pass.
const SCAN_LIMIT: usize = 500;

/// Outcome of one creation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CreateReport {
    pub examined: usize,
    pub created: usize,
    /// Batch gained a job between the scan and the insert
    pub skipped: usize,
    /// Another creator inserted the job first
    pub raced: usize,
    pub failed: usize,
}

/// Creates one SCHEDULED job per sealed batch that has none.
pub struct JobCreator {
    store: Arc<dyn PipelineStore>,
    clock: SharedClock,
    max_attempts: u32,
}

impl JobCreator {
    pub fn new(store: Arc<dyn PipelineStore>, clock: SharedClock, max_attempts: u32) -> Self {
        Self {
            store,
            clock,
            max_attempts,
        }
    }

    pub async fn run_once(&self) -> StoreResult<CreateReport> {
        let sealed = self
            .store
            .list_batches_without_jobs(SCAN_LIMIT)
            .await?;

        let mut report = CreateReport {
            examined: sealed.len(),
            ..Default::default()
        };

        for batch in sealed {
            match self.store.find_latest_job(&batch.id).await {
                Ok(Some(job)) if job.status.is_active() || job.status == JobStatus::Failed => {
                    report.skipped += 1;
                    continue;
                }
                Ok(_) => {}
                Err(err) => {
                    report.failed += 1;
                    warn!(batch_id = %batch.id, error = %err, "failed to look up jobs for batch");
                    continue;
                }
            }

            let job = AnalysisJob::new(
                batch.id.clone(),
                self.max_attempts,
                TriggerType::Scheduled,
                self.clock.now(),
            );

            match self.store.insert_job(&job).await {
                Ok(()) => {
                    report.created += 1;
                    info!(job_id = %job.id, batch_id = %batch.id, "analysis job created");
                }
                Err(StoreError::Conflict(_)) => {
                    report.raced += 1;
                    debug!(batch_id = %batch.id, "job already created by another creator");
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(batch_id = %batch.id, error = %err, "failed to create analysis job");
                }
            }
        }

        if report.created > 0 || report.failed > 0 {
            info!(
                examined = report.examined,
                created = report.created,
                skipped = report.skipped,
                raced = report.raced,
                failed = report.failed,
                "job creation pass complete"
            );
        }

        Ok(report)
    }
}
