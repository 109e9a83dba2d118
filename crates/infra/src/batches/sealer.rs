use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use insightforge_core::{Clock, SharedClock};

use super::types::SealPolicy;
use crate::store::{PipelineStore, StoreResult};

/// Outcome of one sealing pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SealReport {
    pub examined: usize,
    pub sealed: usize,
    /// Already sealed by someone else between listing and sealing
    pub skipped: usize,
    pub failed: usize,
}

/// Closes OPEN batches that reached their size or age limit.
pub struct BatchSealer {
    store: Arc<dyn PipelineStore>,
    clock: SharedClock,
    policy: SealPolicy,
}

impl BatchSealer {
    pub fn new(store: Arc<dyn PipelineStore>, clock: SharedClock, policy: SealPolicy) -> Self {
        Self {
            store,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &SealPolicy {
        &self.policy
    }

    /// One pass. Per-batch failures are logged and left for the next pass.
    pub async fn run_once(&self) -> StoreResult<SealReport> {
        let started = Instant::now();
        let now = self.clock.now();
        let due = self.store.list_batches_due(&self.policy, now).await?;

        let mut report = SealReport {
            examined: due.len(),
            ..Default::default()
        };

        for batch in due {
            match self.store.seal_batch(&batch.id, now).await {
                Ok(true) => {
                    report.sealed += 1;
                    info!(
                        batch_id = %batch.id,
                        event_count = batch.event_count,
                        age_secs = (now - batch.created_at).num_seconds(),
                        "batch sealed"
                    );
                }
                Ok(false) => {
                    report.skipped += 1;
                    debug!(batch_id = %batch.id, "batch no longer open, skipping");
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(batch_id = %batch.id, error = %err, "failed to seal batch");
                }
            }
        }

        if report.examined > 0 {
            info!(
                examined = report.examined,
                sealed = report.sealed,
                failed = report.failed,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "sealing pass complete"
            );
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use insightforge_core::ManualClock;
    use insightforge_events::NewBehaviorEvent;

    use crate::batches::BatchStatus;
    use crate::store::{BatchStore, InMemoryPipelineStore};

    fn setup(threshold: u64) -> (Arc<ManualClock>, Arc<InMemoryPipelineStore>, BatchSealer) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 7, 1, 10, 0, 0).unwrap(),
        ));
        let store = Arc::new(InMemoryPipelineStore::new());
        let sealer = BatchSealer::new(
            store.clone(),
            clock.clone(),
            SealPolicy {
                size_threshold: threshold,
                time_window: Duration::from_secs(600),
            },
        );
        (clock, store, sealer)
    }

    #[tokio::test]
    async fn seals_full_batches() {
        let (clock, store, sealer) = setup(3);
        let mut batch_id = None;
        for i in 0..3 {
            let e = store
                .append_event(NewBehaviorEvent::new("click", format!("u{i}"), clock.now()), clock.now())
                .await
                .unwrap();
            batch_id = Some(e.batch_id);
        }
        let batch_id = batch_id.unwrap();

        let report = sealer.run_once().await.unwrap();
        assert_eq!(report.sealed, 1);

        let batch = store.get_batch(&batch_id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Sealed);
        assert_eq!(batch.sealed_at, Some(clock.now()));
    }

    #[tokio::test]
    async fn seals_old_batches_and_leaves_young_ones() {
        let (clock, store, sealer) = setup(100);
        store
            .append_event(NewBehaviorEvent::new("view", "u", clock.now()), clock.now())
            .await
            .unwrap();

        clock.advance(chrono::Duration::minutes(1));
        assert_eq!(sealer.run_once().await.unwrap().sealed, 0);

        clock.advance(chrono::Duration::minutes(10));
        assert_eq!(sealer.run_once().await.unwrap().sealed, 1);
        assert_eq!(sealer.run_once().await.unwrap().examined, 0);
    }
}
