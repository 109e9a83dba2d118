//! Integration tests for the full pipeline over the in-memory store.
//!
//! Tests: events → Sealer → Creator → Worker → Insight, plus the failure paths
//!
//! Verifies:
//! - A full batch is sealed, analyzed once, and reported in metrics
//! - Repeated timeouts back off and finally dead-letter the job
//! - Concurrent claims on one job have exactly one winner
//! - Recovery reclaims abandoned jobs and fences out the old holder
//! - The circuit breaker stops calling a failing analyzer

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};

    use insightforge_ai::{AnalysisError, AnalysisOutput, Analyzer, HeuristicAnalyzer};
    use insightforge_core::{BatchId, Clock, ManualClock};
    use insightforge_events::{BehaviorEvent, NewBehaviorEvent};

    use crate::batches::{BatchStatus, Insight};
    use crate::config::PipelineConfig;
    use crate::jobs::{AnalysisJob, JobStatus, TriggerType, WorkOutcome};
    use crate::pipeline::Pipeline;
    use crate::store::{
        BatchStore, CompletionOutcome, DeadLetterStore, InMemoryPipelineStore, InsightStore,
        JobStore,
    };

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, 12, 0, 0).unwrap()
    }

    /// Never answers; only the worker's timeout ends the call.
    struct HangingAnalyzer {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Analyzer for HangingAnalyzer {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn analyze(&self, _events: &[BehaviorEvent]) -> Result<AnalysisOutput, AnalysisError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(AnalysisOutput::new("too late", 0.1))
        }
    }

    struct BrokenAnalyzer {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Analyzer for BrokenAnalyzer {
        fn name(&self) -> &str {
            "broken"
        }

        async fn analyze(&self, _events: &[BehaviorEvent]) -> Result<AnalysisOutput, AnalysisError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(AnalysisError::Upstream {
                status: 503,
                message: "unavailable".into(),
            })
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<InMemoryPipelineStore>,
        pipeline: Pipeline,
    }

    fn fixture(analyzer: Arc<dyn Analyzer>, config: PipelineConfig) -> Fixture {
        let clock = Arc::new(ManualClock::new(t0()));
        let store = Arc::new(InMemoryPipelineStore::new());
        let pipeline = Pipeline::new(config, store.clone(), analyzer, clock.clone()).unwrap();
        Fixture {
            clock,
            store,
            pipeline,
        }
    }

    async fn ingest(f: &Fixture, count: usize) -> BatchId {
        let mut batch_id = None;
        for i in 0..count {
            let at = f.clock.now() + chrono::Duration::milliseconds(i as i64);
            let event = NewBehaviorEvent::new(
                if i % 3 == 0 { "purchase" } else { "view" },
                format!("user-{}", i % 7),
                at,
            );
            batch_id = Some(f.store.append_event(event, f.clock.now()).await.unwrap().batch_id);
        }
        batch_id.unwrap()
    }

    /// A sealed batch with one PENDING job.
    async fn queued_batch(f: &Fixture, events: usize) -> (BatchId, AnalysisJob) {
        let batch_id = ingest(f, events).await;
        f.store.seal_batch(&batch_id, f.clock.now()).await.unwrap();
        f.pipeline.creator().run_once().await.unwrap();
        let job = f.store.find_active_job(&batch_id).await.unwrap().unwrap();
        (batch_id, job)
    }

    #[tokio::test]
    async fn full_batch_flows_to_an_insight() {
        let f = fixture(Arc::new(HeuristicAnalyzer::new()), PipelineConfig::default());
        let batch_id = ingest(&f, 100).await;

        let sealed = f.pipeline.sealer().run_once().await.unwrap();
        assert_eq!(sealed.sealed, 1);

        let created = f.pipeline.creator().run_once().await.unwrap();
        assert_eq!(created.created, 1);
        let job = f.store.find_active_job(&batch_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt_count, 0);

        let outcome = f.pipeline.worker(0).run_once().await.unwrap();
        assert!(matches!(outcome, WorkOutcome::Completed { insight_stored: true, .. }));

        let job = f.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.lock_expires_at, None);
        assert_eq!(
            f.store.get_batch(&batch_id).await.unwrap().unwrap().status,
            BatchStatus::Analyzed
        );
        let insight = f.store.get_insight_for_batch(&batch_id).await.unwrap().unwrap();
        assert_eq!(insight.event_count, 100);

        // Nothing left to do on the next ticks.
        assert_eq!(f.pipeline.creator().run_once().await.unwrap().created, 0);
        assert_eq!(f.pipeline.worker(0).run_once().await.unwrap(), WorkOutcome::Idle);

        let metrics = f.pipeline.metrics().collect().await.unwrap();
        assert_eq!(metrics.jobs.success, 1);
        assert_eq!(metrics.batches.analyzed, 1);
        assert_eq!(metrics.latency.count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_timeouts_back_off_then_dead_letter() {
        let analyzer = Arc::new(HangingAnalyzer {
            calls: AtomicU32::new(0),
        });
        let f = fixture(
            analyzer.clone(),
            PipelineConfig {
                analysis_timeout_secs: 5,
                retry_jitter: 0.0,
                ..Default::default()
            },
        );
        let (_batch_id, job) = queued_batch(&f, 10).await;
        let worker = f.pipeline.worker(0);

        let mut delays = Vec::new();
        for expected_attempt in 1..=5 {
            let now = f.clock.now();
            match worker.run_once().await.unwrap() {
                WorkOutcome::Retried {
                    attempt,
                    retry_at,
                    code,
                    ..
                } => {
                    assert_eq!(attempt, expected_attempt);
                    assert_eq!(code, "timeout");
                    delays.push((retry_at - now).num_seconds());
                }
                other => panic!("attempt {expected_attempt}: unexpected {other:?}"),
            }
            f.clock.advance(chrono::Duration::hours(1));
        }
        assert_eq!(delays, vec![60, 120, 240, 480, 960]);

        let outcome = worker.run_once().await.unwrap();
        assert!(matches!(
            outcome,
            WorkOutcome::DeadLettered {
                code: "timeout",
                reason: "max_attempts_exceeded",
                ..
            }
        ));
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 6);

        let job = f.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt_count, 5);

        let dlq = f.store.list_dead_letters(None, 10).await.unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].job_id, job.id);
        assert!(dlq[0].last_error.as_deref().unwrap().starts_with("timeout:"));

        // The scheduled creator does not replay the DLQ on its own.
        assert_eq!(f.pipeline.creator().run_once().await.unwrap().created, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_have_one_winner() {
        let f = fixture(Arc::new(HeuristicAnalyzer::new()), PipelineConfig::default());
        let (_batch_id, job) = queued_batch(&f, 3).await;

        let now = f.clock.now();
        let lease_until = now + chrono::Duration::minutes(10);
        let job_id = job.id;
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let store = f.store.clone();
            tasks.push(tokio::spawn(async move {
                store.try_claim(job_id, now, lease_until).await.unwrap()
            }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn recovery_reclaims_an_abandoned_job() {
        let f = fixture(Arc::new(HeuristicAnalyzer::new()), PipelineConfig::default());
        let (batch_id, mut job) = queued_batch(&f, 5).await;
        job.attempt_count = 2;
        f.store.put_job(job.clone()).unwrap();

        // A worker claims the job and then disappears.
        let claimed = f
            .store
            .claim_next(f.clock.now(), f.clock.now() + chrono::Duration::minutes(10))
            .await
            .unwrap()
            .unwrap();
        let abandoned = claimed.lease().unwrap();

        f.clock.advance(chrono::Duration::minutes(16));
        let report = f.pipeline.recovery().run_once().await.unwrap();
        assert_eq!(report.requeued, 1);

        let job = f.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt_count, 3);

        // The original holder wakes up; its result is discarded.
        let batch = f.store.get_batch(&batch_id).await.unwrap().unwrap();
        let insight = Insight::from_output(&batch, AnalysisOutput::new("late", 0.5), 5, f.clock.now());
        assert_eq!(
            f.store
                .complete_job(&abandoned, &insight, 10, f.clock.now())
                .await
                .unwrap(),
            CompletionOutcome::LeaseLost
        );

        // After the backoff a live worker finishes it.
        f.clock.advance(chrono::Duration::hours(1));
        let outcome = f.pipeline.worker(1).run_once().await.unwrap();
        assert!(matches!(outcome, WorkOutcome::Completed { .. }));
        assert_eq!(
            f.store.get_job(job.id).await.unwrap().unwrap().attempt_count,
            3
        );
    }

    #[tokio::test]
    async fn open_circuit_short_circuits_the_analyzer() {
        let analyzer = Arc::new(BrokenAnalyzer {
            calls: AtomicU32::new(0),
        });
        let f = fixture(analyzer.clone(), PipelineConfig::default());
        let worker = f.pipeline.worker(0);

        for _ in 0..5 {
            queued_batch(&f, 2).await;
            let outcome = worker.run_once().await.unwrap();
            assert!(matches!(outcome, WorkOutcome::Retried { code: "upstream_error", .. }));
        }
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 5);

        queued_batch(&f, 2).await;
        let outcome = worker.run_once().await.unwrap();
        assert!(matches!(outcome, WorkOutcome::Retried { code: "circuit_open", .. }));
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 5);

        let metrics = f.pipeline.metrics().collect().await.unwrap();
        assert_eq!(metrics.circuit_breaker.failure_count, 5);
        assert_eq!(
            metrics.circuit_breaker.state,
            crate::breaker::CircuitState::Open
        );
    }

    #[tokio::test]
    async fn manual_trigger_and_dead_letter_replay() {
        let f = fixture(Arc::new(HeuristicAnalyzer::new()), PipelineConfig::default());
        let batch_id = ingest(&f, 4).await;
        let trigger = f.pipeline.trigger();

        let outcome = trigger.analyze_now(&batch_id).await.unwrap();
        let crate::jobs::TriggerOutcome::Queued(job) = outcome else {
            panic!("expected a queued job, got {outcome:?}");
        };
        assert_eq!(job.trigger_type, TriggerType::Manual);

        assert!(matches!(
            f.pipeline.worker(0).run_once().await.unwrap(),
            WorkOutcome::Completed { .. }
        ));
        assert_eq!(
            trigger.analyze_now(&batch_id).await.unwrap(),
            crate::jobs::TriggerOutcome::AlreadyAnalyzed
        );
    }
}
