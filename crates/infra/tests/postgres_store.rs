//! Postgres store against a live database.
//!
//! Runs only when `DATABASE_URL` is set; otherwise every test returns early.

use std::sync::Arc;

use chrono::{Duration, Utc};

use insightforge_ai::AnalysisOutput;
use insightforge_events::NewBehaviorEvent;
use insightforge_infra::batches::{BatchStatus, Insight};
use insightforge_infra::jobs::{AnalysisJob, DeadLetterJob, JobFailure, JobStatus, TriggerType};
use insightforge_infra::store::{
    BatchStore, CompletionOutcome, DeadLetterStore, InsightStore, JobStore,
    PostgresPipelineStore, StoreError,
};

async fn store() -> Option<PostgresPipelineStore> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping");
        return None;
    };
    let store = PostgresPipelineStore::connect(&url).await.unwrap();
    store.migrate().await.unwrap();
    Some(store)
}

/// Append an event and seal whatever batch it landed in.
async fn sealed_batch(store: &PostgresPipelineStore) -> insightforge_core::BatchId {
    let now = Utc::now();
    let event = store
        .append_event(NewBehaviorEvent::new("view", "pg-user", now), now)
        .await
        .unwrap();
    store.seal_batch(&event.batch_id, now).await.unwrap();
    event.batch_id
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn claim_complete_and_fence() {
    let Some(store) = store().await else { return };
    let store = Arc::new(store);
    let batch_id = sealed_batch(&store).await;

    let batch = store.get_batch(&batch_id).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Sealed);
    assert!(batch.event_count >= 1);

    let now = Utc::now();
    let job = AnalysisJob::new(batch_id.clone(), 5, TriggerType::Scheduled, now);
    store.insert_job(&job).await.unwrap();

    let duplicate = AnalysisJob::new(batch_id.clone(), 5, TriggerType::Manual, now);
    assert!(matches!(
        store.insert_job(&duplicate).await,
        Err(StoreError::Conflict(_))
    ));

    let lease_until = now + Duration::minutes(10);
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let job_id = job.id;
        tasks.push(tokio::spawn(async move {
            store.try_claim(job_id, now, lease_until).await.unwrap()
        }));
    }
    let mut claimed = Vec::new();
    for task in tasks {
        if let Some(job) = task.await.unwrap() {
            claimed.push(job);
        }
    }
    assert_eq!(claimed.len(), 1);
    let running = claimed.remove(0);
    assert_eq!(running.status, JobStatus::Running);
    let lease = running.lease().unwrap();

    let insight = Insight::from_output(&batch, AnalysisOutput::new("pg", 0.7), 1, Utc::now());
    assert_eq!(
        store.complete_job(&lease, &insight, 42, Utc::now()).await.unwrap(),
        CompletionOutcome::Completed {
            insight_stored: true
        }
    );
    assert_eq!(
        store.complete_job(&lease, &insight, 42, Utc::now()).await.unwrap(),
        CompletionOutcome::LeaseLost
    );

    let done = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Success);
    assert_eq!(done.analysis_time_ms, Some(42));
    assert_eq!(
        store.get_batch(&batch_id).await.unwrap().unwrap().status,
        BatchStatus::Analyzed
    );
    assert!(store.get_insight_for_batch(&batch_id).await.unwrap().is_some());
}

#[tokio::test]
async fn dead_letter_is_recorded_once() {
    let Some(store) = store().await else { return };
    let batch_id = sealed_batch(&store).await;

    let now = Utc::now();
    let job = AnalysisJob::new(batch_id.clone(), 5, TriggerType::Manual, now);
    store.insert_job(&job).await.unwrap();
    let running = store
        .try_claim(job.id, now, now + Duration::minutes(10))
        .await
        .unwrap()
        .unwrap();
    let lease = running.lease().unwrap();

    let failure = JobFailure::new("forbidden", "denied", serde_json::json!({"class": "FATAL"}));
    let entry = DeadLetterJob::from_job(&running, "fatal_error", &failure, Utc::now());
    assert!(store.dead_letter_job(&lease, &entry, Utc::now()).await.unwrap());
    assert!(!store.dead_letter_job(&lease, &entry, Utc::now()).await.unwrap());

    let stored = store.get_dead_letter(entry.id).await.unwrap().unwrap();
    assert_eq!(stored.job_id, job.id);
    assert_eq!(stored.reason, "fatal_error");
    assert_eq!(stored.last_error.as_deref(), Some("forbidden: denied"));
    assert_eq!(
        store.get_job(job.id).await.unwrap().unwrap().status,
        JobStatus::Failed
    );
}

#[tokio::test]
async fn jobless_scan_drops_batches_once_they_have_a_job() {
    let Some(store) = store().await else { return };
    let batch_id = sealed_batch(&store).await;

    let jobless = store.list_batches_without_jobs(10_000).await.unwrap();
    assert!(jobless.iter().any(|b| b.id == batch_id));

    let now = Utc::now();
    let job = AnalysisJob::new(batch_id.clone(), 5, TriggerType::Scheduled, now);
    store.insert_job(&job).await.unwrap();

    let jobless = store.list_batches_without_jobs(10_000).await.unwrap();
    assert!(jobless.iter().all(|b| b.id != batch_id));
}
