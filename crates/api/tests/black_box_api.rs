use std::sync::Arc;

use chrono::{Duration, Utc};
use insightforge_ai::HeuristicAnalyzer;
use insightforge_api::app::{self, AppServices};
use insightforge_core::{BatchId, SystemClock};
use insightforge_events::NewBehaviorEvent;
use insightforge_infra::jobs::{AnalysisJob, DeadLetterJob, JobFailure, TriggerType, WorkOutcome};
use insightforge_infra::store::{BatchStore, InMemoryPipelineStore, JobStore};
use insightforge_infra::{Pipeline, PipelineConfig};
use reqwest::StatusCode;
use serde_json::json;

struct TestServer {
    base_url: String,
    store: Arc<InMemoryPipelineStore>,
    pipeline: Pipeline,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    /// Same router as prod over an in-memory store, bound to an ephemeral
    /// port. No loops run; tests drive the worker by hand.
    async fn spawn() -> Self {
        let store = Arc::new(InMemoryPipelineStore::new());
        let pipeline = Pipeline::new(
            PipelineConfig::default(),
            store.clone(),
            Arc::new(HeuristicAnalyzer::new()),
            SystemClock::shared(),
        )
        .unwrap();

        let app = app::build_app(Arc::new(AppServices::from_pipeline(&pipeline)));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            store,
            pipeline,
            handle,
        }
    }

    async fn open_batch_with_events(&self, n: usize) -> BatchId {
        let mut batch_id = None;
        for i in 0..n {
            let now = Utc::now();
            let event = self
                .store
                .append_event(
                    NewBehaviorEvent::new("page_view", format!("user-{i}"), now)
                        .with_metadata(json!({ "path": "/pricing" })),
                    now,
                )
                .await
                .unwrap();
            batch_id = Some(event.batch_id);
        }
        batch_id.expect("at least one event")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[tokio::test]
async fn health_is_ok() {
    let srv = TestServer::spawn().await;

    let res = reqwest::get(format!("{}/health", srv.base_url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn analyze_unknown_batch_is_not_found() {
    let srv = TestServer::spawn().await;

    let client = reqwest::Client::new();
    let res = client
        .post(format!("{}/batches/batch_missing/analyze", srv.base_url))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn manual_trigger_lifecycle() {
    let srv = TestServer::spawn().await;
    let batch_id = srv.open_batch_with_events(3).await;
    let client = reqwest::Client::new();
    let url = format!("{}/batches/{}/analyze", srv.base_url, batch_id);

    // OPEN batch: sealed and queued.
    let res = client.post(&url).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "queued");
    assert_eq!(body["job"]["status"], "PENDING");
    assert_eq!(body["job"]["trigger_type"], "MANUAL");

    // A second trigger while the job is pending conflicts.
    let res = client.post(&url).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "conflict");
    assert_eq!(body["job_status"], "PENDING");

    let outcome = srv.pipeline.worker(0).run_once().await.unwrap();
    assert!(matches!(outcome, WorkOutcome::Completed { .. }));

    let res = client.post(&url).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "already_analyzed");

    let res = client
        .get(format!("{}/batches/{}", srv.base_url, batch_id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "ANALYZED");
    assert_eq!(body["event_count"], 3);
    assert!(body["insight"].is_object());
}

#[tokio::test]
async fn metrics_report_queue_and_breaker() {
    let srv = TestServer::spawn().await;
    let batch_id = srv.open_batch_with_events(2).await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/batches/{}/analyze", srv.base_url, batch_id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);

    let res = client
        .get(format!("{}/metrics", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["jobs"]["pending"], 1);
    assert_eq!(body["circuit_breaker"]["state"], "CLOSED");
    assert_eq!(body["dead_letters"]["total"], 0);
}

#[tokio::test]
async fn dead_letters_are_listed_and_replayed() {
    let srv = TestServer::spawn().await;
    let batch_id = srv.open_batch_with_events(1).await;
    let now = Utc::now();
    srv.store.seal_batch(&batch_id, now).await.unwrap();

    let job = AnalysisJob::new(batch_id.clone(), 5, TriggerType::Scheduled, now);
    srv.store.insert_job(&job).await.unwrap();
    let running = srv
        .store
        .try_claim(job.id, now, now + Duration::minutes(10))
        .await
        .unwrap()
        .unwrap();
    let failure = JobFailure::new("forbidden", "denied", json!({ "class": "FATAL" }));
    let entry = DeadLetterJob::from_job(&running, "fatal_error", &failure, now);
    assert!(
        srv.store
            .dead_letter_job(&running.lease().unwrap(), &entry, now)
            .await
            .unwrap()
    );

    let client = reqwest::Client::new();
    let res = client
        .get(format!("{}/dead-letters?limit=10", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["count"], 1);
    assert_eq!(body["items"][0]["reason"], "fatal_error");
    assert_eq!(body["items"][0]["batch_id"], batch_id.to_string());

    let requeue = format!("{}/dead-letters/{}/requeue", srv.base_url, entry.id);
    let res = client.post(&requeue).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "queued");
    assert_ne!(body["job"]["id"], job.id.to_string());

    // The replay job is active now.
    let res = client.post(&requeue).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    // DLQ entries are immutable.
    let res = client
        .get(format!("{}/dead-letters", srv.base_url))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["count"], 1);
}

#[tokio::test]
async fn requeue_rejects_bad_and_unknown_ids() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/dead-letters/not-a-uuid/requeue", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .post(format!(
            "{}/dead-letters/{}/requeue",
            srv.base_url,
            insightforge_core::DeadLetterId::new()
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}
