//! HTTP adapter for a remote analysis service.
//!
//! Wire contract:
//! - `POST <endpoint>` with `{"events": [{event_type, user_id, timestamp, metadata}, ...]}`
//! - `2xx` body: `{"summary": "...", "confidence": 0.0..1.0, "patterns": ["..."]}`
//! - Non-2xx statuses and transport failures become typed [`AnalysisError`]s.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use serde::Serialize;
use tracing::debug;

use insightforge_events::BehaviorEvent;

use crate::analyzer::{AnalysisOutput, Analyzer};
use crate::error::AnalysisError;

#[derive(Debug, Serialize)]
struct AnalyzeRequest<'a> {
    events: Vec<EventPayload<'a>>,
}

#[derive(Debug, Serialize)]
struct EventPayload<'a> {
    event_type: &'a str,
    user_id: &'a str,
    timestamp: chrono::DateTime<chrono::Utc>,
    metadata: &'a serde_json::Value,
}

/// Analyzer backed by a JSON-over-HTTP service.
#[derive(Debug, Clone)]
pub struct HttpAnalyzer {
    client: reqwest::Client,
    endpoint: String,
    bearer_token: Option<String>,
}

impl HttpAnalyzer {
    /// Build an analyzer with a client-side request timeout.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, AnalysisError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AnalysisError::Other(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            bearer_token: None,
        })
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Analyzer for HttpAnalyzer {
    fn name(&self) -> &str {
        "http"
    }

    async fn analyze(&self, events: &[BehaviorEvent]) -> Result<AnalysisOutput, AnalysisError> {
        let body = AnalyzeRequest {
            events: events
                .iter()
                .map(|e| EventPayload {
                    event_type: &e.event_type,
                    user_id: &e.user_id,
                    timestamp: e.timestamp,
                    metadata: &e.metadata,
                })
                .collect(),
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(map_transport_error)?;
        let status = response.status();
        debug!(endpoint = %self.endpoint, status = status.as_u16(), "analysis response");

        if !status.is_success() {
            let retry_after_secs = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let text = response.text().await.unwrap_or_default();

            return Err(match AnalysisError::from_status(status.as_u16(), text) {
                AnalysisError::RateLimited { .. } => AnalysisError::RateLimited { retry_after_secs },
                other => other,
            });
        }

        let output = response
            .json::<AnalysisOutput>()
            .await
            .map_err(|e| AnalysisError::InvalidResponse(e.to_string()))?;

        Ok(output.normalized())
    }
}

fn map_transport_error(err: reqwest::Error) -> AnalysisError {
    if err.is_timeout() {
        AnalysisError::Timeout(err.to_string())
    } else if err.is_connect() {
        AnalysisError::Connection(err.to_string())
    } else {
        AnalysisError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        http::{HeaderMap, StatusCode},
        response::IntoResponse,
        routing::post,
        Json, Router,
    };
    use chrono::Utc;
    use insightforge_events::NewBehaviorEvent;
    use serde_json::json;

    use crate::error::AnalysisErrorKind;

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn events() -> Vec<BehaviorEvent> {
        let now = Utc::now();
        vec![BehaviorEvent::from_new(
            "batch_http".parse().unwrap(),
            NewBehaviorEvent::new("page_view", "u1", now),
            now,
        )]
    }

    #[tokio::test]
    async fn successful_response_is_parsed_and_normalized() {
        let app = Router::new().route(
            "/analyze",
            post(|headers: HeaderMap, Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["events"].as_array().unwrap().len(), 1);
                assert_eq!(
                    headers.get("authorization").unwrap().to_str().unwrap(),
                    "Bearer secret"
                );
                Json(json!({"summary": "one view", "confidence": 1.4, "patterns": ["solo"]}))
            }),
        );
        let base = spawn(app).await;

        let analyzer = HttpAnalyzer::new(format!("{base}/analyze"), Duration::from_secs(5))
            .unwrap()
            .with_bearer_token("secret");
        let out = analyzer.analyze(&events()).await.unwrap();

        assert_eq!(out.summary, "one view");
        assert_eq!(out.confidence, 1.0);
        assert_eq!(out.patterns, vec!["solo".to_string()]);
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let app = Router::new().route(
            "/analyze",
            post(|| async { (StatusCode::TOO_MANY_REQUESTS, [("retry-after", "30")], "slow down").into_response() }),
        );
        let base = spawn(app).await;

        let analyzer = HttpAnalyzer::new(format!("{base}/analyze"), Duration::from_secs(5)).unwrap();
        let err = analyzer.analyze(&events()).await.unwrap_err();

        assert_eq!(err, AnalysisError::RateLimited { retry_after_secs: Some(30) });
    }

    #[tokio::test]
    async fn auth_failures_are_typed() {
        let app = Router::new().route("/analyze", post(|| async { StatusCode::FORBIDDEN }));
        let base = spawn(app).await;

        let analyzer = HttpAnalyzer::new(format!("{base}/analyze"), Duration::from_secs(5)).unwrap();
        let err = analyzer.analyze(&events()).await.unwrap_err();

        assert_eq!(err.kind(), AnalysisErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn garbage_body_is_an_invalid_response() {
        let app = Router::new().route("/analyze", post(|| async { "not json" }));
        let base = spawn(app).await;

        let analyzer = HttpAnalyzer::new(format!("{base}/analyze"), Duration::from_secs(5)).unwrap();
        let err = analyzer.analyze(&events()).await.unwrap_err();

        assert_eq!(err.kind(), AnalysisErrorKind::InvalidResponse);
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let app = Router::new().route(
            "/analyze",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Json(json!({"summary": "late", "confidence": 0.5}))
            }),
        );
        let base = spawn(app).await;

        let analyzer = HttpAnalyzer::new(format!("{base}/analyze"), Duration::from_millis(100)).unwrap();
        let err = analyzer.analyze(&events()).await.unwrap_err();

        assert_eq!(err.kind(), AnalysisErrorKind::Timeout);
    }
}
