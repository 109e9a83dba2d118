use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use insightforge_core::BatchId;
use insightforge_infra::jobs::TriggerOutcome;
use insightforge_infra::store::{BatchStore, InsightStore};

use crate::app::{dto, errors, services::AppServices};

pub fn router() -> Router {
    Router::new()
        .route("/:batch_id", get(get_batch))
        .route("/:batch_id/analyze", post(analyze_batch))
}

/// Analyze a batch now instead of waiting for the job creator.
pub async fn analyze_batch(
    Extension(services): Extension<Arc<AppServices>>,
    Path(batch_id): Path<String>,
) -> axum::response::Response {
    let batch_id: BatchId = match errors::parse_id("batch id", &batch_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.trigger.analyze_now(&batch_id).await {
        Ok(outcome) => trigger_outcome_to_response(&batch_id, outcome),
        Err(e) => errors::trigger_error_to_response(e),
    }
}

pub async fn get_batch(
    Extension(services): Extension<Arc<AppServices>>,
    Path(batch_id): Path<String>,
) -> axum::response::Response {
    let batch_id: BatchId = match errors::parse_id("batch id", &batch_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let batch = match services.store.get_batch(&batch_id).await {
        Ok(Some(batch)) => batch,
        Ok(None) => {
            return errors::json_error(
                StatusCode::NOT_FOUND,
                "not_found",
                format!("batch {batch_id} not found"),
            );
        }
        Err(e) => return errors::store_error_to_response(e),
    };

    let insight = match services.store.get_insight_for_batch(&batch_id).await {
        Ok(insight) => insight,
        Err(e) => return errors::store_error_to_response(e),
    };

    Json(dto::batch_to_json(&batch, insight.as_ref())).into_response()
}

pub(crate) fn trigger_outcome_to_response(
    batch_id: &BatchId,
    outcome: TriggerOutcome,
) -> axum::response::Response {
    match outcome {
        TriggerOutcome::Queued(job) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "status": "queued",
                "batch_id": batch_id.to_string(),
                "job": dto::job_to_json(&job),
            })),
        )
            .into_response(),
        TriggerOutcome::AlreadyAnalyzed => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "already_analyzed",
                "batch_id": batch_id.to_string(),
            })),
        )
            .into_response(),
    }
}
