use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use insightforge_core::DeadLetterId;
use insightforge_infra::store::DeadLetterStore;

use crate::app::routes::batches::trigger_outcome_to_response;
use crate::app::{dto, errors, services::AppServices};

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_dead_letters))
        .route("/:dlq_id/requeue", post(requeue_dead_letter))
}

/// Most recent DLQ entries first.
pub async fn list_dead_letters(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListQuery>,
) -> axum::response::Response {
    match services.store.list_dead_letters(None, query.limit()).await {
        Ok(entries) => Json(serde_json::json!({
            "count": entries.len(),
            "items": entries.iter().map(dto::dead_letter_to_json).collect::<Vec<_>>(),
        }))
        .into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// Replay a dead-lettered batch with a fresh MANUAL job. The DLQ entry stays.
pub async fn requeue_dead_letter(
    Extension(services): Extension<Arc<AppServices>>,
    Path(dlq_id): Path<String>,
) -> axum::response::Response {
    let dlq_id: DeadLetterId = match errors::parse_id("dead letter id", &dlq_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let entry = match services.store.get_dead_letter(dlq_id).await {
        Ok(Some(entry)) => entry,
        Ok(None) => {
            return errors::json_error(
                axum::http::StatusCode::NOT_FOUND,
                "not_found",
                format!("dead letter {dlq_id} not found"),
            );
        }
        Err(e) => return errors::store_error_to_response(e),
    };

    match services.trigger.requeue_dead_letter(dlq_id).await {
        Ok(outcome) => trigger_outcome_to_response(&entry.batch_id, outcome),
        Err(e) => errors::trigger_error_to_response(e),
    }
}
