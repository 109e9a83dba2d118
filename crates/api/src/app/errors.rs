use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use insightforge_infra::jobs::TriggerError;
use insightforge_infra::store::StoreError;

pub fn trigger_error_to_response(err: TriggerError) -> axum::response::Response {
    match err {
        TriggerError::NotFound(what) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("{what} not found"))
        }
        TriggerError::Conflict { job_id, status } => (
            StatusCode::CONFLICT,
            axum::Json(json!({
                "error": "conflict",
                "message": format!("job {job_id} is already {status} for this batch"),
                "job_id": job_id.to_string(),
                "job_status": status.to_string(),
            })),
        )
            .into_response(),
        TriggerError::Store(e) => store_error_to_response(e),
    }
}

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    match err {
        StoreError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        StoreError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        StoreError::Storage(msg) => {
            tracing::error!(error = %msg, "storage failure while serving request");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg)
        }
        StoreError::Serialization(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "serialization_error", msg)
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn parse_id<T: std::str::FromStr>(
    kind: &'static str,
    raw: &str,
) -> Result<T, axum::response::Response> {
    raw.parse::<T>().map_err(|_| {
        json_error(
            StatusCode::BAD_REQUEST,
            "invalid_id",
            format!("invalid {kind}: {raw}"),
        )
    })
}
