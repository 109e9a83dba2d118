use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use crate::app::{errors, services::AppServices};

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// Point-in-time pipeline health snapshot.
pub async fn metrics(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.metrics.collect().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}
