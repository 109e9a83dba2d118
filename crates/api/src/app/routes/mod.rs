use axum::{routing::get, Router};

pub mod batches;
pub mod dead_letters;
pub mod system;

/// Router for the admin and metrics endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/metrics", get(system::metrics))
        .nest("/batches", batches::router())
        .nest("/dead-letters", dead_letters::router())
}
