use axum::{
    routing::{get, post},
    Router,
};

pub mod jobs;
pub mod system;

/// Router for all queue endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/jobs", post(jobs::submit))
        .route("/jobs/:id", get(jobs::status))
        .route("/queue/stats", get(system::stats))
}
