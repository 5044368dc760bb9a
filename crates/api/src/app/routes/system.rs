use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use crate::app::{errors, AppState};

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn stats(Extension(state): Extension<Arc<AppState>>) -> axum::response::Response {
    match state.store.queue_stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}
