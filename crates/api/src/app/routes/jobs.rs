use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use briefly_core::JobId;
use briefly_infra::store::EnqueueStatus;

use crate::app::{dto, errors, AppState};

/// `POST /jobs`: submit work. Equivalent submissions collapse onto the
/// existing job.
pub async fn submit(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<dto::SubmitJobRequest>,
) -> axum::response::Response {
    if body.file_id.trim().is_empty() {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "invalid_file_id",
            "file_id must not be empty",
        );
    }
    if !body.payload.is_object() {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "invalid_payload",
            "payload must be a JSON object",
        );
    }

    let priority = body.priority.unwrap_or(1);
    let max_attempts = body.max_attempts.unwrap_or(3);
    if max_attempts < 1 {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "invalid_max_attempts",
            "max_attempts must be at least 1",
        );
    }

    match state
        .store
        .enqueue(&body.file_id, &body.payload, priority, max_attempts)
        .await
    {
        Ok(receipt) => {
            let status = match receipt.status {
                EnqueueStatus::Enqueued => StatusCode::ACCEPTED,
                _ => StatusCode::OK,
            };
            (
                status,
                Json(serde_json::json!({
                    "job_id": receipt.job_id.to_string(),
                    "status": receipt.status,
                    "result": receipt.result,
                })),
            )
                .into_response()
        }
        Err(e) => errors::store_error_to_response(e),
    }
}

/// `GET /jobs/:id`: producer polling for job state (and the summary once
/// succeeded).
pub async fn status(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: JobId = match id.parse() {
        Ok(v) => v,
        Err(_) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id")
        }
    };

    match state.store.get_job(id).await {
        Ok(Some(job)) => Json(dto::job_view(&job)).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "no such job"),
        Err(e) => errors::store_error_to_response(e),
    }
}
