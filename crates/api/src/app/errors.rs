use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use briefly_infra::store::StoreError;

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    match err {
        StoreError::JobNotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", err.to_string()),
        StoreError::UnknownProvider(_) | StoreError::UnknownModel(_) => {
            json_error(StatusCode::BAD_REQUEST, "unknown_reference", err.to_string())
        }
        StoreError::Corrupt(_) | StoreError::Database { .. } => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "store_error",
            err.to_string(),
        ),
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
