use serde::Deserialize;
use serde_json::{json, Value};

use briefly_infra::store::JobRecord;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub file_id: String,
    pub payload: Value,
    pub priority: Option<i64>,
    pub max_attempts: Option<i64>,
}

// -------------------------
// Response views
// -------------------------

/// Producer-facing view of a job row. Raw payloads and lock bookkeeping stay
/// internal.
pub fn job_view(job: &JobRecord) -> Value {
    json!({
        "id": job.id.to_string(),
        "file_id": job.file_id,
        "state": job.state,
        "priority": job.priority,
        "attempts": job.attempts,
        "max_attempts": job.max_attempts,
        "error": job.error,
        "result": job.result,
        "created_at": job.created_at.to_rfc3339(),
        "updated_at": job.updated_at.to_rfc3339(),
    })
}
