//! Row types and enums shared by store operations.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use briefly_core::JobId;

/// Lifecycle state of a job.
///
/// `queued → processing → (succeeded | failed | dead)`. A `failed` job is
/// re-enqueueable; `succeeded` and `dead` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Processing,
    Succeeded,
    Failed,
    Dead,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobState::Queued),
            "processing" => Some(JobState::Processing),
            "succeeded" => Some(JobState::Succeeded),
            "failed" => Some(JobState::Failed),
            "dead" => Some(JobState::Dead),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Dead)
    }
}

impl sqlx::Type<sqlx::Sqlite> for JobState {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <&str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for JobState {
    fn decode(
        value: sqlx::sqlite::SqliteValueRef<'r>,
    ) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<'r, sqlx::Sqlite>>::decode(value)?;
        JobState::parse(s).ok_or_else(|| format!("invalid job state: {}", s).into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for JobState {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        let s = self.as_str();
        <&str as sqlx::Encode<'q, sqlx::Sqlite>>::encode_by_ref(&s, buf)
    }
}

/// A job row.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: JobId,
    pub file_id: String,
    pub dedupe_key: String,
    pub content_hash: String,
    pub payload: Value,
    pub priority: i64,
    pub state: JobState,
    pub attempts: i64,
    pub max_attempts: i64,
    pub error: Option<String>,
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
}

/// Disposition of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueStatus {
    Enqueued,
    AlreadyQueued,
    AlreadyCompleted,
}

/// What the producer gets back from `enqueue`.
#[derive(Debug, Clone)]
pub struct EnqueueReceipt {
    pub job_id: JobId,
    pub status: EnqueueStatus,
    /// Stored summary, present when `status` is `AlreadyCompleted`.
    pub result: Option<String>,
}

/// Rate-limit accounting window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatePeriod {
    Minute,
    Day,
}

impl RatePeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RatePeriod::Minute => "minute",
            RatePeriod::Day => "day",
        }
    }

    pub fn seconds(&self) -> i64 {
        match self {
            RatePeriod::Minute => 60,
            RatePeriod::Day => 86_400,
        }
    }
}

/// Decision from the rate limiter.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    /// Count charged to the window, including this call when allowed.
    pub used: i64,
    pub limit: i64,
}

/// A model joined with the provider fields the router needs.
#[derive(Debug, Clone)]
pub struct ActiveModel {
    pub id: String,
    pub provider_id: String,
    pub model_name: String,
    pub per_minute_limit: i64,
    pub per_day_limit: i64,
    pub provider_name: String,
    pub credential: String,
    pub priority: i64,
}

/// One row of the append-only attempt audit trail.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub attempt_no: i64,
    pub provider_id: Option<String>,
    pub model_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub success: bool,
    pub error: Option<String>,
}

/// Per-state job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: u64,
    pub processing: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub dead: u64,
}

/// Whether an upsert created or replaced a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Result of moving `failed` jobs back into circulation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReviveSummary {
    pub requeued: u64,
    pub dead: u64,
}
