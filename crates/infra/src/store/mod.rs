//! SQLite-backed store: the single owner of all persisted queue state.
//!
//! Every mutating operation is a single transaction (or a single atomic
//! statement) against the pool. Connections are opened with WAL journaling,
//! full fsync on commit, enforced foreign keys, and a 5 s busy timeout, so
//! readers never block writers and short write contention is retried inside
//! the driver.
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC text; with a constant
//! width, lexicographic comparison in SQL equals chronological comparison.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::SqlitePool;
use thiserror::Error;

use briefly_core::JobId;

pub mod backoff;
pub mod jobs;
pub mod providers;
pub mod rate_limit;
pub mod types;

pub use backoff::GatedProvider;
pub use types::{
    ActiveModel, AttemptRecord, EnqueueReceipt, EnqueueStatus, JobRecord, JobState, QueueStats,
    RateDecision, RatePeriod, ReviveSummary, UpsertOutcome,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Store error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("{op} failed: {message}")]
    Database { op: &'static str, message: String },
}

pub(crate) fn map_sqlx_error(op: &'static str, e: sqlx::Error) -> StoreError {
    StoreError::Database {
        op,
        message: e.to_string(),
    }
}

pub(crate) fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Handle to the durable store.
///
/// Cheap to clone; all clones share one connection pool.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `path` and ensure the
    /// schema exists.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("open", e))?;

        init_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory store for tests/dev.
    ///
    /// A single pooled connection keeps every handle on the same database.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("open_in_memory", e))?;

        init_schema(&pool).await?;
        Ok(Self { pool })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Idempotent schema bootstrap.
///
/// The partial unique index on `(dedupe_key, content_hash)` over active
/// states is load-bearing for deduplication: concurrent enqueues of the same
/// work race on it instead of on a read-then-insert window.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS providers (
        id          TEXT PRIMARY KEY,
        name        TEXT NOT NULL,
        credential  TEXT NOT NULL,
        priority    INTEGER NOT NULL,
        enabled     INTEGER NOT NULL,
        created_at  TEXT NOT NULL,
        updated_at  TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS models (
        id                TEXT PRIMARY KEY,
        provider_id       TEXT NOT NULL REFERENCES providers(id),
        model_name        TEXT NOT NULL,
        per_minute_limit  INTEGER NOT NULL,
        per_day_limit     INTEGER NOT NULL,
        enabled           INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_models_enabled ON models (enabled, provider_id)",
    "CREATE TABLE IF NOT EXISTS jobs (
        id            TEXT PRIMARY KEY,
        file_id       TEXT NOT NULL,
        dedupe_key    TEXT NOT NULL,
        content_hash  TEXT NOT NULL,
        payload       TEXT NOT NULL,
        priority      INTEGER NOT NULL,
        state         TEXT NOT NULL,
        attempts      INTEGER NOT NULL DEFAULT 0,
        max_attempts  INTEGER NOT NULL,
        error         TEXT,
        result        TEXT,
        created_at    TEXT NOT NULL,
        updated_at    TEXT NOT NULL,
        locked_at     TEXT,
        worker_id     TEXT
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_active_dedupe
        ON jobs (dedupe_key, content_hash)
        WHERE state IN ('queued', 'processing')",
    "CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs (state)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs (priority DESC, created_at ASC)",
    "CREATE TABLE IF NOT EXISTS job_attempts (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id       TEXT NOT NULL REFERENCES jobs(id),
        attempt_no   INTEGER NOT NULL,
        provider_id  TEXT,
        model_id     TEXT,
        started_at   TEXT NOT NULL,
        finished_at  TEXT,
        success      INTEGER NOT NULL,
        error        TEXT
    )",
    "CREATE TABLE IF NOT EXISTS rate_counters (
        model_id      TEXT NOT NULL,
        period        TEXT NOT NULL,
        window_start  TEXT NOT NULL,
        used_count    INTEGER NOT NULL,
        PRIMARY KEY (model_id, period, window_start)
    )",
    "CREATE TABLE IF NOT EXISTS provider_backoff (
        provider_id  TEXT PRIMARY KEY,
        until        TEXT NOT NULL,
        reason       TEXT NOT NULL
    )",
];

async fn init_schema(pool: &SqlitePool) -> Result<(), StoreError> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error("init_schema", e))?;
    }
    Ok(())
}

/// Render a timestamp in the store's canonical fixed-width form.
pub(crate) fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{}': {}", s, e)))
}

pub(crate) fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    s.as_deref().map(parse_ts).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_sort_lexicographically() {
        let earlier = Utc::now();
        let later = earlier + chrono::Duration::milliseconds(1);
        assert!(fmt_ts(earlier) < fmt_ts(later));
    }

    #[test]
    fn timestamp_round_trip() {
        let now = Utc::now();
        let parsed = parse_ts(&fmt_ts(now)).unwrap();
        // Fixed microsecond precision loses sub-microsecond detail only.
        assert!((now - parsed).num_microseconds().unwrap().abs() < 1);
    }

    #[tokio::test]
    async fn schema_bootstrap_is_idempotent() {
        let store = Store::open_in_memory().await.unwrap();
        init_schema(store.pool()).await.unwrap();
    }
}
