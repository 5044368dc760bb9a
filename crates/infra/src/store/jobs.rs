//! Job queue operations: enqueue with dedup, atomic claim, completion,
//! attempt accounting, and stale-claim recovery.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use briefly_core::{content_hash, JobId};

use super::types::{
    AttemptRecord, EnqueueReceipt, EnqueueStatus, JobRecord, JobState, QueueStats, ReviveSummary,
};
use super::{fmt_ts, is_unique_violation, map_sqlx_error, parse_opt_ts, parse_ts, Store, StoreError};

const JOB_COLUMNS: &str = "id, file_id, dedupe_key, content_hash, payload, priority, state, \
     attempts, max_attempts, error, result, created_at, updated_at, locked_at, worker_id";

impl Store {
    /// Submit work, deduplicating against live and completed twins.
    ///
    /// A concurrent inserter may win the race on the partial unique index;
    /// the loser re-reads and reports the winner's row.
    pub async fn enqueue(
        &self,
        file_id: &str,
        payload: &Value,
        priority: i64,
        max_attempts: i64,
    ) -> Result<EnqueueReceipt, StoreError> {
        let hash = content_hash(payload);

        if let Some(receipt) = self.find_duplicate(file_id, &hash).await? {
            return Ok(receipt);
        }

        let id = JobId::new();
        let now = fmt_ts(Utc::now());
        let sql = format!(
            "INSERT INTO jobs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, NULL, NULL, ?9, ?9, NULL, NULL)",
            JOB_COLUMNS
        );
        let inserted = sqlx::query(&sql)
            .bind(id.to_string())
            .bind(file_id)
            .bind(file_id)
            .bind(&hash)
            .bind(payload.to_string())
            .bind(priority)
            .bind(JobState::Queued)
            .bind(max_attempts)
            .bind(&now)
            .execute(self.pool())
            .await;

        match inserted {
            Ok(_) => Ok(EnqueueReceipt {
                job_id: id,
                status: EnqueueStatus::Enqueued,
                result: None,
            }),
            Err(e) if is_unique_violation(&e) => {
                // Lost the insert race; the winner's row answers this submission.
                match self.find_duplicate(file_id, &hash).await? {
                    Some(receipt) => Ok(receipt),
                    None => Err(map_sqlx_error("enqueue", e)),
                }
            }
            Err(e) => Err(map_sqlx_error("enqueue", e)),
        }
    }

    async fn find_duplicate(
        &self,
        dedupe_key: &str,
        hash: &str,
    ) -> Result<Option<EnqueueReceipt>, StoreError> {
        let row = sqlx::query(
            "SELECT id, state, result FROM jobs
             WHERE dedupe_key = ?1 AND content_hash = ?2
               AND state IN ('queued', 'processing', 'succeeded')
             ORDER BY updated_at DESC, id DESC
             LIMIT 1",
        )
        .bind(dedupe_key)
        .bind(hash)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| map_sqlx_error("find_duplicate", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let id: String = row.try_get("id").map_err(|e| map_sqlx_error("find_duplicate", e))?;
        let job_id: JobId = id
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("bad job id '{}'", id)))?;
        let state: JobState = row
            .try_get("state")
            .map_err(|e| map_sqlx_error("find_duplicate", e))?;

        let receipt = match state {
            JobState::Succeeded => EnqueueReceipt {
                job_id,
                status: EnqueueStatus::AlreadyCompleted,
                result: row
                    .try_get("result")
                    .map_err(|e| map_sqlx_error("find_duplicate", e))?,
            },
            _ => EnqueueReceipt {
                job_id,
                status: EnqueueStatus::AlreadyQueued,
                result: None,
            },
        };
        Ok(Some(receipt))
    }

    /// Atomically claim the highest-priority, oldest queued job.
    ///
    /// The `state = 'queued'` compare inside a single UPDATE makes the
    /// transition a compare-and-swap: at most one caller gets any given job.
    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let now = fmt_ts(Utc::now());
        let sql = format!(
            "UPDATE jobs
             SET state = 'processing', locked_at = ?1, worker_id = ?2, updated_at = ?1
             WHERE id = (
                 SELECT id FROM jobs WHERE state = 'queued'
                 ORDER BY priority DESC, created_at ASC, id ASC
                 LIMIT 1
             ) AND state = 'queued'
             RETURNING {}",
            JOB_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(&now)
            .bind(worker_id)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;

        row.map(row_to_job).transpose()
    }

    /// Settle a claimed job: `succeeded`, `dead`, `failed`, or back to
    /// `queued` for a retry. Lock fields are cleared; `attempts` and
    /// `max_attempts` are preserved.
    pub async fn complete_job(
        &self,
        job_id: JobId,
        outcome: JobState,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        debug_assert!(outcome != JobState::Processing);

        let done = sqlx::query(
            "UPDATE jobs
             SET state = ?2, result = ?3, error = ?4, locked_at = NULL, worker_id = NULL,
                 updated_at = ?5
             WHERE id = ?1",
        )
        .bind(job_id.to_string())
        .bind(outcome)
        .bind(result)
        .bind(error)
        .bind(fmt_ts(Utc::now()))
        .execute(self.pool())
        .await
        .map_err(|e| map_sqlx_error("complete_job", e))?;

        if done.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(job_id));
        }
        Ok(())
    }

    /// Bump the job's attempt counter and append the audit row in one
    /// transaction. Returns the new attempt number.
    pub async fn increment_attempt(
        &self,
        job_id: JobId,
        provider_id: Option<&str>,
        model_id: Option<&str>,
        success: bool,
        error: Option<&str>,
        started_at: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error("increment_attempt", e))?;

        let row = sqlx::query(
            "UPDATE jobs SET attempts = attempts + 1, updated_at = ?2 WHERE id = ?1
             RETURNING attempts",
        )
        .bind(job_id.to_string())
        .bind(fmt_ts(Utc::now()))
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("increment_attempt", e))?;

        let attempt_no: i64 = row
            .ok_or(StoreError::JobNotFound(job_id))?
            .try_get("attempts")
            .map_err(|e| map_sqlx_error("increment_attempt", e))?;

        sqlx::query(
            "INSERT INTO job_attempts
                 (job_id, attempt_no, provider_id, model_id, started_at, finished_at, success, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(job_id.to_string())
        .bind(attempt_no)
        .bind(provider_id)
        .bind(model_id)
        .bind(fmt_ts(started_at))
        .bind(fmt_ts(Utc::now()))
        .bind(success)
        .bind(error)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("increment_attempt", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("increment_attempt", e))?;

        Ok(attempt_no)
    }

    /// Attempt audit trail for one job, oldest first.
    pub async fn list_attempts(&self, job_id: JobId) -> Result<Vec<AttemptRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT attempt_no, provider_id, model_id, started_at, finished_at, success, error
             FROM job_attempts WHERE job_id = ?1 ORDER BY attempt_no ASC",
        )
        .bind(job_id.to_string())
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_sqlx_error("list_attempts", e))?;

        let mut attempts = Vec::with_capacity(rows.len());
        for row in rows {
            let started_at: String = row
                .try_get("started_at")
                .map_err(|e| map_sqlx_error("list_attempts", e))?;
            let finished_at: Option<String> = row
                .try_get("finished_at")
                .map_err(|e| map_sqlx_error("list_attempts", e))?;
            attempts.push(AttemptRecord {
                attempt_no: row
                    .try_get("attempt_no")
                    .map_err(|e| map_sqlx_error("list_attempts", e))?,
                provider_id: row
                    .try_get("provider_id")
                    .map_err(|e| map_sqlx_error("list_attempts", e))?,
                model_id: row
                    .try_get("model_id")
                    .map_err(|e| map_sqlx_error("list_attempts", e))?,
                started_at: parse_ts(&started_at)?,
                finished_at: parse_opt_ts(finished_at)?,
                success: row
                    .try_get("success")
                    .map_err(|e| map_sqlx_error("list_attempts", e))?,
                error: row
                    .try_get("error")
                    .map_err(|e| map_sqlx_error("list_attempts", e))?,
            });
        }
        Ok(attempts)
    }

    /// Break locks held longer than `timeout`: such claims belong to crashed
    /// workers. Returns the number of jobs moved to `failed`.
    pub async fn recover_stale(&self, timeout: Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(timeout).unwrap_or_default();

        let done = sqlx::query(
            "UPDATE jobs
             SET state = 'failed', error = 'timed out', locked_at = NULL, worker_id = NULL,
                 updated_at = ?1
             WHERE state = 'processing' AND locked_at < ?2",
        )
        .bind(fmt_ts(Utc::now()))
        .bind(fmt_ts(cutoff))
        .execute(self.pool())
        .await
        .map_err(|e| map_sqlx_error("recover_stale", e))?;

        Ok(done.rows_affected())
    }

    /// Move `failed` jobs back to `queued` while attempts remain, `dead`
    /// otherwise. Rows shadowed by an active duplicate stay `failed` so the
    /// dedupe index is never violated.
    pub async fn revive_failed(&self) -> Result<ReviveSummary, StoreError> {
        let now = fmt_ts(Utc::now());
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error("revive_failed", e))?;

        let dead = sqlx::query(
            "UPDATE jobs SET state = 'dead', updated_at = ?1
             WHERE state = 'failed' AND attempts >= max_attempts",
        )
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("revive_failed", e))?;

        let requeued = sqlx::query(
            "UPDATE jobs SET state = 'queued', updated_at = ?1
             WHERE state = 'failed' AND attempts < max_attempts
               AND NOT EXISTS (
                   SELECT 1 FROM jobs live
                   WHERE live.dedupe_key = jobs.dedupe_key
                     AND live.content_hash = jobs.content_hash
                     AND live.state IN ('queued', 'processing')
               )",
        )
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("revive_failed", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("revive_failed", e))?;

        Ok(ReviveSummary {
            requeued: requeued.rows_affected(),
            dead: dead.rows_affected(),
        })
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let sql = format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(job_id.to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.map(row_to_job).transpose()
    }

    /// Per-state job counts.
    pub async fn queue_stats(&self) -> Result<QueueStats, StoreError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs GROUP BY state")
            .fetch_all(self.pool())
            .await
            .map_err(|e| map_sqlx_error("queue_stats", e))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let state: JobState = row
                .try_get("state")
                .map_err(|e| map_sqlx_error("queue_stats", e))?;
            let n: i64 = row
                .try_get("n")
                .map_err(|e| map_sqlx_error("queue_stats", e))?;
            let n = n.max(0) as u64;
            match state {
                JobState::Queued => stats.queued = n,
                JobState::Processing => stats.processing = n,
                JobState::Succeeded => stats.succeeded = n,
                JobState::Failed => stats.failed = n,
                JobState::Dead => stats.dead = n,
            }
        }
        Ok(stats)
    }
}

fn row_to_job(row: SqliteRow) -> Result<JobRecord, StoreError> {
    let get = map_sqlx_error;

    let id: String = row.try_get("id").map_err(|e| get("decode_job", e))?;
    let payload: String = row.try_get("payload").map_err(|e| get("decode_job", e))?;
    let created_at: String = row.try_get("created_at").map_err(|e| get("decode_job", e))?;
    let updated_at: String = row.try_get("updated_at").map_err(|e| get("decode_job", e))?;
    let locked_at: Option<String> = row.try_get("locked_at").map_err(|e| get("decode_job", e))?;

    Ok(JobRecord {
        id: id
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("bad job id '{}'", id)))?,
        file_id: row.try_get("file_id").map_err(|e| get("decode_job", e))?,
        dedupe_key: row.try_get("dedupe_key").map_err(|e| get("decode_job", e))?,
        content_hash: row
            .try_get("content_hash")
            .map_err(|e| get("decode_job", e))?,
        payload: serde_json::from_str(&payload)
            .map_err(|e| StoreError::Corrupt(format!("bad job payload: {}", e)))?,
        priority: row.try_get("priority").map_err(|e| get("decode_job", e))?,
        state: row.try_get("state").map_err(|e| get("decode_job", e))?,
        attempts: row.try_get("attempts").map_err(|e| get("decode_job", e))?,
        max_attempts: row
            .try_get("max_attempts")
            .map_err(|e| get("decode_job", e))?,
        error: row.try_get("error").map_err(|e| get("decode_job", e))?,
        result: row.try_get("result").map_err(|e| get("decode_job", e))?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
        locked_at: parse_opt_ts(locked_at)?,
        worker_id: row.try_get("worker_id").map_err(|e| get("decode_job", e))?,
    })
}
