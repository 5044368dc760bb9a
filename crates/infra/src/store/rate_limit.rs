//! Durable per-(model, window) rate counters.
//!
//! `try_consume` is a single transaction: the limit is resolved from the
//! model row and the counter is bumped with a conditional upsert, so no
//! reader ever observes a counter above its limit and two calls in the same
//! window can never jointly cross it.

use chrono::{DateTime, Utc};

use super::types::{RateDecision, RatePeriod};
use super::{fmt_ts, map_sqlx_error, Store, StoreError};

/// Floor `now` to the start of its UTC window.
pub(crate) fn window_start(now: DateTime<Utc>, period: RatePeriod) -> DateTime<Utc> {
    let secs = period.seconds();
    let floored = now.timestamp().div_euclid(secs) * secs;
    DateTime::from_timestamp(floored, 0).expect("floored unix timestamp is in range")
}

impl Store {
    /// Check-and-increment the counter for `(model_id, period)` at `now`.
    ///
    /// Refusal leaves no state change behind.
    pub async fn try_consume(
        &self,
        model_id: &str,
        period: RatePeriod,
        now: DateTime<Utc>,
    ) -> Result<RateDecision, StoreError> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error("try_consume", e))?;

        let limit_sql = match period {
            RatePeriod::Minute => "SELECT per_minute_limit FROM models WHERE id = ?1",
            RatePeriod::Day => "SELECT per_day_limit FROM models WHERE id = ?1",
        };
        let limit: Option<i64> = sqlx::query_scalar(limit_sql)
            .bind(model_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("try_consume", e))?;
        let limit = limit.ok_or_else(|| StoreError::UnknownModel(model_id.to_string()))?;

        if limit < 1 {
            return Ok(RateDecision {
                allowed: false,
                used: 0,
                limit,
            });
        }

        let window = fmt_ts(window_start(now, period));
        let used: Option<i64> = sqlx::query_scalar(
            "INSERT INTO rate_counters (model_id, period, window_start, used_count)
             VALUES (?1, ?2, ?3, 1)
             ON CONFLICT (model_id, period, window_start)
             DO UPDATE SET used_count = used_count + 1 WHERE used_count < ?4
             RETURNING used_count",
        )
        .bind(model_id)
        .bind(period.as_str())
        .bind(&window)
        .bind(limit)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("try_consume", e))?;

        match used {
            Some(used) => {
                tx.commit()
                    .await
                    .map_err(|e| map_sqlx_error("try_consume", e))?;
                Ok(RateDecision {
                    allowed: true,
                    used,
                    limit,
                })
            }
            None => {
                // Conditional update matched nothing: the window is full.
                let used: Option<i64> = sqlx::query_scalar(
                    "SELECT used_count FROM rate_counters
                     WHERE model_id = ?1 AND period = ?2 AND window_start = ?3",
                )
                .bind(model_id)
                .bind(period.as_str())
                .bind(&window)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("try_consume", e))?;

                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("try_consume", e))?;
                Ok(RateDecision {
                    allowed: false,
                    used: used.unwrap_or(limit),
                    limit,
                })
            }
        }
    }

    /// Drop counter rows older than twice their period. Expired windows are
    /// dead weight; nothing reads them again.
    pub async fn prune_rate_windows(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let minute_cutoff = fmt_ts(now - chrono::Duration::seconds(2 * RatePeriod::Minute.seconds()));
        let day_cutoff = fmt_ts(now - chrono::Duration::seconds(2 * RatePeriod::Day.seconds()));

        let done = sqlx::query(
            "DELETE FROM rate_counters
             WHERE (period = 'minute' AND window_start < ?1)
                OR (period = 'day' AND window_start < ?2)",
        )
        .bind(&minute_cutoff)
        .bind(&day_cutoff)
        .execute(self.pool())
        .await
        .map_err(|e| map_sqlx_error("prune_rate_windows", e))?;

        Ok(done.rows_affected())
    }
}
