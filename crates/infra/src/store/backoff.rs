//! Provider backoff table: provider-wide cool-downs after upstream failures.
//!
//! A provider is *gated* while `until > now`. Setting a backoff overwrites
//! any prior one for the same provider.

use chrono::{DateTime, Utc};
use sqlx::Row;

use super::{fmt_ts, map_sqlx_error, parse_ts, Store, StoreError};

/// A provider currently under backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatedProvider {
    pub provider_id: String,
    pub until: DateTime<Utc>,
    pub reason: String,
}

impl Store {
    /// Gate a provider until `until`. Idempotent per provider; the latest
    /// call wins.
    pub async fn set_backoff(
        &self,
        provider_id: &str,
        until: DateTime<Utc>,
        reason: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO provider_backoff (provider_id, until, reason) VALUES (?1, ?2, ?3)
             ON CONFLICT (provider_id)
             DO UPDATE SET until = excluded.until, reason = excluded.reason",
        )
        .bind(provider_id)
        .bind(fmt_ts(until))
        .bind(reason)
        .execute(self.pool())
        .await
        .map_err(|e| map_sqlx_error("set_backoff", e))?;
        Ok(())
    }

    /// Providers gated at `now`, ordered by id.
    pub async fn list_gated_providers(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<GatedProvider>, StoreError> {
        let rows = sqlx::query(
            "SELECT provider_id, until, reason FROM provider_backoff
             WHERE until > ?1 ORDER BY provider_id ASC",
        )
        .bind(fmt_ts(now))
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_sqlx_error("list_gated_providers", e))?;

        let mut gated = Vec::with_capacity(rows.len());
        for row in rows {
            let until: String = row
                .try_get("until")
                .map_err(|e| map_sqlx_error("list_gated_providers", e))?;
            gated.push(GatedProvider {
                provider_id: row
                    .try_get("provider_id")
                    .map_err(|e| map_sqlx_error("list_gated_providers", e))?,
                until: parse_ts(&until)?,
                reason: row
                    .try_get("reason")
                    .map_err(|e| map_sqlx_error("list_gated_providers", e))?,
            });
        }
        Ok(gated)
    }
}
