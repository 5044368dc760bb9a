//! Provider/model catalog: upserts and the active-candidate snapshot the
//! router walks.

use chrono::{DateTime, Utc};
use sqlx::Row;

use super::types::{ActiveModel, UpsertOutcome};
use super::{fmt_ts, map_sqlx_error, Store, StoreError};

impl Store {
    /// Insert or replace a provider row. Re-seeding with identical values is
    /// a no-op apart from `updated_at`.
    pub async fn upsert_provider(
        &self,
        id: &str,
        name: &str,
        credential: &str,
        priority: i64,
        enabled: bool,
    ) -> Result<UpsertOutcome, StoreError> {
        let now = fmt_ts(Utc::now());
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error("upsert_provider", e))?;

        let updated = sqlx::query(
            "UPDATE providers SET name = ?2, credential = ?3, priority = ?4, enabled = ?5,
                 updated_at = ?6
             WHERE id = ?1",
        )
        .bind(id)
        .bind(name)
        .bind(credential)
        .bind(priority)
        .bind(enabled)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("upsert_provider", e))?;

        let outcome = if updated.rows_affected() > 0 {
            UpsertOutcome::Updated
        } else {
            sqlx::query(
                "INSERT INTO providers (id, name, credential, priority, enabled, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            )
            .bind(id)
            .bind(name)
            .bind(credential)
            .bind(priority)
            .bind(enabled)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("upsert_provider", e))?;
            UpsertOutcome::Inserted
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("upsert_provider", e))?;
        Ok(outcome)
    }

    /// Insert or replace a model row. Fails when `provider_id` is unknown.
    pub async fn upsert_model(
        &self,
        id: &str,
        provider_id: &str,
        model_name: &str,
        per_minute_limit: i64,
        per_day_limit: i64,
        enabled: bool,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error("upsert_model", e))?;

        let provider = sqlx::query("SELECT 1 FROM providers WHERE id = ?1")
            .bind(provider_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("upsert_model", e))?;
        if provider.is_none() {
            return Err(StoreError::UnknownProvider(provider_id.to_string()));
        }

        let updated = sqlx::query(
            "UPDATE models SET provider_id = ?2, model_name = ?3, per_minute_limit = ?4,
                 per_day_limit = ?5, enabled = ?6
             WHERE id = ?1",
        )
        .bind(id)
        .bind(provider_id)
        .bind(model_name)
        .bind(per_minute_limit)
        .bind(per_day_limit)
        .bind(enabled)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("upsert_model", e))?;

        let outcome = if updated.rows_affected() > 0 {
            UpsertOutcome::Updated
        } else {
            sqlx::query(
                "INSERT INTO models (id, provider_id, model_name, per_minute_limit, per_day_limit, enabled)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .bind(id)
            .bind(provider_id)
            .bind(model_name)
            .bind(per_minute_limit)
            .bind(per_day_limit)
            .bind(enabled)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("upsert_model", e))?;
            UpsertOutcome::Inserted
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("upsert_model", e))?;
        Ok(outcome)
    }

    /// Snapshot of dispatchable candidates: enabled models of enabled,
    /// ungated providers, ordered by provider priority then model id.
    pub async fn list_active_models(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ActiveModel>, StoreError> {
        let rows = sqlx::query(
            "SELECT m.id, m.provider_id, m.model_name, m.per_minute_limit, m.per_day_limit,
                    p.name AS provider_name, p.credential, p.priority
             FROM models m
             JOIN providers p ON p.id = m.provider_id
             WHERE m.enabled = 1 AND p.enabled = 1
               AND NOT EXISTS (
                   SELECT 1 FROM provider_backoff b
                   WHERE b.provider_id = p.id AND b.until > ?1
               )
             ORDER BY p.priority ASC, m.id ASC",
        )
        .bind(fmt_ts(now))
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_sqlx_error("list_active_models", e))?;

        let mut models = Vec::with_capacity(rows.len());
        for row in rows {
            models.push(ActiveModel {
                id: row.try_get("id").map_err(|e| map_sqlx_error("list_active_models", e))?,
                provider_id: row
                    .try_get("provider_id")
                    .map_err(|e| map_sqlx_error("list_active_models", e))?,
                model_name: row
                    .try_get("model_name")
                    .map_err(|e| map_sqlx_error("list_active_models", e))?,
                per_minute_limit: row
                    .try_get("per_minute_limit")
                    .map_err(|e| map_sqlx_error("list_active_models", e))?,
                per_day_limit: row
                    .try_get("per_day_limit")
                    .map_err(|e| map_sqlx_error("list_active_models", e))?,
                provider_name: row
                    .try_get("provider_name")
                    .map_err(|e| map_sqlx_error("list_active_models", e))?,
                credential: row
                    .try_get("credential")
                    .map_err(|e| map_sqlx_error("list_active_models", e))?,
                priority: row
                    .try_get("priority")
                    .map_err(|e| map_sqlx_error("list_active_models", e))?,
            });
        }
        Ok(models)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    async fn store() -> Store {
        Store::open_in_memory().await.unwrap()
    }

    async fn seed_two_providers(store: &Store) {
        store
            .upsert_provider("alpha", "Alpha", "key-a", 1, true)
            .await
            .unwrap();
        store
            .upsert_provider("beta", "Beta", "key-b", 2, true)
            .await
            .unwrap();
        store
            .upsert_model("alpha/m", "alpha", "alpha-model", 10, 100, true)
            .await
            .unwrap();
        store
            .upsert_model("beta/m", "beta", "beta-model", 10, 100, true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn upsert_reports_insert_then_update() {
        let store = store().await;

        let first = store
            .upsert_provider("alpha", "Alpha", "key", 1, true)
            .await
            .unwrap();
        let second = store
            .upsert_provider("alpha", "Alpha", "key", 1, true)
            .await
            .unwrap();
        assert_eq!(first, UpsertOutcome::Inserted);
        assert_eq!(second, UpsertOutcome::Updated);

        let first = store
            .upsert_model("alpha/m", "alpha", "m", 5, 50, true)
            .await
            .unwrap();
        let second = store
            .upsert_model("alpha/m", "alpha", "m", 5, 50, true)
            .await
            .unwrap();
        assert_eq!(first, UpsertOutcome::Inserted);
        assert_eq!(second, UpsertOutcome::Updated);

        // Idempotent re-seed leaves a single candidate.
        let models = store.list_active_models(Utc::now()).await.unwrap();
        assert_eq!(models.len(), 1);
    }

    #[tokio::test]
    async fn upsert_model_requires_known_provider() {
        let store = store().await;
        let err = store
            .upsert_model("ghost/m", "ghost", "m", 5, 50, true)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownProvider(p) if p == "ghost"));
    }

    #[tokio::test]
    async fn active_models_ordered_by_provider_priority() {
        let store = store().await;
        seed_two_providers(&store).await;

        let models = store.list_active_models(Utc::now()).await.unwrap();
        let ids: Vec<&str> = models.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha/m", "beta/m"]);
        assert_eq!(models[0].credential, "key-a");
        assert_eq!(models[0].provider_name, "Alpha");
    }

    #[tokio::test]
    async fn disabled_rows_are_filtered() {
        let store = store().await;
        seed_two_providers(&store).await;

        store
            .upsert_provider("alpha", "Alpha", "key-a", 1, false)
            .await
            .unwrap();
        store
            .upsert_model("beta/m", "beta", "beta-model", 10, 100, false)
            .await
            .unwrap();

        assert!(store.list_active_models(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn gated_providers_are_filtered_until_expiry() {
        let store = store().await;
        seed_two_providers(&store).await;

        let now = Utc::now();
        store
            .set_backoff("alpha", now + Duration::minutes(15), "transient")
            .await
            .unwrap();

        let during = store.list_active_models(now).await.unwrap();
        let ids: Vec<&str> = during.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["beta/m"]);

        let after = store
            .list_active_models(now + Duration::minutes(16))
            .await
            .unwrap();
        assert_eq!(after.len(), 2);
    }
}
