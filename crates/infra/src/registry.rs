//! Registry seeding: pushes the configured providers and models into the
//! store at startup.
//!
//! Seeding is idempotent; a restart with new configuration re-seeds via the
//! same upserts. There is no hot reload.

use tracing::info;

use crate::config::ProviderConfig;
use crate::store::{Store, StoreError};

/// Upsert every configured provider and its model set.
pub async fn seed_registry(
    store: &Store,
    providers: &[ProviderConfig],
) -> Result<(), StoreError> {
    for provider in providers {
        let outcome = store
            .upsert_provider(
                &provider.id,
                &provider.name,
                &provider.credential,
                provider.priority,
                provider.enabled,
            )
            .await?;
        info!(
            provider = %provider.id,
            priority = provider.priority,
            enabled = provider.enabled,
            outcome = ?outcome,
            "seeded provider"
        );

        for model in &provider.models {
            let outcome = store
                .upsert_model(
                    &model.id,
                    &provider.id,
                    &model.model_name,
                    model.per_minute_limit,
                    model.per_day_limit,
                    model.enabled,
                )
                .await?;
            info!(
                model = %model.id,
                per_minute = model.per_minute_limit,
                per_day = model.per_day_limit,
                enabled = model.enabled,
                outcome = ?outcome,
                "seeded model"
            );
        }
    }
    Ok(())
}
