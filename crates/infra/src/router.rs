//! Candidate routing: walk the active (provider, model) pairs in priority
//! order, consume quota, invoke the upstream, classify failures.
//!
//! Quota policy: the minute and day counters are charged before the upstream
//! call and never refunded on rejection. The counters model attempts against
//! the provider in the window, not successes.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use briefly_ai::{build_prompt, ErrorKind, GeneratorFactory};

use crate::store::{JobRecord, RatePeriod, Store, StoreError};

/// Why a dispatch produced no summary.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no active model candidates")]
    NoCandidates,

    #[error("all candidates failed: {last_error}")]
    AllCandidatesFailed { last_error: String },

    #[error("input rejected by upstream: {message}")]
    InputInvalid { message: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Routes one job's content through the candidate list.
pub struct Router {
    store: Store,
    generators: Arc<dyn GeneratorFactory>,
}

impl Router {
    pub fn new(store: Store, generators: Arc<dyn GeneratorFactory>) -> Self {
        Self { store, generators }
    }

    /// Dispatch `content` to the first candidate able to take it.
    ///
    /// Candidates are tried strictly in order; each one is gated through the
    /// minute and day counters before its upstream call. Every upstream
    /// invocation (and only those) appends an attempt row.
    pub async fn dispatch(
        &self,
        job: &JobRecord,
        content: &str,
        max_tokens: u32,
    ) -> Result<String, DispatchError> {
        let candidates = self.store.list_active_models(Utc::now()).await?;
        if candidates.is_empty() {
            return Err(DispatchError::NoCandidates);
        }

        let prompt = build_prompt(content);
        let mut last_error: Option<String> = None;

        for candidate in candidates {
            let minute = self
                .store
                .try_consume(&candidate.id, RatePeriod::Minute, Utc::now())
                .await?;
            if !minute.allowed {
                debug!(
                    model = %candidate.id,
                    used = minute.used,
                    limit = minute.limit,
                    "minute quota exhausted, skipping candidate"
                );
                continue;
            }

            let day = self
                .store
                .try_consume(&candidate.id, RatePeriod::Day, Utc::now())
                .await?;
            if !day.allowed {
                debug!(
                    model = %candidate.id,
                    used = day.used,
                    limit = day.limit,
                    "day quota exhausted, skipping candidate"
                );
                continue;
            }

            let started_at = Utc::now();
            let generator = self.generators.for_credential(&candidate.credential);

            match generator
                .generate(&candidate.model_name, &prompt, max_tokens)
                .await
            {
                Ok(text) => {
                    let summary = text.trim().to_string();
                    if summary.is_empty() {
                        // An empty completion burns the candidate, not the job.
                        self.store
                            .increment_attempt(
                                job.id,
                                Some(&candidate.provider_id),
                                Some(&candidate.id),
                                false,
                                Some("empty completion"),
                                started_at,
                            )
                            .await?;
                        last_error = Some(format!("{}: empty completion", candidate.id));
                        continue;
                    }

                    self.store
                        .increment_attempt(
                            job.id,
                            Some(&candidate.provider_id),
                            Some(&candidate.id),
                            true,
                            None,
                            started_at,
                        )
                        .await?;
                    info!(job = %job.id, model = %candidate.id, "summary produced");
                    return Ok(summary);
                }
                Err(err) => {
                    self.store
                        .increment_attempt(
                            job.id,
                            Some(&candidate.provider_id),
                            Some(&candidate.id),
                            false,
                            Some(&err.message),
                            started_at,
                        )
                        .await?;

                    if let Some(cooldown) = err.kind.backoff() {
                        let until =
                            Utc::now() + chrono::Duration::from_std(cooldown).unwrap_or_default();
                        self.store
                            .set_backoff(&candidate.provider_id, until, err.kind.as_str())
                            .await?;
                        warn!(
                            provider = %candidate.provider_id,
                            model = %candidate.id,
                            kind = err.kind.as_str(),
                            "provider gated after upstream failure"
                        );
                    }

                    if err.kind == ErrorKind::InputInvalid {
                        return Err(DispatchError::InputInvalid {
                            message: err.message,
                        });
                    }

                    last_error = Some(format!("{}: {}", candidate.id, err));
                }
            }
        }

        Err(DispatchError::AllCandidatesFailed {
            last_error: last_error
                .unwrap_or_else(|| "every candidate was skipped by rate limits".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use briefly_ai::{GenerateError, ScriptedGenerator, StaticGeneratorFactory};
    use chrono::Duration;
    use serde_json::json;

    use super::*;

    async fn two_provider_store() -> Store {
        let store = Store::open_in_memory().await.unwrap();
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
        store
    }

    async fn queued_job(store: &Store) -> JobRecord {
        store
            .enqueue("f", &json!({"content": "text"}), 1, 3)
            .await
            .unwrap();
        store.claim_next("w").await.unwrap().unwrap()
    }

    fn router(store: &Store, generator: Arc<ScriptedGenerator>) -> Router {
        Router::new(
            store.clone(),
            Arc::new(StaticGeneratorFactory(generator)),
        )
    }

    #[tokio::test]
    async fn first_candidate_success_short_circuits() {
        let store = two_provider_store().await;
        let job = queued_job(&store).await;
        let generator = Arc::new(ScriptedGenerator::new(vec![Ok("  SUMMARY  ".to_string())]));

        let summary = router(&store, Arc::clone(&generator))
            .dispatch(&job, "text", 256)
            .await
            .unwrap();

        assert_eq!(summary, "SUMMARY");
        assert_eq!(generator.calls(), vec!["alpha-model"]);

        let attempts = store.list_attempts(job.id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert!(attempts[0].success);
        assert_eq!(attempts[0].provider_id.as_deref(), Some("alpha"));
        assert_eq!(attempts[0].model_id.as_deref(), Some("alpha/m"));
    }

    #[tokio::test]
    async fn failover_records_both_attempts_and_gates_the_loser() {
        let store = two_provider_store().await;
        let job = queued_job(&store).await;
        let generator = Arc::new(ScriptedGenerator::new(vec![
            Err(GenerateError::classify(Some(503), "service unavailable")),
            Ok("OK".to_string()),
        ]));

        let summary = router(&store, Arc::clone(&generator))
            .dispatch(&job, "text", 256)
            .await
            .unwrap();
        assert_eq!(summary, "OK");
        assert_eq!(generator.calls(), vec!["alpha-model", "beta-model"]);

        let attempts = store.list_attempts(job.id).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert!(!attempts[0].success);
        assert_eq!(attempts[0].provider_id.as_deref(), Some("alpha"));
        assert!(attempts[1].success);
        assert_eq!(attempts[1].provider_id.as_deref(), Some("beta"));

        // Transient failure gates alpha for 15 minutes.
        let now = Utc::now();
        let gated = store.list_gated_providers(now).await.unwrap();
        assert_eq!(gated.len(), 1);
        assert_eq!(gated[0].provider_id, "alpha");
        assert_eq!(gated[0].reason, "transient");
        assert!(gated[0].until > now + Duration::minutes(14));
        assert!(gated[0].until < now + Duration::minutes(16));
    }

    #[tokio::test]
    async fn empty_registry_yields_no_candidates() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .enqueue("f", &json!({"content": "x"}), 1, 3)
            .await
            .unwrap();
        let job = store.claim_next("w").await.unwrap().unwrap();
        let generator = Arc::new(ScriptedGenerator::new(vec![]));

        let err = router(&store, generator)
            .dispatch(&job, "x", 256)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoCandidates));
    }

    #[tokio::test]
    async fn rate_limited_candidates_are_skipped_without_upstream_calls() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .upsert_provider("alpha", "Alpha", "key", 1, true)
            .await
            .unwrap();
        store
            .upsert_model("alpha/m", "alpha", "m", 1, 100, true)
            .await
            .unwrap();
        let job = queued_job(&store).await;

        // Burn the only minute slot before dispatching.
        store
            .try_consume("alpha/m", RatePeriod::Minute, Utc::now())
            .await
            .unwrap();

        let generator = Arc::new(ScriptedGenerator::new(vec![Ok("unused".to_string())]));
        let err = router(&store, Arc::clone(&generator))
            .dispatch(&job, "x", 256)
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::AllCandidatesFailed { .. }));
        assert!(generator.calls().is_empty());
        assert!(store.list_attempts(job.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn input_invalid_is_fatal_to_the_job() {
        let store = two_provider_store().await;
        let job = queued_job(&store).await;
        let generator = Arc::new(ScriptedGenerator::new(vec![Err(GenerateError::new(
            ErrorKind::InputInvalid,
            "malformed prompt",
        ))]));

        let err = router(&store, Arc::clone(&generator))
            .dispatch(&job, "x", 256)
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::InputInvalid { .. }));
        // The second candidate is never consulted.
        assert_eq!(generator.calls(), vec!["alpha-model"]);
        // No backoff for this class.
        assert!(store.list_gated_providers(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_completion_falls_through_to_the_next_candidate() {
        let store = two_provider_store().await;
        let job = queued_job(&store).await;
        let generator = Arc::new(ScriptedGenerator::new(vec![
            Ok("   ".to_string()),
            Ok("real summary".to_string()),
        ]));

        let summary = router(&store, Arc::clone(&generator))
            .dispatch(&job, "x", 256)
            .await
            .unwrap();

        assert_eq!(summary, "real summary");
        let attempts = store.list_attempts(job.id).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert!(!attempts[0].success);
        assert_eq!(attempts[0].error.as_deref(), Some("empty completion"));
        // Empty completions earn no provider gate.
        assert!(store.list_gated_providers(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn quota_is_charged_even_when_the_upstream_rejects() {
        let store = two_provider_store().await;
        let job = queued_job(&store).await;
        let generator = Arc::new(ScriptedGenerator::new(vec![
            Err(GenerateError::classify(Some(500), "boom")),
            Ok("OK".to_string()),
        ]));

        router(&store, generator).dispatch(&job, "x", 256).await.unwrap();

        // Alpha's failed call still consumed its minute slot.
        let decision = store
            .try_consume("alpha/m", RatePeriod::Minute, Utc::now())
            .await
            .unwrap();
        assert_eq!(decision.used, 2);
    }
}
