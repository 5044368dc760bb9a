//! Worker runtime: claim → extract → route → report → ack.
//!
//! A worker owns a stable `worker_id`, claims jobs up to its concurrency,
//! and runs periodic housekeeping (stale-claim recovery, failed-job revival,
//! rate-window pruning). Shutdown stops new claims and drains in-flight
//! jobs; upstream calls are never cancelled mid-flight.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use briefly_ai::{extract_content, token_budget};

use crate::callback::{ResultSink, SummaryMetadata};
use crate::router::{DispatchError, Router};
use crate::store::{JobRecord, JobState, Store};

/// Tuning for one worker instance.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub stale_timeout: Duration,
    pub housekeeping_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval: Duration::from_secs(1),
            stale_timeout: Duration::from_secs(600),
            housekeeping_interval: Duration::from_secs(300),
        }
    }
}

/// Handle to control and join a running worker.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for in-flight jobs to drain.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }
}

/// Single-flight job processor.
pub struct Worker {
    store: Store,
    router: Arc<Router>,
    sink: Arc<dyn ResultSink>,
    settings: WorkerSettings,
    worker_id: String,
}

impl Worker {
    pub fn new(
        store: Store,
        router: Arc<Router>,
        sink: Arc<dyn ResultSink>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            router,
            sink,
            settings,
            worker_id: default_worker_id(),
        }
    }

    /// Override the generated worker id (tests).
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Spawn the claim loop onto the runtime.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(shutdown_rx));
        WorkerHandle {
            shutdown: shutdown_tx,
            join,
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            worker = %self.worker_id,
            concurrency = self.settings.concurrency,
            "worker started"
        );

        let mut active: JoinSet<()> = JoinSet::new();
        // Housekeeping runs once at startup, then on its own cadence.
        let mut next_housekeeping = Instant::now();

        loop {
            while active.try_join_next().is_some() {}

            if *shutdown.borrow() {
                break;
            }

            if Instant::now() >= next_housekeeping {
                self.housekeeping().await;
                next_housekeeping = Instant::now() + self.settings.housekeeping_interval;
            }

            if active.len() >= self.settings.concurrency {
                tokio::select! {
                    _ = active.join_next() => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            match self.store.claim_next(&self.worker_id).await {
                Ok(Some(job)) => {
                    debug!(worker = %self.worker_id, job = %job.id, "claimed job");
                    let task = JobTask {
                        store: self.store.clone(),
                        router: Arc::clone(&self.router),
                        sink: Arc::clone(&self.sink),
                    };
                    active.spawn(async move { task.process(job).await });
                }
                Ok(None) => self.idle(&mut shutdown).await,
                Err(e) => {
                    error!(worker = %self.worker_id, error = %e, "claim failed");
                    self.idle(&mut shutdown).await;
                }
            }
        }

        if !active.is_empty() {
            info!(worker = %self.worker_id, in_flight = active.len(), "draining");
        }
        while active.join_next().await.is_some() {}
        info!(worker = %self.worker_id, "worker stopped");
    }

    async fn idle(&self, shutdown: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = sleep(self.settings.poll_interval) => {}
            _ = shutdown.changed() => {}
        }
    }

    async fn housekeeping(&self) {
        match self.store.recover_stale(self.settings.stale_timeout).await {
            Ok(0) => {}
            Ok(n) => warn!(recovered = n, "recovered stale claims"),
            Err(e) => error!(error = %e, "stale claim recovery failed"),
        }

        match self.store.revive_failed().await {
            Ok(summary) if summary.requeued > 0 || summary.dead > 0 => {
                info!(
                    requeued = summary.requeued,
                    dead = summary.dead,
                    "settled failed jobs"
                );
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "failed-job revival failed"),
        }

        match self.store.prune_rate_windows(Utc::now()).await {
            Ok(0) => {}
            Ok(n) => debug!(pruned = n, "pruned expired rate windows"),
            Err(e) => error!(error = %e, "rate window pruning failed"),
        }
    }
}

/// One claimed job's processing pipeline.
struct JobTask {
    store: Store,
    router: Arc<Router>,
    sink: Arc<dyn ResultSink>,
}

impl JobTask {
    async fn process(&self, job: JobRecord) {
        let started = std::time::Instant::now();

        // Pre-flight: bail before extraction when the registry has nothing
        // to offer. This failure happened before the router ran, so the
        // worker owns its attempt record.
        match self.store.list_active_models(Utc::now()).await {
            Ok(models) if models.is_empty() => {
                self.finish_failure(&job, "no active model candidates", true, true)
                    .await;
                return;
            }
            Ok(_) => {}
            Err(e) => {
                // Leave the job in `processing`; stale recovery will reclaim it.
                error!(job = %job.id, error = %e, "pre-flight candidate check failed");
                return;
            }
        }

        let extracted = extract_content(&job.payload);
        if extracted.is_empty() {
            self.finish_failure(&job, "no extractable content in payload", false, true)
                .await;
            return;
        }
        let budget = token_budget(extracted.main_content_words);

        match self.router.dispatch(&job, &extracted.text, budget).await {
            Ok(summary) => {
                let metadata = SummaryMetadata {
                    content_blocks: extracted.content_blocks,
                    total_words: extracted.total_words,
                    main_content_words: extracted.main_content_words,
                    processing_time_ms: started.elapsed().as_millis() as u64,
                    processed_at: Utc::now(),
                };

                match self.sink.deliver(&job.file_id, &summary, &metadata).await {
                    Ok(()) => {
                        match self
                            .store
                            .complete_job(job.id, JobState::Succeeded, Some(&summary), None)
                            .await
                        {
                            Ok(()) => info!(job = %job.id, "job succeeded"),
                            Err(e) => {
                                error!(job = %job.id, error = %e, "failed to record success")
                            }
                        }
                    }
                    Err(e) => {
                        warn!(job = %job.id, error = %e, "callback delivery failed");
                        self.finish_failure(&job, &format!("callback failed: {}", e), true, false)
                            .await;
                    }
                }
            }
            Err(DispatchError::Store(e)) => {
                // Leave the job in `processing`; stale recovery will reclaim it.
                error!(job = %job.id, error = %e, "dispatch aborted on store error");
            }
            Err(DispatchError::InputInvalid { message }) => {
                self.finish_failure(&job, &format!("input invalid: {}", message), false, false)
                    .await;
            }
            Err(err) => {
                self.finish_failure(&job, &err.to_string(), true, false)
                    .await;
            }
        }
    }

    /// Record a job-level failure and decide between retry and `dead`.
    ///
    /// `count_attempt` is set for failures the router never saw (pre-router);
    /// router-level failures were already counted per upstream invocation.
    async fn finish_failure(&self, job: &JobRecord, error: &str, retryable: bool, count_attempt: bool) {
        let attempts = if count_attempt {
            match self
                .store
                .increment_attempt(job.id, None, None, false, Some(error), Utc::now())
                .await
            {
                Ok(n) => n,
                Err(e) => {
                    error!(job = %job.id, error = %e, "failed to record attempt");
                    return;
                }
            }
        } else {
            match self.store.get_job(job.id).await {
                Ok(Some(current)) => current.attempts,
                Ok(None) => {
                    error!(job = %job.id, "job vanished mid-flight");
                    return;
                }
                Err(e) => {
                    error!(job = %job.id, error = %e, "failed to re-read job");
                    return;
                }
            }
        };

        let outcome = if retryable && attempts < job.max_attempts {
            JobState::Queued
        } else {
            JobState::Dead
        };

        match self
            .store
            .complete_job(job.id, outcome, None, Some(error))
            .await
        {
            Ok(()) => match outcome {
                JobState::Queued => {
                    info!(job = %job.id, attempts, error, "job re-enqueued")
                }
                _ => warn!(job = %job.id, attempts, error, "job dead"),
            },
            Err(e) => error!(job = %job.id, error = %e, "failed to record job failure"),
        }
    }
}

fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
    let pid = std::process::id();
    let start_nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{}-{}-{}", host, pid, start_nanos)
}
