//! Result delivery: the authenticated callback to the producer.
//!
//! The worker reports through the [`ResultSink`] seam so tests can
//! substitute an in-memory fake for the HTTP client.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("callback rejected with status {0}")]
    Rejected(u16),

    #[error("callback transport error: {0}")]
    Transport(String),
}

/// Metadata attached to a delivered summary.
#[derive(Debug, Clone)]
pub struct SummaryMetadata {
    pub content_blocks: usize,
    pub total_words: usize,
    pub main_content_words: usize,
    pub processing_time_ms: u64,
    pub processed_at: DateTime<Utc>,
}

/// Sink for finished summaries.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn deliver(
        &self,
        file_id: &str,
        summary: &str,
        metadata: &SummaryMetadata,
    ) -> Result<(), CallbackError>;
}

/// HTTP callback client signing each delivery with HMAC-SHA256.
///
/// Header: `x-internal-auth: <timestamp_ms>.<hex_hmac>` where the MAC covers
/// `timestamp_ms + "." + body`.
pub struct CallbackClient {
    url: String,
    secret: String,
    client: reqwest::Client,
}

impl CallbackClient {
    pub fn new(url: impl Into<String>, secret: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client construction only fails on invalid TLS config");

        Self {
            url: url.into(),
            secret: secret.into(),
            client,
        }
    }

    /// Render the callback body. Key casing is part of the wire contract.
    pub fn body(file_id: &str, summary: &str, metadata: &SummaryMetadata) -> String {
        serde_json::json!({
            "fileId": file_id,
            "summary": summary,
            "metadata": {
                "contentBlocks": metadata.content_blocks,
                "totalWords": metadata.total_words,
                "mainContentWords": metadata.main_content_words,
                "processingTimeMs": metadata.processing_time_ms,
                "processedAt": metadata
                    .processed_at
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
            },
        })
        .to_string()
    }

    /// Hex HMAC-SHA256 over `timestamp_ms + "." + body`.
    pub fn sign(secret: &str, timestamp_ms: i64, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .expect("hmac accepts keys of any length");
        mac.update(format!("{}.{}", timestamp_ms, body).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

#[async_trait]
impl ResultSink for CallbackClient {
    async fn deliver(
        &self,
        file_id: &str,
        summary: &str,
        metadata: &SummaryMetadata,
    ) -> Result<(), CallbackError> {
        let body = Self::body(file_id, summary, metadata);
        let timestamp_ms = Utc::now().timestamp_millis();
        let auth = format!(
            "{}.{}",
            timestamp_ms,
            Self::sign(&self.secret, timestamp_ms, &body)
        );

        let res = self
            .client
            .post(&self.url)
            .header("content-type", "application/json")
            .header("x-internal-auth", auth)
            .body(body)
            .send()
            .await
            .map_err(|e| CallbackError::Transport(e.to_string()))?;

        if !res.status().is_success() {
            return Err(CallbackError::Rejected(res.status().as_u16()));
        }

        debug!(file_id, "summary delivered");
        Ok(())
    }
}

/// In-memory sink for tests/dev.
#[derive(Default)]
pub struct InMemorySink {
    deliveries: Mutex<Vec<(String, String, SummaryMetadata)>>,
    failures_left: AtomicUsize,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink whose first `n` deliveries fail with a transport error.
    pub fn failing(n: usize) -> Self {
        let sink = Self::default();
        sink.failures_left.store(n, Ordering::SeqCst);
        sink
    }

    pub fn deliveries(&self) -> Vec<(String, String, SummaryMetadata)> {
        self.deliveries.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResultSink for InMemorySink {
    async fn deliver(
        &self,
        file_id: &str,
        summary: &str,
        metadata: &SummaryMetadata,
    ) -> Result<(), CallbackError> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CallbackError::Transport("injected failure".to_string()));
        }

        self.deliveries.lock().unwrap().push((
            file_id.to_string(),
            summary.to_string(),
            metadata.clone(),
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> SummaryMetadata {
        SummaryMetadata {
            content_blocks: 3,
            total_words: 120,
            main_content_words: 100,
            processing_time_ms: 42,
            processed_at: Utc::now(),
        }
    }

    #[test]
    fn body_uses_the_wire_key_casing() {
        let body = CallbackClient::body("f-1", "S", &metadata());
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();

        assert_eq!(parsed["fileId"], "f-1");
        assert_eq!(parsed["summary"], "S");
        assert_eq!(parsed["metadata"]["contentBlocks"], 3);
        assert_eq!(parsed["metadata"]["totalWords"], 120);
        assert_eq!(parsed["metadata"]["mainContentWords"], 100);
        assert_eq!(parsed["metadata"]["processingTimeMs"], 42);
        assert!(parsed["metadata"]["processedAt"].is_string());
    }

    #[test]
    fn signature_depends_on_secret_timestamp_and_body() {
        let base = CallbackClient::sign("secret-a", 1000, "body");

        assert_eq!(base, CallbackClient::sign("secret-a", 1000, "body"));
        assert_ne!(base, CallbackClient::sign("secret-b", 1000, "body"));
        assert_ne!(base, CallbackClient::sign("secret-a", 1001, "body"));
        assert_ne!(base, CallbackClient::sign("secret-a", 1000, "other"));

        assert_eq!(base.len(), 64);
        assert!(base.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn in_memory_sink_records_after_injected_failures() {
        let sink = InMemorySink::failing(1);

        assert!(sink.deliver("f", "s", &metadata()).await.is_err());
        assert!(sink.deliver("f", "s", &metadata()).await.is_ok());
        assert_eq!(sink.deliveries().len(), 1);
    }
}
