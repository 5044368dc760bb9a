//! The generation seam and its error taxonomy.
//!
//! Adapters (not their callers) own the mapping from upstream status codes
//! and message text to an [`ErrorKind`]. Consumers only branch on the kind.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Classification of an upstream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Quota or rate-limit rejection from the provider.
    Quota,
    /// Authentication/authorization rejection.
    Auth,
    /// Transient server failure (5xx, service unavailable, network timeout).
    Transient,
    /// The prompt itself was rejected as malformed. Fatal to the job.
    InputInvalid,
    /// The provider answered with empty text. Fatal to the candidate only.
    Empty,
    /// Anything else. Logged, no backoff.
    Other,
}

impl ErrorKind {
    /// Provider-wide cool-down this failure class earns, if any.
    pub fn backoff(&self) -> Option<Duration> {
        match self {
            ErrorKind::Quota => Some(Duration::from_secs(60 * 60)),
            ErrorKind::Auth => Some(Duration::from_secs(240 * 60)),
            ErrorKind::Transient => Some(Duration::from_secs(15 * 60)),
            ErrorKind::InputInvalid | ErrorKind::Empty | ErrorKind::Other => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Quota => "quota",
            ErrorKind::Auth => "auth",
            ErrorKind::Transient => "transient",
            ErrorKind::InputInvalid => "input_invalid",
            ErrorKind::Empty => "empty",
            ErrorKind::Other => "other",
        }
    }
}

/// Error returned by a [`Generator`].
#[derive(Debug, Clone, Error)]
#[error("{}: {message}", .kind.as_str())]
pub struct GenerateError {
    pub kind: ErrorKind,
    /// HTTP status from the upstream, when one was received.
    pub status: Option<u16>,
    pub message: String,
}

impl GenerateError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
        }
    }

    /// Classify an upstream rejection from its status code and message body.
    ///
    /// Status codes win over message substrings; substring matching is
    /// case-insensitive.
    pub fn classify(status: Option<u16>, message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = classify_kind(status, &message);
        Self {
            kind,
            status,
            message,
        }
    }
}

fn classify_kind(status: Option<u16>, message: &str) -> ErrorKind {
    if let Some(code) = status {
        match code {
            429 => return ErrorKind::Quota,
            401 | 403 => return ErrorKind::Auth,
            500 | 502 | 503 | 504 => return ErrorKind::Transient,
            _ => {}
        }
    }

    let lower = message.to_lowercase();
    if lower.contains("quota") || lower.contains("rate limit") {
        ErrorKind::Quota
    } else if lower.contains("auth") || lower.contains("api key") || lower.contains("unauthorized")
    {
        ErrorKind::Auth
    } else if lower.contains("service unavailable")
        || lower.contains("timed out")
        || lower.contains("timeout")
    {
        ErrorKind::Transient
    } else if lower.contains("invalid prompt") || lower.contains("malformed prompt") {
        ErrorKind::InputInvalid
    } else {
        ErrorKind::Other
    }
}

/// A client able to produce a completion from an upstream model.
///
/// Implementations must be safe for concurrent use from any worker task.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Produce a completion for `prompt` on `model_name`, bounded by
    /// `max_tokens` output tokens.
    async fn generate(
        &self,
        model_name: &str,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<String, GenerateError>;
}

/// Hands out a [`Generator`] bound to a provider credential.
///
/// Implementations cache per-credential client state and must be safe for
/// concurrent use.
pub trait GeneratorFactory: Send + Sync {
    fn for_credential(&self, credential: &str) -> Arc<dyn Generator>;
}

/// Scripted generator for tests/dev.
///
/// Pops canned outcomes in submission order; once the script is exhausted
/// every further call fails. Records the model names it was invoked with.
#[derive(Default)]
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<String, GenerateError>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new(outcomes: Vec<Result<String, GenerateError>>) -> Self {
        Self {
            script: Mutex::new(outcomes.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Model names seen so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(
        &self,
        model_name: &str,
        _prompt: &str,
        _max_tokens: u32,
    ) -> Result<String, GenerateError> {
        self.calls.lock().unwrap().push(model_name.to_string());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(GenerateError::new(ErrorKind::Other, "script exhausted")))
    }
}

/// Factory returning the same generator for every credential (tests/dev).
pub struct StaticGeneratorFactory(pub Arc<dyn Generator>);

impl GeneratorFactory for StaticGeneratorFactory {
    fn for_credential(&self, _credential: &str) -> Arc<dyn Generator> {
        Arc::clone(&self.0)
    }
}
