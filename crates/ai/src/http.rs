//! HTTP generator speaking the OpenAI-compatible chat completions API.
//!
//! Providers in the registry differ by credential and model set, not wire
//! format; they all share one endpoint shape. Client instances are cached
//! per credential and shared across worker tasks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::generate::{ErrorKind, GenerateError, Generator, GeneratorFactory};

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageOwned,
}

#[derive(Deserialize)]
struct ChatMessageOwned {
    content: String,
}

/// A [`Generator`] bound to one endpoint and one credential.
pub struct HttpGenerator {
    endpoint: String,
    credential: String,
    client: Client,
}

impl HttpGenerator {
    pub fn new(endpoint: impl Into<String>, credential: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client construction only fails on invalid TLS config");

        Self {
            endpoint: endpoint.into(),
            credential: credential.into(),
            client,
        }
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(
        &self,
        model_name: &str,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<String, GenerateError> {
        let body = ChatRequest {
            model: model_name,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens,
        };

        let res = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.credential)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GenerateError::new(ErrorKind::Transient, "network timeout")
                } else {
                    GenerateError::new(ErrorKind::Transient, format!("transport error: {}", e))
                }
            })?;

        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            let message = if text.trim().is_empty() {
                format!("upstream returned status {}", status.as_u16())
            } else {
                text
            };
            return Err(GenerateError::classify(Some(status.as_u16()), message));
        }

        let parsed: ChatResponse = res.json().await.map_err(|e| {
            GenerateError::new(ErrorKind::Other, format!("malformed response body: {}", e))
        })?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();

        let text = text.trim();
        if text.is_empty() {
            return Err(GenerateError::new(ErrorKind::Empty, "empty completion"));
        }

        Ok(text.to_string())
    }
}

/// Factory caching one [`HttpGenerator`] per credential.
pub struct HttpGeneratorFactory {
    endpoint: String,
    timeout: Duration,
    clients: Mutex<HashMap<String, Arc<HttpGenerator>>>,
}

impl HttpGeneratorFactory {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }
}

impl GeneratorFactory for HttpGeneratorFactory {
    fn for_credential(&self, credential: &str) -> Arc<dyn Generator> {
        let mut clients = self.clients.lock().unwrap();
        let generator = clients.entry(credential.to_string()).or_insert_with(|| {
            Arc::new(HttpGenerator::new(
                self.endpoint.clone(),
                credential,
                self.timeout,
            ))
        });
        Arc::clone(generator) as Arc<dyn Generator>
    }
}
