//! OpenAI-compatible HTTP providers
//!
//! Thin drivers behind [`EmbeddingProvider`] and [`ChatProvider`]. The
//! gateway owns retries, deadlines, and concurrency; these only translate
//! one call into one HTTP exchange. Any endpoint speaking the
//! `/embeddings` and `/chat/completions` shapes works, which is what keeps
//! the in-cluster model and a secondary hosted endpoint interchangeable.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

use super::gateway::{ChatProvider, EmbeddingProvider};

/// Client-level timeout, slightly above the gateway's longest deadline
const HTTP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(35);

// ============================================================================
// SHARED CONFIG
// ============================================================================

/// Connection settings for one endpoint
#[derive(Debug, Clone)]
pub struct RemoteOracleConfig {
    /// Base URL, e.g. `https://api.example.com/v1`
    pub base_url: String,
    /// Bearer token, if the endpoint needs one
    pub api_key: Option<String>,
    /// Model name passed through in each request
    pub model: String,
}

fn build_client() -> Result<Client> {
    Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| CoreError::Init(format!("failed to build HTTP client: {}", e)))
}

// ============================================================================
// EMBEDDINGS
// ============================================================================

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: [&'a str; 1],
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingsDatum>,
}

#[derive(Deserialize)]
struct EmbeddingsDatum {
    embedding: Vec<f32>,
}

/// `/embeddings` driver
pub struct RemoteEmbeddingProvider {
    client: Client,
    config: RemoteOracleConfig,
}

impl RemoteEmbeddingProvider {
    /// Build a provider for one embeddings endpoint
    pub fn new(config: RemoteOracleConfig) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            config,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for RemoteEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut request = self
            .client
            .post(format!("{}/embeddings", self.config.base_url))
            .json(&EmbeddingsRequest {
                model: &self.config.model,
                input: [text],
            });
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CoreError::OracleUnavailable(format!("embeddings request: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::OracleUnavailable(format!(
                "embeddings endpoint returned {}: {}",
                status,
                &body[..body.len().min(200)]
            )));
        }

        let parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| CoreError::OracleUnavailable(format!("embeddings response: {}", e)))?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| CoreError::OracleUnavailable("embeddings response was empty".to_string()))
    }
}

// ============================================================================
// CHAT
// ============================================================================

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
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
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

/// `/chat/completions` driver
pub struct RemoteChatProvider {
    client: Client,
    config: RemoteOracleConfig,
}

impl RemoteChatProvider {
    /// Build a provider for one chat endpoint
    pub fn new(config: RemoteOracleConfig) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            config,
        })
    }
}

#[async_trait]
impl ChatProvider for RemoteChatProvider {
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .json(&ChatRequest {
                model: &self.config.model,
                messages: [
                    ChatMessage {
                        role: "system",
                        content: system,
                    },
                    ChatMessage {
                        role: "user",
                        content: user,
                    },
                ],
                // Judging wants determinism, not creativity
                temperature: 0.0,
            });
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CoreError::OracleUnavailable(format!("chat request: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::OracleUnavailable(format!(
                "chat endpoint returned {}: {}",
                status,
                &body[..body.len().min(200)]
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| CoreError::OracleUnavailable(format!("chat response: {}", e)))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| CoreError::OracleUnavailable("chat response had no choices".to_string()))
    }
}
