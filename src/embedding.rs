//! Embedding provider construction and network-backed providers.
//!
//! Concrete [`EmbeddingProvider`] implementations selected by
//! `embedding.provider`:
//! - **`hash`**: [`HashingEmbedder`] from the core crate, offline and
//!   deterministic.
//! - **`openai`**: [`OpenAIProvider`], `POST /v1/embeddings` with batching,
//!   retry and backoff. Reads `OPENAI_API_KEY`.
//! - **`ollama`**: [`OllamaProvider`], `POST /api/embed` on a local Ollama.
//! - **`disabled`**: no provider; the semantic source is not registered.
//!
//! # Retry Strategy
//!
//! Network providers retry transient errors with exponential backoff:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! Indexing is the only caller that embeds many texts. The request path
//! embeds one query window, bounded by the semantic source's timeout.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use context_daemon_core::embedding::{EmbeddingProvider, HashingEmbedder};
use context_daemon_core::ContextError;

use crate::config::EmbeddingConfig;

const DEFAULT_HASH_DIMS: usize = 256;
const DEFAULT_OPENAI_URL: &str = "https://api.openai.com";
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Build the configured provider, or `None` when embeddings are disabled.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Option<Arc<dyn EmbeddingProvider>>> {
    let provider: Arc<dyn EmbeddingProvider> = match config.provider.as_str() {
        "disabled" => return Ok(None),
        "hash" => Arc::new(HashingEmbedder::new(
            config.dims.unwrap_or(DEFAULT_HASH_DIMS),
        )),
        "openai" => Arc::new(OpenAIProvider::new(config)?),
        "ollama" => Arc::new(OllamaProvider::new(config)?),
        other => bail!("Unknown embedding provider: {}", other),
    };
    Ok(Some(provider))
}

/// Shared request loop for HTTP embedding backends.
struct HttpEmbedder {
    client: reqwest::Client,
    label: &'static str,
    max_retries: u32,
}

impl HttpEmbedder {
    fn new(config: &EmbeddingConfig, label: &'static str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            label,
            max_retries: config.max_retries,
        })
    }

    async fn post_with_retry(
        &self,
        request: impl Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    ) -> Result<serde_json::Value> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tracing::debug!(
                    provider = self.label,
                    attempt,
                    ?delay,
                    "retrying embedding request"
                );
                tokio::time::sleep(delay).await;
            }

            match request(&self.client).send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response.json().await?);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(anyhow::anyhow!(
                            "{} API error {}: {}",
                            self.label,
                            status,
                            body_text
                        ));
                        continue;
                    }

                    bail!("{} API error {}: {}", self.label, status, body_text);
                }
                Err(e) => {
                    last_err = Some(anyhow::anyhow!("{} connection error: {}", self.label, e));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| anyhow::anyhow!("{} embedding failed after retries", self.label)))
    }
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API (or any compatible endpoint set
/// through `embedding.url`).
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    url: String,
    api_key: String,
    http: HttpEmbedder,
}

impl OpenAIProvider {
    /// # Errors
    ///
    /// Fails if `model` or `dims` is not set in config, or if
    /// `OPENAI_API_KEY` is not in the environment.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string());

        Ok(Self {
            model,
            dims,
            url,
            api_key,
            http: HttpEmbedder::new(config, "OpenAI")?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ContextError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let endpoint = format!("{}/v1/embeddings", self.url.trim_end_matches('/'));
        let json = self
            .http
            .post_with_retry(|client| {
                client
                    .post(&endpoint)
                    .header("Authorization", format!("Bearer {}", self.api_key))
                    .json(&body)
            })
            .await
            .map_err(|e| ContextError::Embedding(e.to_string()))?;
        parse_openai_response(&json).map_err(|e| ContextError::Embedding(e.to_string()))
    }
}

/// Extract `data[].embedding`, ordered by each entry's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map_or(position, |i| i as usize);
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;
        indexed.push((index, to_f32_vec(embedding)));
    }
    indexed.sort_by_key(|(index, _)| *index);

    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance.
///
/// Requires Ollama to be running with an embedding model pulled
/// (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaProvider {
    model: String,
    dims: usize,
    url: String,
    http: HttpEmbedder,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());

        Ok(Self {
            model,
            dims,
            url,
            http: HttpEmbedder::new(config, "Ollama")?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ContextError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let endpoint = format!("{}/api/embed", self.url.trim_end_matches('/'));
        let json = self
            .http
            .post_with_retry(|client| client.post(&endpoint).json(&body))
            .await
            .map_err(|e| {
                ContextError::Embedding(format!("{} (is Ollama running at {}?)", e, self.url))
            })?;
        parse_ollama_response(&json).map_err(|e| ContextError::Embedding(e.to_string()))
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings array"))?;

    embeddings
        .iter()
        .map(|embedding| {
            embedding
                .as_array()
                .map(|values| to_f32_vec(values))
                .ok_or_else(|| {
                    anyhow::anyhow!("Invalid Ollama response: embedding is not an array")
                })
        })
        .collect()
}

fn to_f32_vec(values: &[serde_json::Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}
