//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`AzureOpenAIEmbeddings`]**: deployment-scoped Azure OpenAI endpoint, `api-key` header.
//! - **[`OllamaEmbeddings`]**: a local OpenAI-compatible endpoint (Ollama), no key.
//!
//! Clients make exactly one HTTP request per call. Batching, per-attempt
//! deadlines, and retry/backoff belong to the indexer
//! (see [`index`](crate::index)), so every failure is returned as a typed
//! [`ProviderError`] for it to classify.

use async_trait::async_trait;
use std::time::Duration;

use crate::config::ProviderConfig;
use crate::error::{ContextKitError, ProviderError};

/// Trait for embedding providers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider identifier (e.g. `"azure"`, `"ollama"`).
    fn provider_name(&self) -> &str;

    /// Model identifier recorded in the index (deployment name for Azure).
    fn model_name(&self) -> &str;

    /// Embed a batch of texts. The output is in input order, one vector per text.
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;

    /// Embed a single query text.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let results = self.embed_documents(&[text.to_string()]).await?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::transport("Empty embedding response"))
    }
}

// ============ Azure OpenAI ============

/// Embedding provider for an Azure OpenAI deployment.
///
/// Calls `POST {endpoint}/openai/deployments/{deployment}/embeddings?api-version=...`.
pub struct AzureOpenAIEmbeddings {
    client: reqwest::Client,
    endpoint: String,
    deployment: String,
    api_version: String,
    api_key: String,
}

impl AzureOpenAIEmbeddings {
    pub fn new(
        config: &ProviderConfig,
        api_key: String,
        timeout: Duration,
    ) -> Result<Self, ContextKitError> {
        let deployment = config.target_name().ok_or_else(|| {
            ContextKitError::Configuration("embedding.deployment required for azure".to_string())
        })?;
        let endpoint = config.endpoint_or_default();
        if endpoint.is_empty() {
            return Err(ContextKitError::Configuration(
                "embedding.endpoint required for azure".to_string(),
            ));
        }
        Ok(Self {
            client: build_client(timeout)?,
            endpoint,
            deployment: deployment.to_string(),
            api_version: config.api_version.clone(),
            api_key,
        })
    }

    fn url(&self) -> String {
        format!(
            "{}/openai/deployments/{}/embeddings?api-version={}",
            self.endpoint, self.deployment, self.api_version
        )
    }
}

#[async_trait]
impl EmbeddingProvider for AzureOpenAIEmbeddings {
    fn provider_name(&self) -> &str {
        "azure"
    }

    fn model_name(&self) -> &str {
        &self.deployment
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let body = serde_json::json!({ "input": texts });
        let request = self
            .client
            .post(self.url())
            .header("api-key", &self.api_key)
            .json(&body);
        send_embedding_request(request, texts.len()).await
    }
}

// ============ Ollama (OpenAI-compatible) ============

/// Embedding provider for a local Ollama instance via its OpenAI-compatible API.
///
/// Calls `POST {endpoint}/v1/embeddings` (default endpoint `http://localhost:11434`).
pub struct OllamaEmbeddings {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl OllamaEmbeddings {
    pub fn new(config: &ProviderConfig, timeout: Duration) -> Result<Self, ContextKitError> {
        let model = config.model.clone().ok_or_else(|| {
            ContextKitError::Configuration("embedding.model required for ollama".to_string())
        })?;
        Ok(Self {
            client: build_client(timeout)?,
            endpoint: config.endpoint_or_default(),
            model,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbeddings {
    fn provider_name(&self) -> &str {
        "ollama"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let request = self
            .client
            .post(format!("{}/v1/embeddings", self.endpoint))
            .json(&body);
        send_embedding_request(request, texts.len()).await.map_err(|mut e| {
            if e.status.is_none() && !e.timed_out {
                e.message = format!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.endpoint, e.message
                );
            }
            e
        })
    }
}

pub(crate) fn build_client(timeout: Duration) -> Result<reqwest::Client, ContextKitError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ContextKitError::Configuration(format!("failed to build HTTP client: {}", e)))
}

async fn send_embedding_request(
    request: reqwest::RequestBuilder,
    expected: usize,
) -> Result<Vec<Vec<f32>>, ProviderError> {
    let response = request.send().await?;
    let status = response.status();

    if !status.is_success() {
        let body_text = response.text().await.unwrap_or_default();
        return Err(ProviderError::http(status.as_u16(), body_text));
    }

    let json: serde_json::Value = response.json().await?;
    let embeddings = parse_openai_response(&json)?;
    if embeddings.len() != expected {
        return Err(ProviderError::transport(format!(
            "embedding response returned {} vectors for {} inputs",
            embeddings.len(),
            expected
        )));
    }
    Ok(embeddings)
}

/// Parse an OpenAI-shaped embeddings response.
///
/// Entries are re-ordered by their `index` field when present so the
/// output always lines up with the request's input order.
pub fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, ProviderError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| ProviderError::transport("Invalid embeddings response: missing data array"))?;

    let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());

    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| ProviderError::transport("Invalid embeddings response: missing embedding"))?;

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| {
                v.as_f64()
                    .map(|f| f as f32)
                    .ok_or_else(|| ProviderError::transport("non-numeric embedding value"))
            })
            .collect::<Result<_, _>>()?;

        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, vec));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}
