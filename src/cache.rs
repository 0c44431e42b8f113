//! Provider construction and a process-wide client cache.
//!
//! Clients are keyed by `(provider, endpoint, model, api_version)`, so two
//! services pointed at the same deployment share one HTTP client. Keys are
//! resolved through [`credentials`](crate::credentials) when a client is
//! first built; [`ModelCache::clear`] drops everything, which is how a
//! credential change takes effect.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;

use crate::chat::{ChatModel, OpenAICompatibleChat};
use crate::config::ProviderConfig;
use crate::credentials::{resolve_api_key, CredentialStore, KeyRequest};
use crate::embedding::{AzureOpenAIEmbeddings, EmbeddingProvider, OllamaEmbeddings};
use crate::error::{ContextKitError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub provider: String,
    pub endpoint: String,
    pub model: String,
    pub api_version: String,
}

impl CacheKey {
    pub fn for_config(config: &ProviderConfig) -> Self {
        Self {
            provider: config.provider.clone(),
            endpoint: config.endpoint_or_default(),
            model: config.target_name().unwrap_or_default().to_string(),
            api_version: config.api_version.clone(),
        }
    }
}

#[derive(Default)]
pub struct ModelCache {
    embedders: Mutex<HashMap<CacheKey, Arc<dyn EmbeddingProvider>>>,
    chat_models: Mutex<HashMap<CacheKey, Arc<dyn ChatModel>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ModelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached embedding client for `config`, building it on first use.
    pub fn embedding_provider(
        &self,
        config: &ProviderConfig,
        store: &dyn CredentialStore,
        timeout: Duration,
    ) -> Result<Arc<dyn EmbeddingProvider>> {
        let key = CacheKey::for_config(config);
        let mut map = lock(&self.embedders);
        if let Some(p) = map.get(&key) {
            return Ok(Arc::clone(p));
        }
        let provider = create_embedding_provider(config, store, timeout)?;
        debug!(provider = %key.provider, model = %key.model, "cached new embedding client");
        map.insert(key, Arc::clone(&provider));
        Ok(provider)
    }

    /// Return the cached chat client for `config`, building it on first use.
    pub fn chat_model(
        &self,
        config: &ProviderConfig,
        store: &dyn CredentialStore,
        timeout: Duration,
    ) -> Result<Arc<dyn ChatModel>> {
        let key = CacheKey::for_config(config);
        let mut map = lock(&self.chat_models);
        if let Some(m) = map.get(&key) {
            return Ok(Arc::clone(m));
        }
        let model = create_chat_model(config, store, timeout)?;
        debug!(provider = %key.provider, model = %key.model, "cached new chat client");
        map.insert(key, Arc::clone(&model));
        Ok(model)
    }

    pub fn len(&self) -> usize {
        lock(&self.embedders).len() + lock(&self.chat_models).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached client.
    pub fn clear(&self) {
        lock(&self.embedders).clear();
        lock(&self.chat_models).clear();
        debug!("model cache cleared");
    }
}

fn key_for(config: &ProviderConfig, store: &dyn CredentialStore) -> Option<String> {
    resolve_api_key(
        &KeyRequest {
            provider: &config.provider,
            explicit_key: config.api_key.as_deref(),
            use_stored_credentials: config.use_stored_credentials,
            use_environment_vars: config.use_environment_vars,
        },
        store,
    )
}

/// Build an embedding client for `config` without caching.
pub fn create_embedding_provider(
    config: &ProviderConfig,
    store: &dyn CredentialStore,
    timeout: Duration,
) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "azure" => {
            let api_key = key_for(config, store).ok_or_else(|| {
                ContextKitError::Configuration(
                    "no API key found for azure embeddings (set embedding.api_key or AZURE_OPENAI_API_KEY)"
                        .to_string(),
                )
            })?;
            Ok(Arc::new(AzureOpenAIEmbeddings::new(config, api_key, timeout)?))
        }
        "ollama" => Ok(Arc::new(OllamaEmbeddings::new(config, timeout)?)),
        "disabled" => Err(ContextKitError::Configuration(
            "embedding provider is disabled; set [embedding] provider in the config".to_string(),
        )),
        other => Err(ContextKitError::Configuration(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

/// Build a chat client for `config` without caching.
pub fn create_chat_model(
    config: &ProviderConfig,
    store: &dyn CredentialStore,
    timeout: Duration,
) -> Result<Arc<dyn ChatModel>> {
    match config.provider.as_str() {
        "azure" | "ollama" => Ok(Arc::new(OpenAICompatibleChat::new(
            config,
            key_for(config, store),
            timeout,
        )?)),
        "disabled" => Err(ContextKitError::Configuration(
            "chat provider is disabled; set [chat] provider in the config".to_string(),
        )),
        other => Err(ContextKitError::Configuration(format!(
            "unknown chat provider: {}",
            other
        ))),
    }
}
