use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ContextKitError;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub repo: RepoConfig,
    #[serde(default)]
    pub embedding: ProviderConfig,
    #[serde(default)]
    pub chat: ProviderConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RepoConfig {
    pub path: PathBuf,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".context/.rag")
}

impl RepoConfig {
    /// Location of the persisted vector index for this repository.
    pub fn index_path(&self) -> PathBuf {
        self.path.join(&self.state_dir).join(INDEX_FILE_NAME)
    }
}

pub const INDEX_FILE_NAME: &str = "vector-index.json";

/// Provider settings shared by the `[embedding]` and `[chat]` sections.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ProviderConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Model name (Ollama) or the underlying model of an Azure deployment.
    #[serde(default)]
    pub model: Option<String>,
    /// Azure deployment name.
    #[serde(default)]
    pub deployment: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Explicit API key; takes priority over stored and environment keys.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_true")]
    pub use_stored_credentials: bool,
    #[serde(default = "default_true")]
    pub use_environment_vars: bool,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            deployment: None,
            endpoint: None,
            api_version: default_api_version(),
            api_key: None,
            use_stored_credentials: true,
            use_environment_vars: true,
            temperature: default_temperature(),
            max_tokens: None,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_api_version() -> String {
    "2024-02-15-preview".to_string()
}
fn default_true() -> bool {
    true
}
fn default_temperature() -> f32 {
    0.7
}

impl ProviderConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn is_azure(&self) -> bool {
        self.provider == "azure"
    }

    /// The name the provider routes on: the deployment for Azure, the model otherwise.
    pub fn target_name(&self) -> Option<&str> {
        if self.is_azure() {
            self.deployment.as_deref().or(self.model.as_deref())
        } else {
            self.model.as_deref()
        }
    }

    pub fn endpoint_or_default(&self) -> String {
        match (&self.endpoint, self.provider.as_str()) {
            (Some(e), _) => e.trim_end_matches('/').to_string(),
            (None, "ollama") => "http://localhost:11434".to_string(),
            (None, _) => String::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct IndexingConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

fn default_batch_size() -> usize {
    4
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    90
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_cap_ms() -> u64 {
    10_000
}
fn default_jitter_ms() -> u64 {
    300
}

impl IndexingConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_limit")]
    pub default_limit: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            default_limit: default_limit(),
        }
    }
}

fn default_top_k() -> usize {
    4
}
fn default_limit() -> usize {
    10
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.indexing.batch_size == 0 {
        anyhow::bail!("indexing.batch_size must be > 0");
    }
    if config.indexing.timeout_secs == 0 {
        anyhow::bail!("indexing.timeout_secs must be > 0");
    }
    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }

    for (section, provider) in [("embedding", &config.embedding), ("chat", &config.chat)] {
        match provider.provider.as_str() {
            "disabled" | "azure" | "ollama" => {}
            other => anyhow::bail!(
                "Unknown {} provider: '{}'. Must be disabled, azure, or ollama.",
                section,
                other
            ),
        }
        if provider.is_enabled() && provider.target_name().is_none() {
            anyhow::bail!(
                "{}.model (or {}.deployment for azure) must be specified when provider is '{}'",
                section,
                section,
                provider.provider
            );
        }
        if provider.is_azure() && provider.endpoint.is_none() {
            anyhow::bail!("{}.endpoint is required for azure", section);
        }
    }

    Ok(config)
}

/// Reject an Azure setup whose embedding deployment is the chat deployment.
///
/// Runs before any network call so a misconfigured deployment never
/// produces silently wrong vectors.
pub fn check_deployment_collision(
    embedding: &ProviderConfig,
    chat: &ProviderConfig,
) -> Result<(), ContextKitError> {
    if !embedding.is_azure() {
        return Ok(());
    }
    let embed_name = embedding.target_name().ok_or_else(|| {
        ContextKitError::Configuration("embedding deployment is not configured".to_string())
    })?;
    if chat.is_azure() {
        if let Some(chat_name) = chat.target_name() {
            if chat_name == embed_name {
                return Err(ContextKitError::Configuration(format!(
                    "embedding deployment '{}' is the same as the chat deployment; \
                     configure a dedicated embedding deployment (e.g. text-embedding-3-small)",
                    embed_name
                )));
            }
        }
    }
    Ok(())
}
