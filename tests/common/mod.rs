//! Stub providers and repository fixtures shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use context_kit::chat::{ChatChunk, ChatMessage, ChatModel, ChunkStream};
use context_kit::config::{Config, IndexingConfig, ProviderConfig, RepoConfig, RetrievalConfig};
use context_kit::embedding::EmbeddingProvider;
use context_kit::error::ProviderError;
use context_kit::index::RetryPolicy;
use futures::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

// ─── Embedding stubs ────────────────────────────────────────────────

/// Deterministic embedder: each text maps to `[len, byte_sum]`.
///
/// Counts every call so tests can assert on network activity.
pub struct ContentEmbedder {
    pub calls: AtomicU32,
}

impl ContentEmbedder {
    pub fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
        }
    }

    pub fn vector_for(text: &str) -> Vec<f32> {
        let sum: u32 = text.bytes().map(u32::from).sum();
        vec![text.len() as f32, sum as f32]
    }
}

#[async_trait]
impl EmbeddingProvider for ContentEmbedder {
    fn provider_name(&self) -> &str {
        "stub"
    }

    fn model_name(&self) -> &str {
        "stub-embed"
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::vector_for(t)).collect())
    }
}

/// Returns the same vector for every text.
pub struct FixedEmbedder(pub Vec<f32>);

#[async_trait]
impl EmbeddingProvider for FixedEmbedder {
    fn provider_name(&self) -> &str {
        "stub"
    }

    fn model_name(&self) -> &str {
        "stub-embed"
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|_| self.0.clone()).collect())
    }
}

/// Fails the first `failures` calls with the given status, then succeeds.
pub struct FlakyEmbedder {
    pub failures: u32,
    pub status: u16,
    pub attempts: AtomicU32,
}

impl FlakyEmbedder {
    pub fn new(failures: u32, status: u16) -> Self {
        Self {
            failures,
            status,
            attempts: AtomicU32::new(0),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for FlakyEmbedder {
    fn provider_name(&self) -> &str {
        "stub"
    }

    fn model_name(&self) -> &str {
        "stub-embed"
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.failures {
            return Err(ProviderError::http(
                self.status,
                format!("failure #{}", n),
            ));
        }
        Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
    }
}

/// Never answers within any reasonable deadline.
pub struct HangingEmbedder;

#[async_trait]
impl EmbeddingProvider for HangingEmbedder {
    fn provider_name(&self) -> &str {
        "stub"
    }

    fn model_name(&self) -> &str {
        "stub-embed"
    }

    async fn embed_documents(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        std::future::pending().await
    }
}

// ─── Chat stub ──────────────────────────────────────────────────────

/// One scripted response: `tokens` are streamed in order, then the stream
/// either ends or (with `hang`) stays open until cancelled.
pub struct Script {
    pub tokens: Vec<&'static str>,
    pub hang: bool,
    pub fail_open: bool,
}

impl Script {
    pub fn complete(tokens: Vec<&'static str>) -> Self {
        Self {
            tokens,
            hang: false,
            fail_open: false,
        }
    }

    pub fn hanging(tokens: Vec<&'static str>) -> Self {
        Self {
            tokens,
            hang: true,
            fail_open: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            tokens: Vec::new(),
            hang: false,
            fail_open: true,
        }
    }
}

pub struct ScriptedChat {
    scripts: Mutex<VecDeque<Script>>,
    pub prompts: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedChat {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ChatModel for ScriptedChat {
    fn provider_name(&self) -> &str {
        "stub"
    }

    fn model_name(&self) -> &str {
        "stub-chat"
    }

    async fn stream(&self, messages: &[ChatMessage]) -> Result<ChunkStream, ProviderError> {
        self.prompts.lock().unwrap().push(messages.to_vec());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Script::complete(vec![]));

        if script.fail_open {
            return Err(ProviderError::http(503, "model overloaded"));
        }

        let tokens = stream::iter(
            script
                .tokens
                .into_iter()
                .map(|t| Ok(ChatChunk::text(t)))
                .collect::<Vec<_>>(),
        );
        if script.hang {
            Ok(tokens.chain(stream::pending()).boxed())
        } else {
            Ok(tokens.boxed())
        }
    }
}

// ─── Fixtures ───────────────────────────────────────────────────────

pub fn fast_policy(batch_size: usize) -> RetryPolicy {
    RetryPolicy {
        batch_size,
        max_retries: 3,
        attempt_timeout: Duration::from_secs(5),
        backoff_base: Duration::ZERO,
        backoff_cap: Duration::ZERO,
        jitter: Duration::ZERO,
    }
}

pub fn write_entity(repo: &Path, dir: &str, file: &str, yaml: &str) {
    let dir = repo.join("contexts").join(dir);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(file), yaml).unwrap();
}

/// A small repository with a feature, a complete user story, and a user
/// story missing `soThat`.
pub fn seed_repo(repo: &Path) {
    write_entity(
        repo,
        "features",
        "FEAT-001.yaml",
        "id: FEAT-001\ntitle: Login\nstatus: active\nobjective: Let users sign in with SSO and passwords\n",
    );
    write_entity(
        repo,
        "features",
        "FEAT-002.yaml",
        "id: FEAT-002\ntitle: Billing\nstatus: draft\n",
    );
    write_entity(
        repo,
        "userstories",
        "US-001.yaml",
        "id: US-001\ntitle: Sign in\nasA: customer\niWant: to sign in\nsoThat: I can see my orders\n",
    );
    write_entity(
        repo,
        "userstories",
        "US-002.yaml",
        "id: US-002\ntitle: Reset password\nasA: customer\niWant: to reset my password\n",
    );
}

pub fn stub_config(repo: PathBuf) -> Config {
    Config {
        repo: RepoConfig {
            path: repo,
            state_dir: PathBuf::from(".context/.rag"),
        },
        embedding: ProviderConfig {
            provider: "ollama".to_string(),
            model: Some("stub-embed".to_string()),
            ..ProviderConfig::default()
        },
        chat: ProviderConfig {
            provider: "ollama".to_string(),
            model: Some("stub-chat".to_string()),
            ..ProviderConfig::default()
        },
        indexing: IndexingConfig {
            backoff_base_ms: 0,
            backoff_cap_ms: 0,
            jitter_ms: 0,
            ..IndexingConfig::default()
        },
        retrieval: RetrievalConfig::default(),
    }
}
