//! Per-repository service facade.
//!
//! [`ContextService`] owns the published [`VectorIndex`], the provider
//! cache, and the RAG engine for one repository. Callers (the `ckit` CLI,
//! or an embedding application) go through it rather than wiring the
//! lower modules themselves.
//!
//! # Index lifecycle
//!
//! ```text
//! index_repository:
//!   deployment collision check   (no network)
//!   load corpus                  contexts/**/*.yaml
//!   ping embedding deployment  (Azure only, retried)
//!   build index                  sequential batches, retry/backoff
//!   persist                      <repo>/.context/.rag/vector-index.json
//!   publish                      atomic swap
//! ```

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::cache::ModelCache;
use crate::chat::ChatModel;
use crate::config::{check_deployment_collision, Config};
use crate::corpus::load_corpus;
use crate::credentials::{CredentialStore, NoStoredCredentials};
use crate::embedding::EmbeddingProvider;
use crate::error::{ContextKitError, Result};
use crate::index::{self, build_index, ping, Integrity, RetryPolicy, VectorIndex};
use crate::models::{RagResponse, RetrievalResult};
use crate::rag::{QueryOutcome, QueryState, RagEngine, StreamEvent};
use crate::similarity;

/// Summary returned by [`ContextService::index_repository`].
#[derive(Debug, Clone, Serialize)]
pub struct IndexSummary {
    pub doc_count: usize,
    pub checksum: String,
    pub embedding_model: String,
    pub provider: String,
    pub path: PathBuf,
}

/// Snapshot of the published index.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    pub indexed: bool,
    pub doc_count: usize,
    pub embedding_model: Option<String>,
    pub provider: Option<String>,
    pub checksum: Option<String>,
    /// `None` until an index is published; `Some(false)` after a checksum mismatch on load.
    pub checksum_valid: Option<bool>,
    pub built_at: Option<DateTime<Utc>>,
    pub path: PathBuf,
}

pub struct ContextService {
    config: Config,
    store: Arc<dyn CredentialStore>,
    cache: ModelCache,
    embedder_override: Option<Arc<dyn EmbeddingProvider>>,
    chat_override: Option<Arc<dyn ChatModel>>,
    index: Arc<ArcSwapOption<VectorIndex>>,
    rag: Mutex<Option<Arc<RagEngine>>>,
}

impl ContextService {
    pub fn new(config: Config) -> Self {
        Self::with_credential_store(config, Arc::new(NoStoredCredentials))
    }

    pub fn with_credential_store(config: Config, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            config,
            store,
            cache: ModelCache::new(),
            embedder_override: None,
            chat_override: None,
            index: Arc::new(ArcSwapOption::empty()),
            rag: Mutex::new(None),
        }
    }

    /// Use these clients instead of building them from config.
    ///
    /// Config is still consulted for batching, retrieval limits, and the
    /// deployment collision check.
    pub fn with_providers(
        config: Config,
        embedder: Arc<dyn EmbeddingProvider>,
        chat: Option<Arc<dyn ChatModel>>,
    ) -> Self {
        Self {
            embedder_override: Some(embedder),
            chat_override: chat,
            ..Self::new(config)
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn embedder(&self) -> Result<Arc<dyn EmbeddingProvider>> {
        if let Some(e) = &self.embedder_override {
            return Ok(Arc::clone(e));
        }
        self.cache.embedding_provider(
            &self.config.embedding,
            self.store.as_ref(),
            self.config.indexing.attempt_timeout(),
        )
    }

    fn chat(&self) -> Result<Arc<dyn ChatModel>> {
        if let Some(c) = &self.chat_override {
            return Ok(Arc::clone(c));
        }
        self.cache.chat_model(
            &self.config.chat,
            self.store.as_ref(),
            self.config.indexing.attempt_timeout(),
        )
    }

    fn rag_engine(&self) -> Result<Arc<RagEngine>> {
        let mut slot = self.rag.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(engine) = slot.as_ref() {
            return Ok(Arc::clone(engine));
        }
        let engine = Arc::new(RagEngine::new(
            Arc::clone(&self.index),
            self.embedder()?,
            self.chat()?,
            self.config.retrieval.top_k,
        ));
        *slot = Some(Arc::clone(&engine));
        Ok(engine)
    }

    /// The published index, if it has documents.
    fn require_index(&self) -> Result<Arc<VectorIndex>> {
        match self.index.load_full() {
            Some(index) if !index.is_empty() => Ok(index),
            _ => Err(ContextKitError::NotIndexed),
        }
    }

    fn publish(&self, index: VectorIndex) {
        self.index.store(Some(Arc::new(index)));
    }

    // ============ Indexing ============

    /// Rebuild the index from the repository's entity files, persist it,
    /// and publish it. Nothing is published if any step fails.
    pub async fn index_repository(&self) -> Result<IndexSummary> {
        check_deployment_collision(&self.config.embedding, &self.config.chat)?;
        let embedder = self.embedder()?;

        let documents = load_corpus(&self.config.repo.path)?;
        info!(
            repo = %self.config.repo.path.display(),
            documents = documents.len(),
            "indexing repository"
        );

        let policy = RetryPolicy::from(&self.config.indexing);
        if self.config.embedding.is_azure() {
            ping(embedder.as_ref(), &policy).await?;
        }

        let built = build_index(documents, embedder.as_ref(), &policy).await?;

        let path = self.config.repo.index_path();
        index::persist(&built, &path).await?;

        let summary = IndexSummary {
            doc_count: built.doc_count(),
            checksum: built.checksum().to_string(),
            embedding_model: built.embedding_model().to_string(),
            provider: built.provider().to_string(),
            path,
        };
        self.publish(built);
        Ok(summary)
    }

    /// Load the persisted index, if present, and publish it.
    ///
    /// Returns whether an index was loaded.
    pub async fn load_index(&self) -> Result<bool> {
        let path = self.config.repo.index_path();
        match index::load(&path).await? {
            Some(loaded) => {
                info!(
                    path = %path.display(),
                    doc_count = loaded.doc_count(),
                    "loaded vector index"
                );
                self.publish(loaded);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn status(&self) -> IndexStatus {
        let path = self.config.repo.index_path();
        match self.index.load_full() {
            Some(index) => IndexStatus {
                indexed: !index.is_empty(),
                doc_count: index.doc_count(),
                embedding_model: Some(index.embedding_model().to_string()),
                provider: Some(index.provider().to_string()),
                checksum: Some(index.checksum().to_string()),
                checksum_valid: Some(!matches!(index.integrity(), Integrity::Mismatch { .. })),
                built_at: index.built_at(),
                path,
            },
            None => IndexStatus {
                indexed: false,
                doc_count: 0,
                embedding_model: None,
                provider: None,
                checksum: None,
                checksum_valid: None,
                built_at: None,
                path,
            },
        }
    }

    // ============ Retrieval ============

    pub fn find_similar(&self, entity_id: &str, limit: Option<usize>) -> Result<Vec<RetrievalResult>> {
        let index = self.require_index()?;
        similarity::find_similar(
            &index,
            entity_id,
            limit.unwrap_or(self.config.retrieval.default_limit),
        )
    }

    pub async fn search(&self, query: &str, limit: Option<usize>) -> Result<Vec<RetrievalResult>> {
        let index = self.require_index()?;
        let embedder = self.embedder()?;
        similarity::search(
            &index,
            query,
            limit.unwrap_or(self.config.retrieval.default_limit),
            embedder.as_ref(),
        )
        .await
    }

    // ============ RAG ============

    pub async fn ask(&self, question: &str) -> Result<RagResponse> {
        self.require_index()?;
        self.rag_engine()?.query(question).await
    }

    pub async fn ask_stream<F>(&self, question: &str, on_event: F) -> Result<QueryOutcome>
    where
        F: FnMut(StreamEvent) + Send,
    {
        self.require_index()?;
        self.rag_engine()?.stream_query(question, on_event).await
    }

    /// Cancel the in-flight question, if any.
    pub fn cancel_query(&self) {
        let slot = self.rag.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(engine) = slot.as_ref() {
            engine.cancel();
        }
    }

    pub fn query_state(&self) -> QueryState {
        let slot = self.rag.lock().unwrap_or_else(|p| p.into_inner());
        slot.as_ref().map(|e| e.state()).unwrap_or(QueryState::Idle)
    }

    /// Drop cached provider clients and the RAG engine built on them.
    ///
    /// The published index is kept.
    pub fn clear_cache(&self) {
        self.cache.clear();
        let mut slot = self.rag.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(engine) = slot.take() {
            engine.cancel();
        }
    }
}
