//! Vector index construction, integrity checking, and persistence.
//!
//! # Build Algorithm
//!
//! 1. Split documents into fixed-size batches (default 4).
//! 2. Embed batches strictly one after another. Each attempt races a
//!    per-attempt deadline (default 90s); a timeout counts as a failure.
//! 3. Failed attempts are retried up to `max_retries` times with
//!    `min(cap, base × 2^(retry-1)) + jitter` backoff
//!    (defaults: base 500ms, cap 10s, jitter 0–300ms).
//! 4. If a batch exhausts its retries the whole build fails; no partial
//!    index is ever returned.
//! 5. Vectors are zipped 1:1 with documents in input order and the
//!    checksum is taken over every `"{id}:{page_content}"` in order.
//!
//! # Persistence
//!
//! The index is written as a single versioned JSON file at
//! `<repo>/.context/.rag/vector-index.json`. Loading recomputes the
//! checksum; a mismatch is logged and recorded on the index, never fatal.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::IndexingConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{ContextKitError, FailureCounts, ProviderError, Result};
use crate::models::{DocField, Document, DocumentMetadata, IndexedDocument};

/// On-disk format version written by [`persist`].
pub const INDEX_VERSION: u32 = 1;

/// Text sent by [`ping`] to validate a deployment.
const PING_TEXT: &str = "ping";

/// Integrity state of an in-memory index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Integrity {
    /// Built in this process.
    Built,
    /// Loaded from disk and the checksum matched.
    Verified,
    /// Loaded from disk but the stored checksum disagreed with the contents.
    Mismatch { stored: String },
}

/// An immutable generation of embedded documents plus index-level metadata.
///
/// Never mutated after construction; a rebuild produces a new value.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    embedding_model: String,
    provider: String,
    documents: Vec<IndexedDocument>,
    checksum: String,
    integrity: Integrity,
    built_at: Option<DateTime<Utc>>,
}

impl VectorIndex {
    /// Assemble a freshly built index, computing its checksum.
    pub fn new(
        embedding_model: impl Into<String>,
        provider: impl Into<String>,
        documents: Vec<IndexedDocument>,
    ) -> Self {
        let checksum = compute_checksum(documents.iter().map(|d| &d.document));
        Self {
            embedding_model: embedding_model.into(),
            provider: provider.into(),
            documents,
            checksum,
            integrity: Integrity::Built,
            built_at: Some(Utc::now()),
        }
    }

    /// Embedded documents in build order.
    pub fn documents(&self) -> &[IndexedDocument] {
        &self.documents
    }

    /// Number of embedded documents.
    pub fn doc_count(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Model or deployment that produced the vectors.
    pub fn embedding_model(&self) -> &str {
        &self.embedding_model
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Hex SHA-256 from [`compute_checksum`].
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn integrity(&self) -> &Integrity {
        &self.integrity
    }

    /// When the embeddings were produced. `None` for files written without a timestamp.
    pub fn built_at(&self) -> Option<DateTime<Utc>> {
        self.built_at
    }

    /// Embedding dimensionality, or `None` for an empty index.
    pub fn dims(&self) -> Option<usize> {
        self.documents.first().map(|d| d.embedding.len())
    }
}

/// SHA-256 over the ordered concatenation of `"{id}:{page_content}"`.
pub fn compute_checksum<'a>(documents: impl IntoIterator<Item = &'a Document>) -> String {
    let mut hasher = Sha256::new();
    for doc in documents {
        hasher.update(doc.metadata.id.as_bytes());
        hasher.update(b":");
        hasher.update(doc.page_content.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Reject queries whose embedding provider/model differs from the index's.
pub fn ensure_compatible(index: &VectorIndex, provider: &dyn EmbeddingProvider) -> Result<()> {
    if index.provider() != provider.provider_name() || index.embedding_model() != provider.model_name()
    {
        return Err(ContextKitError::Configuration(format!(
            "index was built with {}/{} but the configured embedding model is {}/{}; rebuild the index",
            index.provider(),
            index.embedding_model(),
            provider.provider_name(),
            provider.model_name()
        )));
    }
    Ok(())
}

// ============ Batching & Retry ============

/// Batch sizing, deadlines, and backoff for [`build_index`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub batch_size: usize,
    pub max_retries: u32,
    pub attempt_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&IndexingConfig::default())
    }
}

impl From<&IndexingConfig> for RetryPolicy {
    fn from(config: &IndexingConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
            attempt_timeout: config.attempt_timeout(),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_cap: Duration::from_millis(config.backoff_cap_ms),
            jitter: Duration::from_millis(config.jitter_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), excluding jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_cap)
            .min(self.backoff_cap)
    }

    /// Delay before retry number `retry`, with random jitter added.
    pub fn delay(&self, retry: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        };
        self.base_delay(retry) + jitter
    }

    /// First attempt plus `max_retries`.
    pub fn total_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

/// Embed `documents` in sequential batches and assemble a [`VectorIndex`].
pub async fn build_index(
    documents: Vec<Document>,
    provider: &dyn EmbeddingProvider,
    policy: &RetryPolicy,
) -> Result<VectorIndex> {
    let batch_size = policy.batch_size.max(1);
    let total_batches = documents.len().div_ceil(batch_size);
    let mut counts = FailureCounts::default();
    let mut embeddings: Vec<Vec<f32>> = Vec::with_capacity(documents.len());

    info!(
        documents = documents.len(),
        batches = total_batches,
        provider = provider.provider_name(),
        model = provider.model_name(),
        "building vector index"
    );

    for (batch_idx, batch) in documents.chunks(batch_size).enumerate() {
        let texts: Vec<String> = batch.iter().map(|d| d.page_content.clone()).collect();
        let vectors = embed_batch_with_retry(provider, &texts, batch_idx, policy, &mut counts).await?;
        embeddings.extend(vectors);
        debug!(batch = batch_idx + 1, of = total_batches, "embedded batch");
    }

    if let Some(first) = embeddings.first() {
        let dims = first.len();
        if let Some(pos) = embeddings.iter().position(|v| v.len() != dims) {
            return Err(ContextKitError::embedding(
                pos / batch_size,
                1,
                &ProviderError::transport(format!(
                    "inconsistent embedding dimensionality: expected {}, got {} for document {}",
                    dims,
                    embeddings[pos].len(),
                    documents[pos].metadata.id
                )),
                counts,
            ));
        }
    }

    let indexed: Vec<IndexedDocument> = documents
        .into_iter()
        .zip(embeddings)
        .map(|(document, embedding)| IndexedDocument {
            document,
            embedding,
        })
        .collect();

    let index = VectorIndex::new(provider.model_name(), provider.provider_name(), indexed);
    info!(
        doc_count = index.doc_count(),
        checksum = index.checksum(),
        client_errors = counts.client_errors,
        server_errors = counts.server_errors,
        "vector index built"
    );
    Ok(index)
}

async fn embed_batch_with_retry(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
    batch_idx: usize,
    policy: &RetryPolicy,
    counts: &mut FailureCounts,
) -> Result<Vec<Vec<f32>>> {
    let mut last_err: Option<ProviderError> = None;

    for attempt in 1..=policy.total_attempts() {
        if attempt > 1 {
            let delay = policy.delay(attempt - 1);
            warn!(
                batch = batch_idx,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %last_err.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                "retrying embedding batch"
            );
            tokio::time::sleep(delay).await;
        }

        let outcome =
            match tokio::time::timeout(policy.attempt_timeout, provider.embed_documents(texts)).await
            {
                Ok(Ok(vectors)) if vectors.len() == texts.len() => return Ok(vectors),
                Ok(Ok(vectors)) => ProviderError::transport(format!(
                    "provider returned {} vectors for {} texts",
                    vectors.len(),
                    texts.len()
                )),
                Ok(Err(e)) => e,
                Err(_) => ProviderError::timeout(format!(
                    "embedding attempt timed out after {}s",
                    policy.attempt_timeout.as_secs_f32()
                )),
            };

        *counts = counts.record(&outcome);
        last_err = Some(outcome);
    }

    let err = last_err.unwrap_or_else(|| ProviderError::transport("Embedding failed after retries"));
    Err(ContextKitError::embedding(
        batch_idx,
        policy.total_attempts(),
        &err,
        *counts,
    ))
}

/// Send one lightweight embed call to validate the configured deployment.
///
/// Transient failures are retried under `policy` like a batch. A 404 is
/// not retried and becomes a [`ContextKitError::Configuration`] naming the
/// deployment.
pub async fn ping(provider: &dyn EmbeddingProvider, policy: &RetryPolicy) -> Result<()> {
    let mut last_err: Option<ProviderError> = None;

    for attempt in 1..=policy.total_attempts() {
        if attempt > 1 {
            let delay = policy.delay(attempt - 1);
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %last_err.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                "retrying deployment ping"
            );
            tokio::time::sleep(delay).await;
        }

        let outcome =
            match tokio::time::timeout(policy.attempt_timeout, provider.embed_query(PING_TEXT)).await {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(e)) => e,
                Err(_) => ProviderError::timeout(format!(
                    "embedding ping timed out after {}s",
                    policy.attempt_timeout.as_secs_f32()
                )),
            };

        if outcome.is_not_found() {
            return Err(ContextKitError::Configuration(format!(
                "embedding deployment '{}' was not found (HTTP 404); deployment names are \
                 case-sensitive, check the name in your provider console",
                provider.model_name()
            )));
        }
        last_err = Some(outcome);
    }

    let err = last_err.unwrap_or_else(|| ProviderError::transport("embedding ping failed"));
    Err(ContextKitError::embedding_request(
        "deployment ping",
        policy.total_attempts(),
        &err,
    ))
}

// ============ Persistence ============

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedIndex {
    version: u32,
    embedding_model: String,
    provider: String,
    doc_count: usize,
    checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    built_at: Option<DateTime<Utc>>,
    documents: Vec<PersistedDocument>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedDocument {
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    #[serde(rename = "type")]
    entity_type: String,
    content: String,
    embedding: Vec<f32>,
    #[serde(default)]
    path: String,
    #[serde(default = "default_field")]
    field: DocField,
}

fn default_field() -> DocField {
    DocField::Primary
}

/// Write the index as one JSON document, replacing any previous file atomically.
pub async fn persist(index: &VectorIndex, dest: &Path) -> Result<()> {
    let persisted = PersistedIndex {
        version: INDEX_VERSION,
        embedding_model: index.embedding_model.clone(),
        provider: index.provider.clone(),
        doc_count: index.doc_count(),
        checksum: index.checksum.clone(),
        built_at: index.built_at,
        documents: index
            .documents
            .iter()
            .map(|d| PersistedDocument {
                id: d.document.metadata.id.clone(),
                title: d.document.metadata.title.clone(),
                entity_type: d.document.metadata.entity_type.clone(),
                content: d.document.page_content.clone(),
                embedding: d.embedding.clone(),
                path: d.document.metadata.path.clone(),
                field: d.document.metadata.field,
            })
            .collect(),
    };
    let bytes = serde_json::to_vec(&persisted)?;

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ContextKitError::io(parent.display(), e))?;
    }
    let tmp = dest.with_extension("json.tmp");
    tokio::fs::write(&tmp, &bytes)
        .await
        .map_err(|e| ContextKitError::io(tmp.display(), e))?;
    tokio::fs::rename(&tmp, dest)
        .await
        .map_err(|e| ContextKitError::io(dest.display(), e))?;

    info!(path = %dest.display(), doc_count = index.doc_count(), "persisted vector index");
    Ok(())
}

/// Load a persisted index. Returns `Ok(None)` when no index file exists
/// or the file was written by a newer, unknown format version.
pub async fn load(src: &Path) -> Result<Option<VectorIndex>> {
    let bytes = match tokio::fs::read(src).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ContextKitError::io(src.display(), e)),
    };
    let persisted: PersistedIndex = serde_json::from_slice(&bytes)?;

    if persisted.version > INDEX_VERSION {
        warn!(
            path = %src.display(),
            version = persisted.version,
            supported = INDEX_VERSION,
            "ignoring vector index written by a newer version"
        );
        return Ok(None);
    }

    let documents: Vec<IndexedDocument> = persisted
        .documents
        .into_iter()
        .map(|d| IndexedDocument {
            document: Document {
                page_content: d.content,
                metadata: DocumentMetadata {
                    id: d.id,
                    entity_type: d.entity_type,
                    path: d.path,
                    field: d.field,
                    title: d.title,
                },
            },
            embedding: d.embedding,
        })
        .collect();

    let mut index = VectorIndex::new(persisted.embedding_model, persisted.provider, documents);
    index.built_at = persisted.built_at;
    if index.checksum == persisted.checksum {
        index.integrity = Integrity::Verified;
    } else {
        let mismatch = ContextKitError::ChecksumMismatch {
            stored: persisted.checksum.clone(),
            computed: index.checksum.clone(),
        };
        warn!(path = %src.display(), error = %mismatch, "loaded index anyway");
        index.integrity = Integrity::Mismatch {
            stored: persisted.checksum,
        };
    }
    if persisted.doc_count != index.doc_count() {
        warn!(
            stored = persisted.doc_count,
            actual = index.doc_count(),
            "persisted docCount disagrees with document list"
        );
    }

    info!(path = %src.display(), doc_count = index.doc_count(), "loaded vector index");
    Ok(Some(index))
}
