//! Cosine-similarity ranking over a [`VectorIndex`].
//!
//! All functions here only read the index. Ranking is a stable descending
//! sort, so documents with equal similarity keep their build order, and a
//! `NaN` similarity (zero-norm or mismatched vectors) ranks last and
//! displays as `0`.

use std::cmp::Ordering;

use crate::embedding::EmbeddingProvider;
use crate::error::{ContextKitError, Result};
use crate::index::{ensure_compatible, VectorIndex};
use crate::models::{excerpt, DocField, Document, IndexedDocument, RetrievalResult};

/// Maximum excerpt length in characters.
pub const EXCERPT_CHARS: usize = 200;

/// Compute cosine similarity between two embedding vectors.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
///
/// Returns `NaN` when either vector has zero norm, the vectors are empty,
/// or their lengths differ. Callers treat `NaN` as "no similarity".
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return f32::NAN;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Scale a similarity to an integer percentage in `[0, 100]`.
pub fn to_percent(similarity: f32) -> u32 {
    if similarity.is_nan() {
        return 0;
    }
    (similarity * 100.0).round().clamp(0.0, 100.0) as u32
}

fn rank_key(similarity: f32) -> f32 {
    if similarity.is_nan() {
        f32::NEG_INFINITY
    } else {
        similarity
    }
}

/// Score every document against `query` and sort descending (stable).
pub fn rank<'a>(
    documents: impl Iterator<Item = &'a IndexedDocument>,
    query: &[f32],
) -> Vec<(&'a IndexedDocument, f32)> {
    let mut scored: Vec<(&IndexedDocument, f32)> = documents
        .map(|doc| (doc, cosine_similarity(query, &doc.embedding)))
        .collect();
    scored.sort_by(|a, b| {
        rank_key(b.1)
            .partial_cmp(&rank_key(a.1))
            .unwrap_or(Ordering::Equal)
    });
    scored
}

fn to_result(doc: &IndexedDocument, similarity: f32) -> RetrievalResult {
    let meta = &doc.document.metadata;
    RetrievalResult {
        id: meta.id.clone(),
        similarity: to_percent(similarity),
        title: meta.title.clone(),
        entity_type: meta.entity_type.clone(),
        excerpt: excerpt(&doc.document.page_content, EXCERPT_CHARS),
    }
}

/// Rank other documents by similarity to an entity's primary document.
///
/// Every document belonging to `entity_id` is excluded from the results.
pub fn find_similar(
    index: &VectorIndex,
    entity_id: &str,
    limit: usize,
) -> Result<Vec<RetrievalResult>> {
    let anchor = index
        .documents()
        .iter()
        .find(|d| d.document.metadata.id == entity_id && d.document.metadata.field == DocField::Primary)
        .ok_or_else(|| ContextKitError::NotFound {
            id: entity_id.to_string(),
        })?;

    let others = index
        .documents()
        .iter()
        .filter(|d| d.document.metadata.id != entity_id);

    Ok(rank(others, &anchor.embedding)
        .into_iter()
        .take(limit)
        .map(|(doc, sim)| to_result(doc, sim))
        .collect())
}

/// Free-text search: embed `query_text` with the index's provider and rank all documents.
pub async fn search(
    index: &VectorIndex,
    query_text: &str,
    limit: usize,
    provider: &dyn EmbeddingProvider,
) -> Result<Vec<RetrievalResult>> {
    let scored = similarity_search_with_scores(index, query_text, limit, provider).await?;
    Ok(scored
        .into_iter()
        .map(|(doc, sim)| to_result(doc, sim))
        .collect())
}

/// Top-K retrieval returning raw documents for prompt assembly.
pub async fn similarity_search_top_k(
    index: &VectorIndex,
    query_text: &str,
    k: usize,
    provider: &dyn EmbeddingProvider,
) -> Result<Vec<Document>> {
    let scored = similarity_search_with_scores(index, query_text, k, provider).await?;
    Ok(scored.into_iter().map(|(doc, _)| doc.document.clone()).collect())
}

/// Top-K retrieval keeping the raw similarity alongside each document.
pub async fn similarity_search_with_scores<'a>(
    index: &'a VectorIndex,
    query_text: &str,
    k: usize,
    provider: &dyn EmbeddingProvider,
) -> Result<Vec<(&'a IndexedDocument, f32)>> {
    ensure_compatible(index, provider)?;
    if index.is_empty() || k == 0 {
        return Ok(Vec::new());
    }

    let query_vec = provider
        .embed_query(query_text)
        .await
        .map_err(|e| ContextKitError::embedding_request("query", 1, &e))?;

    let mut scored = rank(index.documents().iter(), &query_vec);
    scored.truncate(k);
    Ok(scored)
}
