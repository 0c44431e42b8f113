//! Core data models used throughout Context Kit.
//!
//! These types represent the entities, derived documents, embedded
//! documents, and retrieval results that flow through the indexing and
//! query pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Entity kinds stored in a context repository, one directory each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Feature,
    #[serde(rename = "userstory")]
    UserStory,
    Spec,
    Task,
    Service,
    Package,
    Governance,
}

impl EntityType {
    /// Every indexed entity type, in enumeration order.
    pub const ALL: [EntityType; 7] = [
        EntityType::Feature,
        EntityType::UserStory,
        EntityType::Spec,
        EntityType::Task,
        EntityType::Service,
        EntityType::Package,
        EntityType::Governance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Feature => "feature",
            EntityType::UserStory => "userstory",
            EntityType::Spec => "spec",
            EntityType::Task => "task",
            EntityType::Service => "service",
            EntityType::Package => "package",
            EntityType::Governance => "governance",
        }
    }

    /// Directory under `<repo>/contexts/` holding this type's YAML files.
    pub fn dir_name(&self) -> &'static str {
        match self {
            EntityType::Feature => "features",
            EntityType::UserStory => "userstories",
            EntityType::Spec => "specs",
            EntityType::Task => "tasks",
            EntityType::Service => "services",
            EntityType::Package => "packages",
            EntityType::Governance => "governance",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A YAML-authored record read from the repository.
#[derive(Debug, Clone, Default)]
pub struct Entity {
    pub id: String,
    pub title: Option<String>,
    pub status: Option<String>,
    pub objective: Option<String>,
    pub description: Option<String>,
    pub as_a: Option<String>,
    pub i_want: Option<String>,
    pub so_that: Option<String>,
    pub entity_type: Option<EntityType>,
    pub file: PathBuf,
}

/// Which field group of an entity a [`Document`] was extracted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocField {
    /// Identity block: id, title, type, status.
    Primary,
    /// Objective or description text.
    Description,
    /// "As a ..., I want ... so that ..." narrative.
    #[serde(rename = "userstory")]
    UserStory,
}

/// Metadata attached to every [`Document`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub path: String,
    pub field: DocField,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// An indexable text fragment derived from one entity field group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub page_content: String,
    pub metadata: DocumentMetadata,
}

/// A [`Document`] paired with its embedding vector.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedDocument {
    pub document: Document,
    pub embedding: Vec<f32>,
}

/// A ranked hit from find-similar or free-text search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub id: String,
    /// Cosine similarity scaled to an integer in `[0, 100]`.
    pub similarity: u32,
    pub title: Option<String>,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub excerpt: String,
}

/// Token accounting reported by the chat provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    /// Merge a partial report: each non-zero field overwrites the current value.
    pub fn merge(&mut self, partial: &Usage) {
        if partial.prompt_tokens != 0 {
            self.prompt_tokens = partial.prompt_tokens;
        }
        if partial.completion_tokens != 0 {
            self.completion_tokens = partial.completion_tokens;
        }
        if partial.total_tokens != 0 {
            self.total_tokens = partial.total_tokens;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0 && self.total_tokens == 0
    }
}

/// A tool invocation requested by the model mid-stream. Never executed here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    /// Raw JSON argument string as emitted by the model.
    pub arguments: String,
}

/// A cited source attached to a RAG answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RagSource {
    pub id: String,
    pub title: Option<String>,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub relevance: u32,
    pub excerpt: String,
}

/// Completed RAG answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RagResponse {
    pub answer: String,
    pub sources: Vec<RagSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

/// Truncate text to at most `max_chars` characters for display.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
