//! # Context Kit
//!
//! Semantic indexing, similarity search, and retrieval-augmented question
//! answering over a repository of YAML-authored product entities
//! (features, user stories, specs, tasks, services, packages, governance).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────────┐
//! │   Corpus     │──▶│   Indexer    │──▶│   VectorIndex     │
//! │ contexts/*.  │   │ batch+retry  │   │ vector-index.json │
//! │   yaml       │   │  (embed)     │   └────────┬─────────┘
//! └──────────────┘   └──────────────┘            │ atomic swap
//!                           ┌────────────────────┤
//!                           ▼                    ▼
//!                    ┌────────────┐       ┌────────────┐
//!                    │ Similarity │──────▶│    RAG     │
//!                    │ find/search│ top-K │  (stream)  │
//!                    └────────────┘       └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ckit index                        # build and persist the index
//! ckit similar FEAT-001             # entities like FEAT-001
//! ckit search "login with SSO"      # free-text search
//! ckit ask "Which features touch authentication?"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy and provider error envelope |
//! | [`models`] | Core data types |
//! | [`corpus`] | Entity loading and document derivation |
//! | [`credentials`] | API key resolution |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`chat`] | Streaming chat provider abstraction |
//! | [`cache`] | Provider construction and client cache |
//! | [`index`] | Index build, retry policy, persistence |
//! | [`similarity`] | Cosine ranking, find-similar, search |
//! | [`rag`] | Retrieval-augmented answering with cancellation |
//! | [`service`] | Per-repository facade |

pub mod cache;
pub mod chat;
pub mod config;
pub mod corpus;
pub mod credentials;
pub mod embedding;
pub mod error;
pub mod index;
pub mod models;
pub mod rag;
pub mod service;
pub mod similarity;
