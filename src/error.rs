//! Error taxonomy for the indexing and retrieval core.
//!
//! Provider adapters (see [`embedding`](crate::embedding) and
//! [`chat`](crate::chat)) translate transport failures into a
//! [`ProviderError`] envelope. The core only ever looks at that envelope,
//! never at raw `reqwest` errors, and lifts it into [`ContextKitError`]
//! with whatever batch/attempt context applies.

use std::fmt;

use thiserror::Error;

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, ContextKitError>;

/// Coarse classification of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// HTTP 4xx.
    ClientError,
    /// HTTP 5xx.
    ServerError,
    /// The attempt exceeded its per-attempt deadline.
    Timeout,
    /// Connection refused, DNS failure, malformed body, etc.
    Transport,
}

impl StatusClass {
    pub fn from_status(status: Option<u16>) -> Self {
        match status {
            Some(s) if (400..500).contains(&s) => StatusClass::ClientError,
            Some(s) if s >= 500 => StatusClass::ServerError,
            _ => StatusClass::Transport,
        }
    }
}

impl fmt::Display for StatusClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusClass::ClientError => "4xx",
            StatusClass::ServerError => "5xx",
            StatusClass::Timeout => "timeout",
            StatusClass::Transport => "transport",
        };
        f.write_str(s)
    }
}

/// Typed envelope produced by provider clients.
#[derive(Debug, Clone, Error)]
#[error("{}", render_provider_error(.status, .message))]
pub struct ProviderError {
    /// HTTP status code, when the failure came from a response.
    pub status: Option<u16>,
    pub message: String,
    /// Set when the failure was a deadline rather than a response.
    pub timed_out: bool,
}

fn render_provider_error(status: &Option<u16>, message: &str) -> String {
    match status {
        Some(s) => format!("HTTP {}: {}", s, message),
        None => message.to_string(),
    }
}

impl ProviderError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
            timed_out: false,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            timed_out: false,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            timed_out: true,
        }
    }

    pub fn class(&self) -> StatusClass {
        if self.timed_out {
            StatusClass::Timeout
        } else {
            StatusClass::from_status(self.status)
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return ProviderError::timeout(e.to_string());
        }
        match e.status() {
            Some(status) => ProviderError::http(status.as_u16(), e.to_string()),
            None => ProviderError::transport(e.to_string()),
        }
    }
}

/// Per-build tally of failed attempts by status class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureCounts {
    pub client_errors: u32,
    pub server_errors: u32,
}

impl FailureCounts {
    pub fn record(mut self, err: &ProviderError) -> Self {
        match err.class() {
            StatusClass::ClientError => self.client_errors += 1,
            StatusClass::ServerError => self.server_errors += 1,
            StatusClass::Timeout | StatusClass::Transport => {}
        }
        self
    }
}

/// Errors surfaced by the indexing and retrieval core.
#[derive(Debug, Error)]
pub enum ContextKitError {
    /// A query was attempted before any successful index build or load.
    #[error("repository is not indexed; run an index build first")]
    NotIndexed,

    /// The requested entity has no primary document in the index.
    #[error("entity not found in index: {id}")]
    NotFound { id: String },

    /// Embedding calls failed after exhausting retries.
    #[error(
        "embedding batch {batch} failed after {attempts} attempt(s) [{class}{}]: {message}",
        .status.map(|s| format!(" {}", s)).unwrap_or_default()
    )]
    EmbeddingProvider {
        batch: usize,
        attempts: u32,
        class: StatusClass,
        status: Option<u16>,
        message: String,
        client_errors: u32,
        server_errors: u32,
    },

    /// A standalone embedding call (deployment ping, query embedding) failed.
    #[error(
        "embedding {operation} failed after {attempts} attempt(s) [{class}{}]: {message}",
        .status.map(|s| format!(" {}", s)).unwrap_or_default()
    )]
    EmbeddingRequest {
        operation: &'static str,
        attempts: u32,
        class: StatusClass,
        status: Option<u16>,
        message: String,
    },

    /// Deployment collision, missing credentials, model mismatch.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The chat provider failed while opening or reading the stream.
    #[error("chat provider error: {0}")]
    ChatProvider(#[source] ProviderError),

    /// The stream was cancelled by the caller or superseded by a newer query.
    #[error("stream aborted after {} character(s) of answer", .partial_answer.len())]
    StreamAborted { partial_answer: String },

    /// Stored checksum did not match the reloaded documents.
    #[error("index checksum mismatch: stored {stored}, computed {computed}")]
    ChecksumMismatch { stored: String, computed: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ContextKitError {
    pub fn embedding(
        batch: usize,
        attempts: u32,
        err: &ProviderError,
        counts: FailureCounts,
    ) -> Self {
        ContextKitError::EmbeddingProvider {
            batch,
            attempts,
            class: err.class(),
            status: err.status,
            message: err.message.clone(),
            client_errors: counts.client_errors,
            server_errors: counts.server_errors,
        }
    }

    pub fn embedding_request(operation: &'static str, attempts: u32, err: &ProviderError) -> Self {
        ContextKitError::EmbeddingRequest {
            operation,
            attempts,
            class: err.class(),
            status: err.status,
            message: err.message.clone(),
        }
    }

    pub fn io(path: impl fmt::Display, source: std::io::Error) -> Self {
        ContextKitError::Io {
            path: path.to_string(),
            source,
        }
    }

    /// True when the error represents user or supersession cancellation.
    pub fn is_aborted(&self) -> bool {
        matches!(self, ContextKitError::StreamAborted { .. })
    }
}
