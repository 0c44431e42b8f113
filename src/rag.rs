//! Retrieval-augmented question answering over the published index.
//!
//! Each query moves through an explicit state machine:
//!
//! | From         | To           | Trigger                                      |
//! |--------------|--------------|----------------------------------------------|
//! | `Idle`       | `Retrieving` | [`RagEngine::stream_query`] / [`RagEngine::query`] |
//! | `Retrieving` | `Streaming`  | top-K retrieval succeeded                     |
//! | `Streaming`  | `Completed`  | the model stream ended                        |
//! | any active   | `Cancelled`  | [`RagEngine::cancel`] or a newer query        |
//! | any active   | `Failed`     | retrieval or provider error                   |
//!
//! The engine is single-flight: starting a query cancels the one in flight.
//! A cancelled query keeps the answer accumulated up to that point.
//!
//! The index is read through an [`ArcSwapOption`]; a rebuild publishes a new
//! [`VectorIndex`] with one pointer swap, and a query keeps the `Arc` it
//! loaded at start for its whole lifetime.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwapOption;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chat::{ChatChunk, ChatMessage, ChatModel, ToolCallChunk};
use crate::embedding::EmbeddingProvider;
use crate::error::{ContextKitError, Result};
use crate::index::VectorIndex;
use crate::models::{excerpt, IndexedDocument, RagResponse, RagSource, ToolCall, Usage};
use crate::similarity::{similarity_search_with_scores, to_percent, EXCERPT_CHARS};

/// Default number of documents retrieved per question.
pub const DEFAULT_TOP_K: usize = 4;

const SYSTEM_PROMPT: &str = "You are an assistant for a product context repository of \
features, user stories, specs, tasks, services, packages and governance records. \
Answer the question using only the context below. Cite entity IDs (for example FEAT-001) \
when you rely on them. If the context does not contain the answer, say so.";

/// Lifecycle of the engine's most recent query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Idle,
    Retrieving,
    Streaming,
    Completed,
    Cancelled,
    Failed,
}

impl QueryState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueryState::Completed | QueryState::Cancelled | QueryState::Failed
        )
    }
}

/// Incremental events delivered while a query runs.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Retrieval finished; these are the documents the answer is grounded on.
    Sources(Vec<RagSource>),
    /// A piece of answer text.
    Token(String),
    /// Usage statistics as merged so far.
    Usage(Usage),
}

/// Terminal result of [`RagEngine::stream_query`].
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Completed(RagResponse),
    Cancelled {
        partial_answer: String,
        sources: Vec<RagSource>,
        usage: Option<Usage>,
        tool_calls: Vec<ToolCall>,
    },
}

struct Flight {
    id: u64,
    token: CancellationToken,
}

struct Slot {
    flight: Option<Flight>,
    last_id: u64,
    state: QueryState,
}

/// Retrieval-augmented question answering over a published index.
///
/// At most one query is in flight; starting another cancels it.
pub struct RagEngine {
    index: Arc<ArcSwapOption<VectorIndex>>,
    embedder: Arc<dyn EmbeddingProvider>,
    chat: Arc<dyn ChatModel>,
    top_k: usize,
    slot: Mutex<Slot>,
}

impl RagEngine {
    /// `top_k` is clamped to at least one retrieved document.
    pub fn new(
        index: Arc<ArcSwapOption<VectorIndex>>,
        embedder: Arc<dyn EmbeddingProvider>,
        chat: Arc<dyn ChatModel>,
        top_k: usize,
    ) -> Self {
        Self {
            index,
            embedder,
            chat,
            top_k: top_k.max(1),
            slot: Mutex::new(Slot {
                flight: None,
                last_id: 0,
                state: QueryState::Idle,
            }),
        }
    }

    /// Replace the published index.
    pub fn publish_index(&self, index: VectorIndex) {
        self.index.store(Some(Arc::new(index)));
    }

    /// The published index, if any.
    pub fn current_index(&self) -> Option<Arc<VectorIndex>> {
        self.index.load_full()
    }

    /// State of the most recently started query.
    pub fn state(&self) -> QueryState {
        self.lock().state
    }

    /// Cancel the in-flight query, if any.
    pub fn cancel(&self) {
        if let Some(flight) = &self.lock().flight {
            debug!(query = flight.id, "cancelling query");
            flight.token.cancel();
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn begin(&self) -> (u64, CancellationToken) {
        let mut slot = self.lock();
        if let Some(prev) = slot.flight.take() {
            info!(query = prev.id, "superseding in-flight query");
            prev.token.cancel();
        }
        slot.last_id += 1;
        let id = slot.last_id;
        let token = CancellationToken::new();
        slot.flight = Some(Flight {
            id,
            token: token.clone(),
        });
        slot.state = QueryState::Retrieving;
        (id, token)
    }

    fn transition(&self, id: u64, state: QueryState) {
        let mut slot = self.lock();
        if slot.last_id != id {
            return;
        }
        slot.state = state;
        if state.is_terminal() {
            slot.flight = None;
        }
    }

    fn fail<T>(&self, id: u64, err: ContextKitError) -> Result<T> {
        warn!(query = id, error = %err, "query failed");
        self.transition(id, QueryState::Failed);
        Err(err)
    }

    /// Answer `question`, delivering sources and tokens to `on_event` as they arrive.
    ///
    /// Cancellation is not an error here: it yields [`QueryOutcome::Cancelled`]
    /// carrying the partial answer.
    pub async fn stream_query<F>(&self, question: &str, mut on_event: F) -> Result<QueryOutcome>
    where
        F: FnMut(StreamEvent) + Send,
    {
        let (id, token) = self.begin();
        let mut acc = Accumulator::default();

        let index = match self.current_index() {
            Some(index) if !index.is_empty() => index,
            _ => return self.fail(id, ContextKitError::NotIndexed),
        };

        debug!(query = id, top_k = self.top_k, "retrieving context");
        let scored = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(self.cancelled(id, acc)),
            r = similarity_search_with_scores(&index, question, self.top_k, self.embedder.as_ref()) => r,
        };
        let scored = match scored {
            Ok(scored) => scored,
            Err(e) => return self.fail(id, e),
        };

        acc.sources = sources_from(&scored);
        on_event(StreamEvent::Sources(acc.sources.clone()));
        let messages = build_messages(&scored, question);

        self.transition(id, QueryState::Streaming);
        let opened = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(self.cancelled(id, acc)),
            s = self.chat.stream(&messages) => s,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => return self.fail(id, ContextKitError::ChatProvider(e)),
        };
        info!(
            query = id,
            sources = acc.sources.len(),
            model = self.chat.model_name(),
            "streaming answer"
        );

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(self.cancelled(id, acc)),
                next = stream.next() => match next {
                    Some(Ok(chunk)) => acc.apply(chunk, &mut on_event),
                    Some(Err(e)) => return self.fail(id, ContextKitError::ChatProvider(e)),
                    None => break,
                },
            }
        }

        self.transition(id, QueryState::Completed);
        info!(
            query = id,
            answer_chars = acc.answer.chars().count(),
            total_tokens = acc.usage.total_tokens,
            "query completed"
        );
        Ok(QueryOutcome::Completed(acc.into_response()))
    }

    /// Answer `question` without incremental delivery.
    ///
    /// Runs the streaming path to completion. A cancelled query surfaces as
    /// [`ContextKitError::StreamAborted`] holding the partial answer.
    pub async fn query(&self, question: &str) -> Result<RagResponse> {
        match self.stream_query(question, |_| {}).await? {
            QueryOutcome::Completed(response) => Ok(response),
            QueryOutcome::Cancelled { partial_answer, .. } => {
                Err(ContextKitError::StreamAborted { partial_answer })
            }
        }
    }

    fn cancelled(&self, id: u64, acc: Accumulator) -> QueryOutcome {
        info!(
            query = id,
            partial_chars = acc.answer.chars().count(),
            "query cancelled"
        );
        self.transition(id, QueryState::Cancelled);
        let usage = acc.usage_opt();
        QueryOutcome::Cancelled {
            partial_answer: acc.answer,
            sources: acc.sources,
            usage,
            tool_calls: acc.tool_calls.into_values().collect(),
        }
    }
}

#[derive(Default)]
struct Accumulator {
    answer: String,
    sources: Vec<RagSource>,
    usage: Usage,
    tool_calls: BTreeMap<usize, ToolCall>,
}

impl Accumulator {
    fn apply<F: FnMut(StreamEvent)>(&mut self, chunk: ChatChunk, on_event: &mut F) {
        if let Some(content) = chunk.content {
            let text = content.text();
            if !text.is_empty() {
                self.answer.push_str(&text);
                on_event(StreamEvent::Token(text));
            }
        }
        for fragment in chunk.tool_calls {
            self.merge_tool_call(fragment);
        }
        if let Some(partial) = chunk.usage {
            self.usage.merge(&partial);
            on_event(StreamEvent::Usage(self.usage));
        }
    }

    fn merge_tool_call(&mut self, fragment: ToolCallChunk) {
        let call = self.tool_calls.entry(fragment.index).or_default();
        if fragment.id.is_some() {
            call.id = fragment.id;
        }
        if let Some(name) = fragment.name {
            call.name.push_str(&name);
        }
        call.arguments.push_str(&fragment.arguments);
    }

    fn usage_opt(&self) -> Option<Usage> {
        (!self.usage.is_empty()).then_some(self.usage)
    }

    fn into_response(self) -> RagResponse {
        let usage = self.usage_opt();
        RagResponse {
            answer: self.answer,
            sources: self.sources,
            tokens_used: usage
                .map(|u| u.total_tokens)
                .filter(|total| *total > 0),
            usage,
            tool_calls: self.tool_calls.into_values().collect(),
        }
    }
}

/// One source per entity, at the relevance of its best-scoring document.
fn sources_from(scored: &[(&IndexedDocument, f32)]) -> Vec<RagSource> {
    let mut sources: Vec<RagSource> = Vec::new();
    for (doc, similarity) in scored {
        let meta = &doc.document.metadata;
        if sources.iter().any(|s| s.id == meta.id) {
            continue;
        }
        sources.push(RagSource {
            id: meta.id.clone(),
            title: meta.title.clone(),
            entity_type: meta.entity_type.clone(),
            relevance: to_percent(*similarity),
            excerpt: excerpt(&doc.document.page_content, EXCERPT_CHARS),
        });
    }
    sources
}

fn build_messages(scored: &[(&IndexedDocument, f32)], question: &str) -> Vec<ChatMessage> {
    let context = scored
        .iter()
        .map(|(doc, _)| doc.document.page_content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n---\n\n");
    vec![
        ChatMessage::system(format!("{}\n\nContext:\n{}", SYSTEM_PROMPT, context)),
        ChatMessage::user(question),
    ]
}
