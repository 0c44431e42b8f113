//! Chat/completion provider abstraction and a streaming client.
//!
//! [`ChatModel::stream`] opens a token stream and yields [`ChatChunk`]s.
//! A chunk may carry text content (plain or as structured parts), tool-call
//! fragments, and partial usage statistics; aggregation is the caller's job
//! (see [`rag`](crate::rag)).
//!
//! [`OpenAICompatibleChat`] speaks the OpenAI chat-completions SSE protocol,
//! which both Azure OpenAI deployments and Ollama's `/v1` API serve.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;

use crate::config::ProviderConfig;
use crate::error::{ContextKitError, ProviderError};
use crate::models::Usage;

/// Stream of chunks produced by a chat model.
pub type ChunkStream = BoxStream<'static, Result<ChatChunk, ProviderError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Chunk content: a plain string or a list of typed parts.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text(String),
    /// Non-text parts (images, refusals, ...) are carried but not rendered.
    Other(Value),
}

impl ChunkContent {
    /// Concatenated text of this chunk; non-text parts contribute nothing.
    pub fn text(&self) -> String {
        match self {
            ChunkContent::Text(s) => s.clone(),
            ChunkContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text(t) => Some(t.as_str()),
                    ContentPart::Other(_) => None,
                })
                .collect(),
        }
    }
}

/// One fragment of a streamed tool call. Fragments sharing an `index` belong
/// to the same call; `arguments` arrive piecewise.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallChunk {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: String,
}

/// A single streamed increment from the model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatChunk {
    pub content: Option<ChunkContent>,
    pub tool_calls: Vec<ToolCallChunk>,
    pub usage: Option<Usage>,
}

impl ChatChunk {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(ChunkContent::Text(content.into())),
            ..Self::default()
        }
    }
}

/// Trait for streaming chat models.
#[async_trait]
pub trait ChatModel: Send + Sync {
    fn provider_name(&self) -> &str;

    fn model_name(&self) -> &str;

    /// Open a completion stream for `messages`.
    async fn stream(&self, messages: &[ChatMessage]) -> Result<ChunkStream, ProviderError>;
}

// ============ OpenAI-compatible SSE client ============

/// Chat client for Azure OpenAI deployments and Ollama's OpenAI-compatible API.
pub struct OpenAICompatibleChat {
    client: reqwest::Client,
    provider: String,
    model: String,
    url: String,
    api_key: Option<String>,
    temperature: f32,
    max_tokens: Option<u32>,
}

impl OpenAICompatibleChat {
    /// Build a client from `[chat]` config. `api_key` is required for Azure.
    ///
    /// `connect_timeout` bounds connection setup only; a stream may run as
    /// long as the model keeps producing tokens.
    pub fn new(
        config: &ProviderConfig,
        api_key: Option<String>,
        connect_timeout: Duration,
    ) -> Result<Self, ContextKitError> {
        let model = config
            .target_name()
            .ok_or_else(|| {
                ContextKitError::Configuration(format!(
                    "chat model/deployment required for {}",
                    config.provider
                ))
            })?
            .to_string();
        let endpoint = config.endpoint_or_default();

        let url = match config.provider.as_str() {
            "azure" => {
                if api_key.is_none() {
                    return Err(ContextKitError::Configuration(
                        "no API key found for azure chat (set chat.api_key or AZURE_OPENAI_API_KEY)"
                            .to_string(),
                    ));
                }
                format!(
                    "{}/openai/deployments/{}/chat/completions?api-version={}",
                    endpoint, model, config.api_version
                )
            }
            "ollama" => format!("{}/v1/chat/completions", endpoint),
            other => {
                return Err(ContextKitError::Configuration(format!(
                    "unsupported chat provider: {}",
                    other
                )))
            }
        };

        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| {
                ContextKitError::Configuration(format!("failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            provider: config.provider.clone(),
            model,
            url,
            api_key,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    fn request_body(&self, messages: &[ChatMessage]) -> Value {
        let mut body = serde_json::json!({
            "messages": messages,
            "stream": true,
            "temperature": self.temperature,
            "stream_options": { "include_usage": true },
        });
        if self.provider == "ollama" {
            body["model"] = Value::String(self.model.clone());
        }
        if let Some(max) = self.max_tokens {
            body["max_tokens"] = Value::from(max);
        }
        body
    }
}

#[async_trait]
impl ChatModel for OpenAICompatibleChat {
    fn provider_name(&self) -> &str {
        &self.provider
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream(&self, messages: &[ChatMessage]) -> Result<ChunkStream, ProviderError> {
        let mut request = self.client.post(&self.url).json(&self.request_body(messages));
        if let Some(key) = &self.api_key {
            request = request.header("api-key", key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(ProviderError::http(status.as_u16(), body_text));
        }

        let body = response
            .bytes_stream()
            .map(|r| r.map(|b| b.to_vec()))
            .boxed();
        Ok(sse_chunks(body))
    }
}

struct SseState {
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buffer: Vec<u8>,
    pending: VecDeque<Result<ChatChunk, ProviderError>>,
    finished: bool,
}

impl SseState {
    /// Parse every complete line in the buffer.
    fn drain_lines(&mut self) {
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.handle_line(&String::from_utf8_lossy(&line));
            if self.finished {
                self.buffer.clear();
                return;
            }
        }
    }

    fn handle_line(&mut self, line: &str) {
        match parse_sse_line(line) {
            SseLine::Skip => {}
            SseLine::Done => self.finished = true,
            SseLine::Chunk(chunk) => self.pending.push_back(chunk),
        }
    }
}

/// Turn a raw SSE byte stream into parsed chat chunks.
pub(crate) fn sse_chunks(body: BoxStream<'static, reqwest::Result<Vec<u8>>>) -> ChunkStream {
    let state = SseState {
        body,
        buffer: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            if st.finished {
                return None;
            }
            match st.body.next().await {
                Some(Ok(bytes)) => {
                    st.buffer.extend_from_slice(&bytes);
                    st.drain_lines();
                }
                Some(Err(e)) => {
                    st.finished = true;
                    st.pending.push_back(Err(e.into()));
                }
                None => {
                    let rest = std::mem::take(&mut st.buffer);
                    st.handle_line(&String::from_utf8_lossy(&rest));
                    st.finished = true;
                }
            }
        }
    })
    .boxed()
}

#[derive(Debug)]
enum SseLine {
    Skip,
    Done,
    Chunk(Result<ChatChunk, ProviderError>),
}

fn parse_sse_line(line: &str) -> SseLine {
    let line = line.trim();
    let Some(payload) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let payload = payload.trim();
    if payload.is_empty() {
        return SseLine::Skip;
    }
    if payload == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str::<Value>(payload) {
        Ok(json) => SseLine::Chunk(parse_chat_chunk(&json)),
        Err(e) => SseLine::Chunk(Err(ProviderError::transport(format!(
            "malformed stream event: {}",
            e
        )))),
    }
}

/// Parse one chat-completions stream event.
pub fn parse_chat_chunk(json: &Value) -> Result<ChatChunk, ProviderError> {
    if let Some(err) = json.get("error") {
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        let status = err
            .get("code")
            .and_then(|c| c.as_u64().or_else(|| c.as_str().and_then(|s| s.parse().ok())))
            .and_then(|c| u16::try_from(c).ok());
        return Err(ProviderError {
            status,
            message,
            timed_out: false,
        });
    }

    let mut chunk = ChatChunk::default();

    if let Some(delta) = json
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("delta"))
    {
        chunk.content = match delta.get("content") {
            Some(Value::String(s)) if !s.is_empty() => Some(ChunkContent::Text(s.clone())),
            Some(Value::Array(parts)) => Some(ChunkContent::Parts(
                parts.iter().map(parse_content_part).collect(),
            )),
            _ => None,
        };

        if let Some(calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
            chunk.tool_calls = calls
                .iter()
                .enumerate()
                .map(|(pos, call)| {
                    let function = call.get("function");
                    ToolCallChunk {
                        index: call
                            .get("index")
                            .and_then(|i| i.as_u64())
                            .map(|i| i as usize)
                            .unwrap_or(pos),
                        id: call.get("id").and_then(|i| i.as_str()).map(str::to_string),
                        name: function
                            .and_then(|f| f.get("name"))
                            .and_then(|n| n.as_str())
                            .map(str::to_string),
                        arguments: function
                            .and_then(|f| f.get("arguments"))
                            .and_then(|a| a.as_str())
                            .unwrap_or_default()
                            .to_string(),
                    }
                })
                .collect();
        }
    }

    if let Some(usage) = json.get("usage").filter(|u| u.is_object()) {
        let field = |name: &str| usage.get(name).and_then(|v| v.as_u64()).unwrap_or(0);
        chunk.usage = Some(Usage {
            prompt_tokens: field("prompt_tokens"),
            completion_tokens: field("completion_tokens"),
            total_tokens: field("total_tokens"),
        });
    }

    Ok(chunk)
}

fn parse_content_part(part: &Value) -> ContentPart {
    match (
        part.get("type").and_then(|t| t.as_str()),
        part.get("text").and_then(|t| t.as_str()),
    ) {
        (Some("text"), Some(text)) | (None, Some(text)) => ContentPart::Text(text.to_string()),
        _ => ContentPart::Other(part.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body_from(parts: Vec<&'static str>) -> BoxStream<'static, reqwest::Result<Vec<u8>>> {
        stream::iter(parts.into_iter().map(|p| Ok::<_, reqwest::Error>(p.as_bytes().to_vec()))).boxed()
    }

    #[test]
    fn test_parse_text_delta() {
        let chunk = parse_chat_chunk(&json!({
            "choices": [{ "delta": { "content": "Hel" } }]
        }))
        .unwrap();
        assert_eq!(chunk.content.unwrap().text(), "Hel");
        assert!(chunk.usage.is_none());
    }

    #[test]
    fn test_parse_structured_parts() {
        let chunk = parse_chat_chunk(&json!({
            "choices": [{ "delta": { "content": [
                { "type": "text", "text": "a" },
                { "type": "image_url", "image_url": { "url": "x" } },
                { "type": "text", "text": "b" }
            ] } }]
        }))
        .unwrap();
        assert_eq!(chunk.content.unwrap().text(), "ab");
    }

    #[test]
    fn test_parse_tool_call_fragment() {
        let chunk = parse_chat_chunk(&json!({
            "choices": [{ "delta": { "tool_calls": [
                { "index": 0, "id": "call_1", "function": { "name": "lookup", "arguments": "{\"id\":" } }
            ] } }]
        }))
        .unwrap();
        assert_eq!(chunk.tool_calls.len(), 1);
        assert_eq!(chunk.tool_calls[0].name.as_deref(), Some("lookup"));
        assert_eq!(chunk.tool_calls[0].arguments, "{\"id\":");
    }

    #[test]
    fn test_parse_usage_only_chunk() {
        let chunk = parse_chat_chunk(&json!({
            "choices": [],
            "usage": { "prompt_tokens": 10, "completion_tokens": 3, "total_tokens": 13 }
        }))
        .unwrap();
        assert!(chunk.content.is_none());
        assert_eq!(chunk.usage.unwrap().total_tokens, 13);
    }

    #[test]
    fn test_parse_error_event() {
        let err = parse_chat_chunk(&json!({
            "error": { "code": "429", "message": "rate limited" }
        }))
        .unwrap_err();
        assert_eq!(err.status, Some(429));
        assert_eq!(err.message, "rate limited");
    }

    #[tokio::test]
    async fn test_sse_stream_reassembles_split_lines() {
        let body = body_from(vec![
            ": keep-alive\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\ndata: {\"choi",
            "ces\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
        ]);
        let chunks: Vec<ChatChunk> = sse_chunks(body)
            .map(|c| c.unwrap())
            .collect()
            .await;
        let text: String = chunks
            .iter()
            .filter_map(|c| c.content.as_ref().map(|c| c.text()))
            .collect();
        assert_eq!(text, "Hello");
    }

    #[tokio::test]
    async fn test_sse_stream_handles_unterminated_last_line() {
        let body = body_from(vec!["data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}"]);
        let chunks: Vec<_> = sse_chunks(body).collect().await;
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_azure_chat_requires_key() {
        let cfg = ProviderConfig {
            provider: "azure".to_string(),
            deployment: Some("gpt-4o".to_string()),
            endpoint: Some("https://acme.openai.azure.com".to_string()),
            ..ProviderConfig::default()
        };
        let err = OpenAICompatibleChat::new(&cfg, None, Duration::from_secs(5))
            .err()
            .unwrap();
        assert!(matches!(err, ContextKitError::Configuration(_)));
    }

    #[test]
    fn test_ollama_body_includes_model() {
        let cfg = ProviderConfig {
            provider: "ollama".to_string(),
            model: Some("llama3".to_string()),
            max_tokens: Some(256),
            ..ProviderConfig::default()
        };
        let chat = OpenAICompatibleChat::new(&cfg, None, Duration::from_secs(5)).unwrap();
        let body = chat.request_body(&[ChatMessage::user("hi")]);
        assert_eq!(body["model"], "llama3");
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(chat.url, "http://localhost:11434/v1/chat/completions");
    }
}
