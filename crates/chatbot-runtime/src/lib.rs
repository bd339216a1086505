//! Runtime for LLM chat.
//!
//! Provider capability interface and implementations, the model registry,
//! chat wire events, the stream reconciler, usage metering and the chat
//! request handler.

pub mod chat;
pub mod config;
pub mod events;
pub mod metering;
pub mod providers;
pub mod reconcile;
pub mod registry;

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Mutex;

use async_trait::async_trait;
use chatbot_core::{Llm, LlmTemperature, Message, TemperatureMap};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use chat::{ChatError, ChatEventStream, ChatRequest, ChatService, Embedding};
pub use config::{ConfigError, OpenAiApiType, RuntimeConfig};
pub use events::{
    decode_event_stream, encode_event_stream, ChatEvent, EventCodecError, Utf8Decoder,
};
pub use metering::{InMemoryLedger, Meter, MeteringError, UsageLedger, UsageMode, UsageRecord};
pub use reconcile::{
    consume_byte_stream, consume_event_stream, reconcile, ReconcileError, Reconciled, StreamState,
};
pub use providers::{OllamaApi, OpenAiApi};
pub use registry::LlmApiAggregator;

/// A chat completion request for one model.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatCompletionRequest {
    pub model: Llm,
    /// System prompt first, then the windowed history.
    pub messages: Vec<Message>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<LlmTemperature>,
}

impl ChatCompletionRequest {
    pub fn new(model: Llm, messages: Vec<Message>) -> Self {
        Self {
            model,
            messages,
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: LlmTemperature) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub content: String,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamChunk {
    Delta { text: String },
    Done,
}

pub type ProviderStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingsResponse {
    pub embedding: Vec<f32>,
}

/// User-facing error code of a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    LlmRateLimitReached,
    LlmServiceOverloaded,
    ErrorDefault,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LlmRateLimitReached => "llmRateLimitReached",
            Self::LlmServiceOverloaded => "llmServiceOverloaded",
            Self::ErrorDefault => "errorDefault",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("mock provider has no queued response")]
    MockQueueEmpty,
    #[error("provider error: {0}")]
    Message(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("provider returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("failed to decode provider response: {0}")]
    Decode(String),
    #[error("model not found: {0}")]
    ModelNotFound(String),
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
}

impl ProviderError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::HttpStatus { status: 429, .. } => ErrorCode::LlmRateLimitReached,
            Self::HttpStatus { status: 503, .. } => ErrorCode::LlmServiceOverloaded,
            _ => ErrorCode::ErrorDefault,
        }
    }
}

/// Capabilities every LLM backend exposes.
#[async_trait]
pub trait LlmApi: Send + Sync {
    fn name(&self) -> &'static str;

    /// Discovers the models this backend serves. Called once at startup.
    async fn init(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    fn list_models(&self) -> Vec<Llm>;

    fn can_stream(&self, model_id: &str) -> bool;

    fn temperature(&self, preset: LlmTemperature) -> f32 {
        TemperatureMap::OPENAI.value(preset)
    }

    async fn chat_completion(
        &self,
        req: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, ProviderError>;

    async fn chat_completion_stream(
        &self,
        req: ChatCompletionRequest,
    ) -> Result<ProviderStream, ProviderError>;

    async fn create_embeddings(
        &self,
        model_id: &str,
        text: &str,
    ) -> Result<EmbeddingsResponse, ProviderError>;
}

struct MockStream {
    items: Vec<Result<StreamChunk, ProviderError>>,
    stall: bool,
}

/// Queue-driven provider for tests.
pub struct MockProvider {
    models: Vec<Llm>,
    streaming: bool,
    completion_queue: Mutex<VecDeque<Result<ChatCompletionResponse, ProviderError>>>,
    stream_queue: Mutex<VecDeque<Result<MockStream, ProviderError>>>,
    embeddings_queue: Mutex<VecDeque<Result<EmbeddingsResponse, ProviderError>>>,
    requests: Mutex<Vec<ChatCompletionRequest>>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self {
            models: Vec::new(),
            streaming: true,
            completion_queue: Mutex::default(),
            stream_queue: Mutex::default(),
            embeddings_queue: Mutex::default(),
            requests: Mutex::default(),
        }
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_models(mut self, models: Vec<Llm>) -> Self {
        self.models = models;
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn enqueue_completion(&self, result: Result<ChatCompletionResponse, ProviderError>) {
        self.completion_queue
            .lock()
            .expect("mock completion queue poisoned")
            .push_back(result);
    }

    pub fn enqueue_stream(&self, result: Result<Vec<StreamChunk>, ProviderError>) {
        let result = result.map(|chunks| MockStream {
            items: chunks.into_iter().map(Ok).collect(),
            stall: false,
        });
        self.push_stream(result);
    }

    /// Queues a stream that yields `items`, including mid-stream errors.
    pub fn enqueue_stream_items(&self, items: Vec<Result<StreamChunk, ProviderError>>) {
        self.push_stream(Ok(MockStream { items, stall: false }));
    }

    /// Queues a stream that yields `chunks` and then never ends.
    pub fn enqueue_stalled_stream(&self, chunks: Vec<StreamChunk>) {
        self.push_stream(Ok(MockStream {
            items: chunks.into_iter().map(Ok).collect(),
            stall: true,
        }));
    }

    pub fn enqueue_embeddings(&self, result: Result<EmbeddingsResponse, ProviderError>) {
        self.embeddings_queue
            .lock()
            .expect("mock embeddings queue poisoned")
            .push_back(result);
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<ChatCompletionRequest> {
        self.requests
            .lock()
            .expect("mock request log poisoned")
            .clone()
    }

    fn push_stream(&self, result: Result<MockStream, ProviderError>) {
        self.stream_queue
            .lock()
            .expect("mock stream queue poisoned")
            .push_back(result);
    }

    fn record(&self, req: ChatCompletionRequest) {
        self.requests
            .lock()
            .expect("mock request log poisoned")
            .push(req);
    }
}

#[async_trait]
impl LlmApi for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn list_models(&self) -> Vec<Llm> {
        self.models.clone()
    }

    fn can_stream(&self, _model_id: &str) -> bool {
        self.streaming
    }

    async fn chat_completion(
        &self,
        req: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, ProviderError> {
        self.record(req);
        self.completion_queue
            .lock()
            .expect("mock completion queue poisoned")
            .pop_front()
            .unwrap_or(Err(ProviderError::MockQueueEmpty))
    }

    async fn chat_completion_stream(
        &self,
        req: ChatCompletionRequest,
    ) -> Result<ProviderStream, ProviderError> {
        self.record(req);
        let next = self
            .stream_queue
            .lock()
            .expect("mock stream queue poisoned")
            .pop_front()
            .unwrap_or(Err(ProviderError::MockQueueEmpty))?;

        let items = stream::iter(next.items);
        if next.stall {
            Ok(Box::pin(items.chain(stream::pending())))
        } else {
            Ok(Box::pin(items))
        }
    }

    async fn create_embeddings(
        &self,
        _model_id: &str,
        _text: &str,
    ) -> Result<EmbeddingsResponse, ProviderError> {
        self.embeddings_queue
            .lock()
            .expect("mock embeddings queue poisoned")
            .pop_front()
            .unwrap_or(Err(ProviderError::MockQueueEmpty))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn request() -> ChatCompletionRequest {
        ChatCompletionRequest::new(
            Llm::known("gpt-3.5-turbo").unwrap(),
            vec![Message::system("Be brief."), Message::user("hello")],
        )
        .with_max_tokens(64)
        .with_temperature(LlmTemperature::Precise)
    }

    #[tokio::test]
    async fn mock_completion_returns_queued_response() {
        let provider = MockProvider::new();
        provider.enqueue_completion(Ok(ChatCompletionResponse {
            content: "hello from mock".to_string(),
            finish_reason: Some("stop".to_string()),
        }));

        let response = provider.chat_completion(request()).await.unwrap();

        assert_eq!(response.content, "hello from mock");
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
        assert_eq!(provider.requests()[0].max_tokens, Some(64));
    }

    #[tokio::test]
    async fn mock_stream_emits_chunks_in_order() {
        let provider = MockProvider::new();
        provider.enqueue_stream(Ok(vec![
            StreamChunk::Delta {
                text: "hello".to_string(),
            },
            StreamChunk::Delta {
                text: " ".to_string(),
            },
            StreamChunk::Done,
        ]));

        let mut stream = provider.chat_completion_stream(request()).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        let third = stream.next().await.unwrap().unwrap();
        let end = stream.next().await;

        assert_eq!(
            first,
            StreamChunk::Delta {
                text: "hello".to_string()
            }
        );
        assert_eq!(
            second,
            StreamChunk::Delta {
                text: " ".to_string()
            }
        );
        assert_eq!(third, StreamChunk::Done);
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn mock_reports_empty_queue_error() {
        let provider = MockProvider::new();

        let err = provider.chat_completion(request()).await.unwrap_err();

        assert_eq!(err, ProviderError::MockQueueEmpty);
    }

    #[tokio::test]
    async fn mock_stream_reports_queued_error() {
        let provider = MockProvider::new();
        provider.enqueue_stream(Err(ProviderError::Message("upstream timeout".to_string())));

        let err = provider.chat_completion_stream(request()).await.err().unwrap();

        assert_eq!(err, ProviderError::Message("upstream timeout".to_string()));
    }

    #[tokio::test]
    async fn stalled_stream_never_ends() {
        let provider = MockProvider::new();
        provider.enqueue_stalled_stream(vec![StreamChunk::Delta {
            text: "partial".to_string(),
        }]);

        let mut stream = provider.chat_completion_stream(request()).await.unwrap();
        assert!(stream.next().await.is_some());
        let timed_out = tokio::time::timeout(Duration::from_millis(20), stream.next()).await;
        assert!(timed_out.is_err());
    }

    #[test]
    fn http_status_maps_to_error_code() {
        let rate_limited = ProviderError::HttpStatus {
            status: 429,
            body: "slow down".to_string(),
        };
        let overloaded = ProviderError::HttpStatus {
            status: 503,
            body: String::new(),
        };

        assert_eq!(rate_limited.error_code(), ErrorCode::LlmRateLimitReached);
        assert_eq!(overloaded.error_code(), ErrorCode::LlmServiceOverloaded);
        assert_eq!(
            ProviderError::Transport("reset".to_string()).error_code().as_str(),
            "errorDefault"
        );
    }

    #[test]
    fn default_temperature_uses_openai_presets() {
        let provider = MockProvider::new();
        assert_eq!(provider.temperature(LlmTemperature::Creative), 1.5);
    }
}
