//! Chat request handler.
//!
//! Validates a request, fits the history into the model's window, calls the
//! provider and turns its reply into `newToken` events followed by one
//! `stats` event. Usage is metered once the reply has ended.

use std::pin::Pin;
use std::sync::Arc;

use chatbot_context::{build_window, text_tokens, usage_for, ContextError, Tokenizers};
use chatbot_core::{Conversation, LlmTemperature, Message, MessageUsage, TokenUsage};
use futures::stream::{self, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::events::ChatEvent;
use crate::metering::{Meter, MeteringError, UsageMode};
use crate::registry::LlmApiAggregator;
use crate::{ChatCompletionRequest, ProviderError, ProviderStream, StreamChunk};

pub type ChatEventStream = Pin<Box<dyn Stream<Item = Result<ChatEvent, ChatError>> + Send>>;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Uh-oh! You've reached the monthly API limit. Please reach out to the admin team for assistance.")]
    BudgetExhausted,
    #[error("model not found: {0}")]
    ModelNotFound(String),
    #[error("message is too long")]
    MessageTooLong,
    #[error(transparent)]
    Context(ContextError),
    #[error(transparent)]
    Provider(ProviderError),
    #[error(transparent)]
    Metering(MeteringError),
}

impl ChatError {
    /// HTTP status a web front end would answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            ChatError::BudgetExhausted => 429,
            ChatError::ModelNotFound(_) => 404,
            ChatError::MessageTooLong => 400,
            ChatError::Provider(ProviderError::HttpStatus { status, .. }) => *status,
            ChatError::Provider(ProviderError::ModelNotFound(_)) => 404,
            _ => 500,
        }
    }
}

impl From<MeteringError> for ChatError {
    fn from(err: MeteringError) -> Self {
        match err {
            MeteringError::BudgetExhausted => ChatError::BudgetExhausted,
            other => ChatError::Metering(other),
        }
    }
}

impl From<ContextError> for ChatError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::MessageTooLong => ChatError::MessageTooLong,
            other => ChatError::Context(other),
        }
    }
}

impl From<ProviderError> for ChatError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::ModelNotFound(id) => ChatError::ModelNotFound(id),
            other => ChatError::Provider(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub user_id: String,
    pub model_id: String,
    /// Conversation history, oldest first, ending with the new user turn.
    pub messages: Vec<Message>,
    /// System prompt. The configured default applies when unset or blank.
    pub prompt: Option<String>,
    pub temperature: Option<LlmTemperature>,
}

impl ChatRequest {
    pub fn new(
        user_id: impl Into<String>,
        model_id: impl Into<String>,
        messages: Vec<Message>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            model_id: model_id.into(),
            messages,
            prompt: None,
            temperature: None,
        }
    }

    pub fn from_conversation(user_id: impl Into<String>, conversation: &Conversation) -> Self {
        Self {
            user_id: user_id.into(),
            model_id: conversation.model_id.clone(),
            messages: conversation.messages.clone(),
            prompt: Some(conversation.prompt.clone()),
            temperature: Some(conversation.temperature),
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_temperature(mut self, temperature: LlmTemperature) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// An embedding vector and the metered usage of computing it.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub embedding: Vec<f32>,
    pub usage: MessageUsage,
}

#[derive(Clone)]
pub struct ChatService {
    aggregator: Arc<LlmApiAggregator>,
    meter: Meter,
    tokenizers: Tokenizers,
    config: Arc<RuntimeConfig>,
}

impl ChatService {
    pub fn new(aggregator: Arc<LlmApiAggregator>, meter: Meter, config: RuntimeConfig) -> Self {
        Self {
            aggregator,
            meter,
            tokenizers: Tokenizers::new(),
            config: Arc::new(config),
        }
    }

    pub fn aggregator(&self) -> &LlmApiAggregator {
        &self.aggregator
    }

    pub fn meter(&self) -> &Meter {
        &self.meter
    }

    pub fn tokenizers(&self) -> &Tokenizers {
        &self.tokenizers
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Starts a chat turn.
    ///
    /// Everything that can be rejected up front (budget, unknown model, a
    /// history that does not fit) fails here before any provider call.
    /// The returned stream yields the reply deltas and ends with the usage
    /// stats; a provider failure mid-reply ends it with that error instead
    /// and no usage is recorded.
    pub async fn chat(
        &self,
        req: ChatRequest,
        reserved_for_completion: usize,
    ) -> Result<ChatEventStream, ChatError> {
        if self.config.audit_log_enabled {
            info!(event = "chat", user = %req.user_id, model = %req.model_id, "audit");
        }

        self.meter.verify(&req.user_id).await?;

        let model_id = self.aggregator.resolve_model_id(&req.model_id).to_string();
        if model_id != req.model_id {
            debug!(from = %req.model_id, to = %model_id, "model migrated");
        }
        let model = self.aggregator.get_model(&model_id)?;
        let api = self.aggregator.api_for_model(&model.id)?;

        let tokenizer = self.tokenizers.acquire(&model.id)?;
        let prompt = req
            .prompt
            .filter(|prompt| !prompt.trim().is_empty())
            .unwrap_or_else(|| self.config.default_system_prompt.clone());

        let window = build_window(
            &tokenizer,
            &model,
            &prompt,
            reserved_for_completion,
            &req.messages,
        )?;
        let max_tokens = window.completion_budget()?;
        debug!(
            model = %model.id,
            messages = window.messages.len(),
            dropped = req.messages.len() - window.messages.len(),
            tokens = window.token_count,
            max_tokens,
            "window built"
        );

        let mut completion = ChatCompletionRequest::new(model.clone(), window.request_messages())
            .with_max_tokens(max_tokens);
        if let Some(temperature) = req.temperature {
            completion = completion.with_temperature(temperature);
        }

        let upstream: ProviderStream = if api.can_stream(&model.id) {
            api.chat_completion_stream(completion).await?
        } else {
            let response = api.chat_completion(completion).await?;
            Box::pin(stream::iter(vec![
                Ok(StreamChunk::Delta {
                    text: response.content,
                }),
                Ok(StreamChunk::Done),
            ]))
        };

        let (tx, rx) = mpsc::channel::<Result<ChatEvent, ChatError>>(32);
        let meter = self.meter.clone();
        let user_id = req.user_id;
        let prompt_tokens = window.token_count;

        tokio::spawn(async move {
            let mut upstream = upstream;
            let mut generated = String::new();
            let mut consumer_gone = false;

            loop {
                let next = tokio::select! {
                    biased;
                    _ = tx.closed() => {
                        consumer_gone = true;
                        break;
                    }
                    next = upstream.next() => next,
                };

                match next {
                    Some(Ok(StreamChunk::Delta { text })) => {
                        generated.push_str(&text);
                        if tx.send(Ok(ChatEvent::NewToken(text))).await.is_err() {
                            consumer_gone = true;
                            break;
                        }
                    }
                    Some(Ok(StreamChunk::Done)) | None => break,
                    Some(Err(err)) => {
                        warn!(model = %model.id, user = %user_id, error = %err, "provider stream failed");
                        let _ = tx.send(Err(ChatError::Provider(err))).await;
                        return;
                    }
                }
            }
            drop(upstream);

            if consumer_gone {
                debug!(model = %model.id, user = %user_id, "consumer gone, recording partial usage");
            }

            let tokens = usage_for(&tokenizer, prompt_tokens, &generated);
            drop(tokenizer);

            match meter.record(&user_id, &model.id, UsageMode::Chat, tokens).await {
                Ok(usage) => {
                    if !consumer_gone {
                        let _ = tx.send(Ok(ChatEvent::Stats(usage))).await;
                    }
                }
                Err(err) => {
                    warn!(model = %model.id, user = %user_id, error = %err, "usage not recorded");
                    if !consumer_gone {
                        let _ = tx.send(Err(err.into())).await;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    /// Embeds `text` with `model_id`, or the configured embeddings model.
    pub async fn create_embeddings(
        &self,
        user_id: &str,
        model_id: Option<&str>,
        text: &str,
    ) -> Result<Embedding, ChatError> {
        if self.config.audit_log_enabled {
            info!(event = "embeddings", user = user_id, "audit");
        }

        self.meter.verify(user_id).await?;

        let requested = model_id.unwrap_or(&self.config.default_embeddings_model);
        let model_id = self.aggregator.resolve_model_id(requested);
        let model = self.aggregator.get_model(model_id)?;
        let api = self.aggregator.api_for_model(&model.id)?;

        let prompt_tokens = {
            let tokenizer = self.tokenizers.acquire(&model.id)?;
            text_tokens(&tokenizer, text)
        };

        let response = api.create_embeddings(&model.id, text).await?;
        let tokens = TokenUsage::new(u32::try_from(prompt_tokens).unwrap_or(u32::MAX), 0);
        let usage = self
            .meter
            .record(user_id, &model.id, UsageMode::Embedding, tokens)
            .await?;

        Ok(Embedding {
            embedding: response.embedding,
            usage,
        })
    }
}
