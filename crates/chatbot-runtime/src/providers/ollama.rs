//! Ollama backend
//!
//! Talks to a local Ollama server. Streaming replies arrive as
//! newline-delimited JSON objects.

use std::sync::RwLock;

use async_trait::async_trait;
use chatbot_core::Llm;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

use crate::config::RuntimeConfig;
use crate::providers::{error_from_response, http_client, wire_messages, WireMessage};
use crate::{
    ChatCompletionRequest, ChatCompletionResponse, EmbeddingsResponse, LlmApi, ProviderError,
    ProviderStream, StreamChunk,
};

#[derive(Debug)]
pub struct OllamaApi {
    client: reqwest::Client,
    base_url: String,
    models: RwLock<Vec<Llm>>,
}

impl OllamaApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.into(),
            models: RwLock::new(Vec::new()),
        }
    }

    /// `None` when `OLLAMA_URL` is not set.
    pub fn from_config(config: &RuntimeConfig) -> Option<Self> {
        config.ollama_url.as_deref().map(Self::new)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn payload(&self, req: &ChatCompletionRequest, stream: bool) -> Result<ChatBody, ProviderError> {
        Ok(ChatBody {
            model: req.model.id.clone(),
            messages: wire_messages(&req.messages)?,
            stream,
            options: ChatOptions {
                temperature: req.temperature.map(|preset| self.temperature(preset)),
                num_predict: req.max_tokens,
            },
        })
    }

    async fn post_chat(&self, payload: &ChatBody) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(self.endpoint("/api/chat"))
            .json(payload)
            .send()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(error_from_response(status, response).await);
        }
        Ok(response)
    }
}

#[async_trait]
impl LlmApi for OllamaApi {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn init(&self) -> Result<(), ProviderError> {
        let response = self
            .client
            .get(self.endpoint("/api/tags"))
            .send()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(error_from_response(status, response).await);
        }

        let tags: TagList = response
            .json()
            .await
            .map_err(|err| ProviderError::Decode(err.to_string()))?;

        let mut models: Vec<Llm> = Vec::new();
        for tag in tags.models {
            if models.iter().any(|model| model.id == tag.name) {
                continue;
            }
            if let Some(model) = Llm::known(&tag.name) {
                models.push(model);
            }
        }

        info!(provider = "ollama", models = models.len(), "models discovered");
        if let Ok(mut guard) = self.models.write() {
            *guard = models;
        }
        Ok(())
    }

    fn list_models(&self) -> Vec<Llm> {
        self.models
            .read()
            .map(|models| models.clone())
            .unwrap_or_default()
    }

    fn can_stream(&self, _model_id: &str) -> bool {
        true
    }

    async fn chat_completion(
        &self,
        req: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, ProviderError> {
        let payload = self.payload(&req, false)?;
        let response = self.post_chat(&payload).await?;

        let body: ChatLine = response
            .json()
            .await
            .map_err(|err| ProviderError::Decode(err.to_string()))?;

        if let Some(error) = body.error {
            return Err(ProviderError::Message(error));
        }

        Ok(ChatCompletionResponse {
            content: body.message.map(|message| message.content).unwrap_or_default(),
            finish_reason: body.done_reason,
        })
    }

    async fn chat_completion_stream(
        &self,
        req: ChatCompletionRequest,
    ) -> Result<ProviderStream, ProviderError> {
        let payload = self.payload(&req, true)?;
        let response = self.post_chat(&payload).await?;

        let model_id = req.model.id;
        let (tx, rx) = mpsc::channel::<Result<StreamChunk, ProviderError>>(32);
        tokio::spawn(async move {
            pump_ndjson(response.bytes_stream(), &tx).await;
            if tx.is_closed() {
                debug!(model = %model_id, "stream consumer dropped");
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn create_embeddings(
        &self,
        model_id: &str,
        text: &str,
    ) -> Result<EmbeddingsResponse, ProviderError> {
        let response = self
            .client
            .post(self.endpoint("/api/embeddings"))
            .json(&EmbeddingsBody {
                model: model_id,
                prompt: text,
            })
            .send()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(error_from_response(status, response).await);
        }

        let body: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::Decode(err.to_string()))?;
        Ok(body)
    }
}

/// Reads an NDJSON reply body into `tx` until the final object, an error,
/// or the consumer going away. A body that ends before an object with
/// `done` set is a transport failure.
async fn pump_ndjson<S, E>(body: S, tx: &mpsc::Sender<Result<StreamChunk, ProviderError>>)
where
    S: futures::Stream<Item = Result<bytes::Bytes, E>>,
    E: std::fmt::Display,
{
    let mut body = std::pin::pin!(body);
    let mut buffer: Vec<u8> = Vec::new();

    while let Some(next) = body.next().await {
        let bytes = match next {
            Ok(bytes) => bytes,
            Err(err) => {
                let _ = tx.send(Err(ProviderError::Transport(err.to_string()))).await;
                return;
            }
        };
        buffer.extend_from_slice(&bytes);

        while let Some(newline) = buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = buffer.drain(..=newline).collect();
            if !forward(tx, parse_line(&line)).await {
                return;
            }
        }
    }

    // Trailing object without a final newline.
    if !forward(tx, parse_line(&buffer)).await {
        return;
    }
    let _ = tx
        .send(Err(ProviderError::Transport(
            "stream ended before completion".to_string(),
        )))
        .await;
}

/// Sends what one line produced. Returns `false` once nothing more
/// should be read.
async fn forward(
    tx: &mpsc::Sender<Result<StreamChunk, ProviderError>>,
    outcome: LineOutcome,
) -> bool {
    match outcome {
        LineOutcome::Skip => true,
        LineOutcome::Delta(text) => tx.send(Ok(StreamChunk::Delta { text })).await.is_ok(),
        LineOutcome::Finished(text) => {
            if let Some(text) = text {
                if tx.send(Ok(StreamChunk::Delta { text })).await.is_err() {
                    return false;
                }
            }
            let _ = tx.send(Ok(StreamChunk::Done)).await;
            false
        }
        LineOutcome::Failed(err) => {
            let _ = tx.send(Err(err)).await;
            false
        }
    }
}

#[derive(Debug, PartialEq)]
enum LineOutcome {
    Skip,
    Delta(String),
    /// Last object of the reply, possibly still carrying text.
    Finished(Option<String>),
    Failed(ProviderError),
}

/// One NDJSON line of a streamed reply.
fn parse_line(line: &[u8]) -> LineOutcome {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    if line.is_empty() {
        return LineOutcome::Skip;
    }

    let parsed: ChatLine = match serde_json::from_str(line) {
        Ok(parsed) => parsed,
        Err(err) => return LineOutcome::Failed(ProviderError::Decode(err.to_string())),
    };

    if let Some(error) = parsed.error {
        return LineOutcome::Failed(ProviderError::Message(error));
    }

    let text = parsed
        .message
        .map(|message| message.content)
        .filter(|content| !content.is_empty());
    match (text, parsed.done) {
        (text, true) => LineOutcome::Finished(text),
        (Some(text), false) => LineOutcome::Delta(text),
        (None, false) => LineOutcome::Skip,
    }
}

#[derive(Debug, Serialize)]
struct ChatBody {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatLine {
    message: Option<ChatLineMessage>,
    #[serde(default)]
    done: bool,
    done_reason: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatLineMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    models: Vec<Tag>,
}

#[derive(Debug, Deserialize)]
struct Tag {
    name: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingsBody<'a> {
    model: &'a str,
    prompt: &'a str,
}
