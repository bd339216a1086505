//! OpenAI and Azure OpenAI backend
//!
//! Chat Completions with SSE streaming, model discovery and embeddings.
//! The Azure flavour addresses deployments instead of models and serves
//! the models listed in `AZURE_OPENAI_DEPLOYMENTS`.

use std::sync::RwLock;

use async_trait::async_trait;
use chatbot_core::Llm;
use futures::StreamExt;
use reqwest::RequestBuilder;
use reqwest_eventsource::{retry, Error as EventSourceError, Event, RequestBuilderExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

use crate::config::{OpenAiApiType, RuntimeConfig, DEFAULT_OPENAI_API_HOST};
use crate::providers::{error_from_response, http_client, wire_messages, WireMessage};
use crate::{
    ChatCompletionRequest, ChatCompletionResponse, EmbeddingsResponse, LlmApi, ProviderError,
    ProviderStream, StreamChunk,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Flavor {
    OpenAi,
    Azure { api_version: String },
}

#[derive(Debug)]
pub struct OpenAiApi {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    flavor: Flavor,
    models: RwLock<Vec<Llm>>,
}

impl OpenAiApi {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: http_client(),
            api_key: api_key.into(),
            base_url: DEFAULT_OPENAI_API_HOST.to_string(),
            flavor: Flavor::OpenAi,
            models: RwLock::new(Vec::new()),
        }
    }

    /// Azure OpenAI serving the given `(model id, deployment id)` pairs.
    /// Unknown model ids are skipped.
    pub fn azure(
        api_key: impl Into<String>,
        host: impl Into<String>,
        api_version: impl Into<String>,
        deployments: &[(String, String)],
    ) -> Self {
        let models = deployments
            .iter()
            .filter_map(|(model_id, deployment)| {
                Llm::known(model_id).map(|model| model.with_azure_deployment(deployment.clone()))
            })
            .collect();

        Self {
            client: http_client(),
            api_key: api_key.into(),
            base_url: host.into(),
            flavor: Flavor::Azure {
                api_version: api_version.into(),
            },
            models: RwLock::new(models),
        }
    }

    /// `None` when no API key is configured.
    pub fn from_config(config: &RuntimeConfig) -> Option<Self> {
        let api_key = config.openai_api_key.clone()?;
        Some(match config.openai_api_type {
            OpenAiApiType::OpenAi => Self::new(api_key).with_base_url(&config.openai_api_host),
            OpenAiApiType::Azure => Self::azure(
                api_key,
                &config.openai_api_host,
                &config.openai_api_version,
                &config.azure_deployments,
            ),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn is_azure(&self) -> bool {
        matches!(self.flavor, Flavor::Azure { .. })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// URL of an operation (`chat/completions`, `embeddings`) for a model.
    fn operation_url(&self, model_id: &str, operation: &str) -> Result<String, ProviderError> {
        match &self.flavor {
            Flavor::OpenAi => Ok(self.endpoint(&format!("/{operation}"))),
            Flavor::Azure { api_version } => {
                let deployment = self
                    .deployment(model_id)
                    .ok_or_else(|| ProviderError::ModelNotFound(model_id.to_string()))?;
                Ok(self.endpoint(&format!(
                    "/openai/deployments/{deployment}/{operation}?api-version={api_version}"
                )))
            }
        }
    }

    fn deployment(&self, model_id: &str) -> Option<String> {
        self.list_models()
            .into_iter()
            .find(|model| model.id == model_id)
            .and_then(|model| model.azure_deployment_id)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.flavor {
            Flavor::OpenAi => request.bearer_auth(&self.api_key),
            Flavor::Azure { .. } => request.header("api-key", &self.api_key),
        }
    }

    fn payload(
        &self,
        req: &ChatCompletionRequest,
        stream: bool,
    ) -> Result<ChatCompletionBody, ProviderError> {
        Ok(ChatCompletionBody {
            model: match self.flavor {
                Flavor::OpenAi => Some(req.model.id.clone()),
                Flavor::Azure { .. } => None,
            },
            messages: wire_messages(&req.messages)?,
            max_tokens: req.max_tokens,
            temperature: req.temperature.map(|preset| self.temperature(preset)),
            stream,
        })
    }

    fn set_models(&self, models: Vec<Llm>) {
        if let Ok(mut guard) = self.models.write() {
            *guard = models;
        }
    }
}

#[async_trait]
impl LlmApi for OpenAiApi {
    fn name(&self) -> &'static str {
        match self.flavor {
            Flavor::OpenAi => "openai",
            Flavor::Azure { .. } => "azure",
        }
    }

    async fn init(&self) -> Result<(), ProviderError> {
        if self.is_azure() {
            return Ok(());
        }

        let response = self
            .authorized(self.client.get(self.endpoint("/models")))
            .send()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(error_from_response(status, response).await);
        }

        let body: ModelList = response
            .json()
            .await
            .map_err(|err| ProviderError::Decode(err.to_string()))?;

        let mut models: Vec<Llm> = Vec::new();
        for entry in body.data {
            if models.iter().any(|model| model.id == entry.id) {
                continue;
            }
            if let Some(model) = Llm::known(&entry.id) {
                models.push(model);
            }
        }

        info!(provider = self.name(), models = models.len(), "models discovered");
        self.set_models(models);
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
        let url = self.operation_url(&req.model.id, "chat/completions")?;
        let payload = self.payload(&req, false)?;

        let response = self
            .authorized(self.client.post(url))
            .json(&payload)
            .send()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(error_from_response(status, response).await);
        }

        let body: ChatCompletionResponseBody = response
            .json()
            .await
            .map_err(|err| ProviderError::Decode(err.to_string()))?;

        let first_choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Decode("missing choice in response".to_string()))?;

        Ok(ChatCompletionResponse {
            content: first_choice.message.content.unwrap_or_default(),
            finish_reason: first_choice.finish_reason,
        })
    }

    async fn chat_completion_stream(
        &self,
        req: ChatCompletionRequest,
    ) -> Result<ProviderStream, ProviderError> {
        let url = self.operation_url(&req.model.id, "chat/completions")?;
        let payload = self.payload(&req, true)?;
        let request = self.authorized(self.client.post(url)).json(&payload);

        let mut event_source = request
            .eventsource()
            .map_err(|err| ProviderError::Transport(err.to_string()))?;
        event_source.set_retry_policy(Box::new(retry::Never));

        let model_id = req.model.id;
        let (tx, rx) = mpsc::channel::<Result<StreamChunk, ProviderError>>(32);
        tokio::spawn(async move {
            let mut done_sent = false;

            while let Some(event) = event_source.next().await {
                match event {
                    Ok(Event::Open) => continue,
                    Ok(Event::Message(message)) => {
                        if message.data == "[DONE]" {
                            let _ = tx.send(Ok(StreamChunk::Done)).await;
                            done_sent = true;
                            break;
                        }

                        let chunk = match serde_json::from_str::<ChatCompletionChunk>(&message.data) {
                            Ok(chunk) => chunk,
                            Err(err) => {
                                let _ = tx.send(Err(ProviderError::Decode(err.to_string()))).await;
                                done_sent = true;
                                break;
                            }
                        };

                        if let Some(choice) = chunk.choices.into_iter().next() {
                            if let Some(text) = choice.delta.content {
                                if !text.is_empty()
                                    && tx.send(Ok(StreamChunk::Delta { text })).await.is_err()
                                {
                                    debug!(model = %model_id, "stream consumer dropped");
                                    done_sent = true;
                                    break;
                                }
                            }

                            if choice.finish_reason.is_some() {
                                let _ = tx.send(Ok(StreamChunk::Done)).await;
                                done_sent = true;
                                break;
                            }
                        }
                    }
                    // Without `[DONE]` or a finish reason the reply is incomplete.
                    Err(EventSourceError::StreamEnded) => break,
                    Err(EventSourceError::InvalidStatusCode(status, response)) => {
                        let _ = tx.send(Err(error_from_response(status, response).await)).await;
                        done_sent = true;
                        break;
                    }
                    Err(err) => {
                        let _ = tx.send(Err(ProviderError::Transport(err.to_string()))).await;
                        done_sent = true;
                        break;
                    }
                }
            }

            event_source.close();
            if !done_sent {
                let _ = tx
                    .send(Err(ProviderError::Transport(
                        "stream ended before completion".to_string(),
                    )))
                    .await;
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn create_embeddings(
        &self,
        model_id: &str,
        text: &str,
    ) -> Result<EmbeddingsResponse, ProviderError> {
        let url = self.operation_url(model_id, "embeddings")?;
        let payload = EmbeddingsBody {
            model: match self.flavor {
                Flavor::OpenAi => Some(model_id.to_string()),
                Flavor::Azure { .. } => None,
            },
            input: text.to_string(),
        };

        let response = self
            .authorized(self.client.post(url))
            .json(&payload)
            .send()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(error_from_response(status, response).await);
        }

        let body: EmbeddingsResponseBody = response
            .json()
            .await
            .map_err(|err| ProviderError::Decode(err.to_string()))?;

        let embedding = body
            .data
            .into_iter()
            .next()
            .map(|data| data.embedding)
            .ok_or_else(|| ProviderError::Decode("missing embedding in response".to_string()))?;

        Ok(EmbeddingsResponse { embedding })
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponseBody {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingsBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    input: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponseBody {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}
