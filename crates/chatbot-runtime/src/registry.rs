//! Model registry over all configured LLM backends.
//!
//! Backends are consulted in registration order: when two serve the same
//! model id, the first one wins.

use std::collections::HashMap;
use std::sync::Arc;

use chatbot_core::Llm;
use futures::future::join_all;
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::providers::{OllamaApi, OpenAiApi};
use crate::{LlmApi, ProviderError};

pub struct LlmApiAggregator {
    apis: Vec<Arc<dyn LlmApi>>,
    migrations: HashMap<String, String>,
}

impl LlmApiAggregator {
    pub fn new(apis: Vec<Arc<dyn LlmApi>>) -> Self {
        Self {
            apis,
            migrations: HashMap::new(),
        }
    }

    /// Backends enabled by `config`: OpenAI or Azure first, then Ollama.
    pub fn from_config(config: &RuntimeConfig) -> Self {
        let mut apis: Vec<Arc<dyn LlmApi>> = Vec::new();
        if let Some(api) = OpenAiApi::from_config(config) {
            apis.push(Arc::new(api));
        }
        if let Some(api) = OllamaApi::from_config(config) {
            apis.push(Arc::new(api));
        }
        Self::new(apis).with_migrations(config.model_migrations.clone())
    }

    /// `old id -> new id` replacements applied by `resolve_model_id`.
    pub fn with_migrations(mut self, migrations: HashMap<String, String>) -> Self {
        self.migrations = migrations;
        self
    }

    pub fn apis(&self) -> &[Arc<dyn LlmApi>] {
        &self.apis
    }

    /// Initializes every backend concurrently. A backend that fails to
    /// initialize is logged and serves no models; the others stay usable.
    pub async fn init(&self) -> Result<(), ProviderError> {
        let results = join_all(self.apis.iter().map(|api| api.init())).await;

        let mut failures = Vec::new();
        for (api, result) in self.apis.iter().zip(results) {
            match result {
                Ok(()) => info!(
                    provider = api.name(),
                    models = api.list_models().len(),
                    "provider ready"
                ),
                Err(err) => {
                    warn!(provider = api.name(), error = %err, "provider init failed");
                    failures.push(err);
                }
            }
        }

        if !self.apis.is_empty() && failures.len() == self.apis.len() {
            return Err(failures.remove(0));
        }
        Ok(())
    }

    /// All models, without duplicate ids.
    pub fn list_models(&self) -> Vec<Llm> {
        let mut models: Vec<Llm> = Vec::new();
        for model in self.apis.iter().flat_map(|api| api.list_models()) {
            if !models.iter().any(|known| known.id == model.id) {
                models.push(model);
            }
        }
        models
    }

    pub fn get_model(&self, model_id: &str) -> Result<Llm, ProviderError> {
        self.apis
            .iter()
            .flat_map(|api| api.list_models())
            .find(|model| model.id == model_id)
            .ok_or_else(|| ProviderError::ModelNotFound(model_id.to_string()))
    }

    pub fn api_for_model(&self, model_id: &str) -> Result<Arc<dyn LlmApi>, ProviderError> {
        self.apis
            .iter()
            .find(|api| api.list_models().iter().any(|model| model.id == model_id))
            .cloned()
            .ok_or_else(|| ProviderError::ModelNotFound(model_id.to_string()))
    }

    /// Applies a configured migration, if any. Not transitive.
    pub fn resolve_model_id<'a>(&'a self, model_id: &'a str) -> &'a str {
        self.migrations
            .get(model_id)
            .map(String::as_str)
            .unwrap_or(model_id)
    }
}
