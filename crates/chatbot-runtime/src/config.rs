//! Runtime configuration read from the environment.

use std::collections::HashMap;
use std::str::FromStr;

use chatbot_core::model::{FALLBACK_EMBEDDINGS_MODEL_ID, FALLBACK_MODEL_ID};
use chatbot_core::Llm;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_OPENAI_API_HOST: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_API_VERSION: &str = "2023-05-15";
pub const DEFAULT_RESERVED_FOR_COMPLETION: usize = 1000;
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are ChatGPT, a large language model trained by OpenAI. Follow the user's instructions carefully. Respond using markdown.";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
    #[error("missing required setting {key}")]
    Missing { key: &'static str },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OpenAiApiType {
    #[default]
    OpenAi,
    Azure,
}

impl OpenAiApiType {
    pub fn as_str(self) -> &'static str {
        match self {
            OpenAiApiType::OpenAi => "openai",
            OpenAiApiType::Azure => "azure",
        }
    }
}

impl FromStr for OpenAiApiType {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(OpenAiApiType::OpenAi),
            "azure" => Ok(OpenAiApiType::Azure),
            _ => Err(ConfigError::Invalid {
                key: "OPENAI_API_TYPE",
                value: value.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub openai_api_key: Option<String>,
    pub openai_api_type: OpenAiApiType,
    pub openai_api_host: String,
    pub openai_api_version: String,
    /// `(model id, deployment id)` pairs, in configuration order.
    pub azure_deployments: Vec<(String, String)>,
    pub ollama_url: Option<String>,
    pub default_model: String,
    pub default_embeddings_model: String,
    pub default_system_prompt: String,
    /// Negative means unlimited.
    pub default_user_limit_usd_monthly: f64,
    pub model_migrations: HashMap<String, String>,
    pub reserved_for_completion: usize,
    pub audit_log_enabled: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            openai_api_type: OpenAiApiType::OpenAi,
            openai_api_host: DEFAULT_OPENAI_API_HOST.to_string(),
            openai_api_version: DEFAULT_OPENAI_API_VERSION.to_string(),
            azure_deployments: Vec::new(),
            ollama_url: None,
            default_model: FALLBACK_MODEL_ID.to_string(),
            default_embeddings_model: FALLBACK_EMBEDDINGS_MODEL_ID.to_string(),
            default_system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            default_user_limit_usd_monthly: -1.0,
            model_migrations: HashMap::new(),
            reserved_for_completion: DEFAULT_RESERVED_FOR_COMPLETION,
            audit_log_enabled: false,
        }
    }
}

impl RuntimeConfig {
    /// Loads `.env` when present, then reads the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Err(err) = dotenvy::dotenv() {
            if !err.not_found() {
                warn!(error = %err, "failed to load .env file");
            }
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Parses configuration from an arbitrary key lookup. Empty values
    /// count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let mut config = Self::default();

        config.openai_api_key = get("OPENAI_API_KEY");
        if let Some(value) = get("OPENAI_API_TYPE") {
            config.openai_api_type = value.parse()?;
        }
        match get("OPENAI_API_HOST") {
            Some(host) => config.openai_api_host = host,
            None if config.openai_api_type == OpenAiApiType::Azure
                && config.openai_api_key.is_some() =>
            {
                return Err(ConfigError::Missing {
                    key: "OPENAI_API_HOST",
                });
            }
            None => {}
        }
        if let Some(version) = get("OPENAI_API_VERSION") {
            config.openai_api_version = version;
        }
        if let Some(value) = get("AZURE_OPENAI_DEPLOYMENTS") {
            config.azure_deployments = parse_pairs(&value)
                .into_iter()
                .filter(|(model_id, _)| Llm::is_known(model_id))
                .collect();
        }
        config.ollama_url = get("OLLAMA_URL");

        if let Some(model) = get("DEFAULT_MODEL").filter(|id| Llm::is_known(id)) {
            config.default_model = model;
        }
        if let Some(model) = get("DEFAULT_MODEL_EMBEDDINGS").filter(|id| Llm::is_known(id)) {
            config.default_embeddings_model = model;
        }
        if let Some(prompt) = get("DEFAULT_SYSTEM_PROMPT") {
            config.default_system_prompt = prompt;
        }
        if let Some(value) = get("DEFAULT_USER_LIMIT_USD_MONTHLY") {
            config.default_user_limit_usd_monthly =
                value.parse().map_err(|_| ConfigError::Invalid {
                    key: "DEFAULT_USER_LIMIT_USD_MONTHLY",
                    value,
                })?;
        }
        if let Some(value) = get("MODEL_MIGRATIONS") {
            config.model_migrations = parse_pairs(&value)
                .into_iter()
                .filter(|(from, to)| Llm::is_known(from) && Llm::is_known(to))
                .collect();
        }
        if let Some(value) = get("RESERVED_FOR_COMPLETION") {
            config.reserved_for_completion = value.parse().map_err(|_| ConfigError::Invalid {
                key: "RESERVED_FOR_COMPLETION",
                value,
            })?;
        }
        config.audit_log_enabled = get("AUDIT_LOG_ENABLED").is_some_and(|value| value == "true");

        Ok(config)
    }

    pub fn openai_enabled(&self) -> bool {
        self.openai_api_key.is_some()
    }

    pub fn azure_deployment(&self, model_id: &str) -> Option<&str> {
        self.azure_deployments
            .iter()
            .find(|(id, _)| id == model_id)
            .map(|(_, deployment)| deployment.as_str())
    }
}

/// Parses `a:b,c:d`. An entry without `:` maps to itself.
fn parse_pairs(value: &str) -> Vec<(String, String)> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((key, value)) => (key.trim().to_string(), value.trim().to_string()),
            None => (entry.to_string(), entry.to_string()),
        })
        .collect()
}
