//! Model metadata and the catalog of models the application knows how to
//! budget for.

use serde::{Deserialize, Serialize};

/// Chat model used when the configured default is missing or unknown
pub const FALLBACK_MODEL_ID: &str = "gpt-3.5-turbo";
/// Embeddings model used when the configured default is missing or unknown
pub const FALLBACK_EMBEDDINGS_MODEL_ID: &str = "text-embedding-ada-002";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmType {
    Chat,
    Completion,
    Embedding,
}

/// Model metadata.
///
/// `token_limit` bounds prompt and completion tokens combined.
/// `output_token_limit`, when present, additionally caps the completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Llm {
    pub id: String,
    pub name: String,
    /// Maximum length of a single message, in characters.
    pub max_length: usize,
    pub token_limit: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_token_limit: Option<usize>,
    #[serde(rename = "type")]
    pub kind: LlmType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure_deployment_id: Option<String>,
}

impl Llm {
    pub fn new(id: impl Into<String>, token_limit: usize, kind: LlmType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            max_length: token_limit * 3,
            token_limit,
            output_token_limit: None,
            kind,
            azure_deployment_id: None,
        }
    }

    pub fn with_output_token_limit(mut self, limit: usize) -> Self {
        self.output_token_limit = Some(limit);
        self
    }

    pub fn with_azure_deployment(mut self, deployment_id: impl Into<String>) -> Self {
        self.azure_deployment_id = Some(deployment_id.into());
        self
    }

    pub fn is_chat(&self) -> bool {
        self.kind == LlmType::Chat
    }

    /// Looks up a model in the catalog of known models.
    pub fn known(id: &str) -> Option<Self> {
        CATALOG.iter().find(|entry| entry.id == id).map(Self::from)
    }

    pub fn is_known(id: &str) -> bool {
        CATALOG.iter().any(|entry| entry.id == id)
    }

    /// All known models, in catalog order.
    pub fn catalog() -> Vec<Self> {
        CATALOG.iter().map(Self::from).collect()
    }
}

struct CatalogEntry {
    id: &'static str,
    name: &'static str,
    max_length: usize,
    token_limit: usize,
    output_token_limit: Option<usize>,
    kind: LlmType,
}

impl From<&CatalogEntry> for Llm {
    fn from(entry: &CatalogEntry) -> Self {
        Self {
            id: entry.id.to_string(),
            name: entry.name.to_string(),
            max_length: entry.max_length,
            token_limit: entry.token_limit,
            output_token_limit: entry.output_token_limit,
            kind: entry.kind,
            azure_deployment_id: None,
        }
    }
}

const fn chat(
    id: &'static str,
    name: &'static str,
    token_limit: usize,
    output_token_limit: Option<usize>,
) -> CatalogEntry {
    CatalogEntry {
        id,
        name,
        max_length: token_limit * 3,
        token_limit,
        output_token_limit,
        kind: LlmType::Chat,
    }
}

const CATALOG: &[CatalogEntry] = &[
    chat("gpt-3.5-turbo", "GPT-3.5_4K", 4000, None),
    chat("gpt-3.5-turbo-16k", "GPT-3.5_16K", 16000, None),
    chat("gpt-3.5-turbo-1106", "GPT-3.5_16K", 16000, Some(4096)),
    chat("gpt-3.5-turbo-0125", "GPT-3.5_16K", 16000, Some(4096)),
    chat("gpt-35-turbo", "GPT-3.5_4K", 4000, None),
    chat("gpt-35-turbo-16k", "GPT-3.5_16K", 16000, None),
    chat("gpt-35-turbo-1106", "GPT-3.5_16K", 16000, Some(4096)),
    chat("gpt-35-turbo-0125", "GPT-3.5_16K", 16000, Some(4096)),
    chat("gpt-4", "GPT-4_8K", 8000, None),
    chat("gpt-4-32k", "GPT-4_32K", 32000, None),
    chat("gpt-4-1106-preview", "GPT-4-TURBO_128K", 128_000, Some(4096)),
    chat("gpt-4-0125-preview", "GPT-4-TURBO_128K", 128_000, Some(4096)),
    CatalogEntry {
        id: "text-embedding-ada-002",
        name: "TEXT-EMBEDDING-ADA-002",
        max_length: 24000,
        token_limit: 8000,
        output_token_limit: None,
        kind: LlmType::Embedding,
    },
    chat("anthropic.claude-instant-v1", "CLAUDE-INSTANT_100K", 100_000, None),
    chat("anthropic.claude-v2", "CLAUDE-2_100K", 100_000, None),
    chat(
        "anthropic.claude-3-haiku-20240307-v1:0",
        "CLAUDE-3-HAIKU_200K",
        200_000,
        None,
    ),
    chat(
        "anthropic.claude-3-sonnet-20240229-v1:0",
        "CLAUDE-3-SONNET_200K",
        200_000,
        None,
    ),
    chat("llama2:7b", "LLAMA2-7B_4K", 4000, None),
    chat("codellama:7b", "CODELLAMA-7B_4K", 4000, None),
    chat("mistral:7b", "MISTRAL-7B_8K", 8000, None),
    chat("vicuna:7b", "VICUNA-7B_2K", 2000, None),
    chat("vicuna:7b-16k", "VICUNA-7B_16K", 16000, None),
];

/// Temperature presets offered to users
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmTemperature {
    Precise,
    #[default]
    Neutral,
    Creative,
}

impl std::str::FromStr for LlmTemperature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "precise" => Ok(Self::Precise),
            "neutral" => Ok(Self::Neutral),
            "creative" => Ok(Self::Creative),
            other => Err(format!("unknown temperature preset: {other}")),
        }
    }
}

/// Numeric sampling temperature for each preset, per provider.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureMap {
    pub precise: f32,
    pub neutral: f32,
    pub creative: f32,
}

impl TemperatureMap {
    /// Presets used by OpenAI-compatible and Ollama models.
    pub const OPENAI: Self = Self {
        precise: 0.0,
        neutral: 0.8,
        creative: 1.5,
    };

    /// Presets for providers whose temperature range is `0..=1`.
    pub const UNIT: Self = Self {
        precise: 0.0,
        neutral: 0.5,
        creative: 1.0,
    };

    pub fn value(&self, preset: LlmTemperature) -> f32 {
        match preset {
            LlmTemperature::Precise => self.precise,
            LlmTemperature::Neutral => self.neutral,
            LlmTemperature::Creative => self.creative,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_lookup_returns_limits() {
        let model = Llm::known("gpt-4-1106-preview").unwrap();
        assert_eq!(model.token_limit, 128_000);
        assert_eq!(model.output_token_limit, Some(4096));
        assert!(model.is_chat());
    }

    #[test]
    fn unknown_model_is_not_in_catalog() {
        assert!(Llm::known("gpt-5-ultra").is_none());
        assert!(!Llm::is_known("gpt-5-ultra"));
    }

    #[test]
    fn fallback_ids_are_known() {
        assert!(Llm::is_known(FALLBACK_MODEL_ID));
        assert_eq!(
            Llm::known(FALLBACK_EMBEDDINGS_MODEL_ID).unwrap().kind,
            LlmType::Embedding
        );
    }

    #[test]
    fn model_serializes_kind_as_type() {
        let json = serde_json::to_value(Llm::new("mistral:7b", 8000, LlmType::Chat)).unwrap();
        assert_eq!(json["type"], "chat");
        assert_eq!(json["tokenLimit"], 8000);
        assert!(json.get("outputTokenLimit").is_none());
    }

    #[test]
    fn temperature_presets_map_per_provider() {
        assert_eq!(TemperatureMap::OPENAI.value(LlmTemperature::Creative), 1.5);
        assert_eq!(TemperatureMap::UNIT.value(LlmTemperature::Neutral), 0.5);
        assert_eq!("Precise".parse::<LlmTemperature>(), Ok(LlmTemperature::Precise));
        assert!("hot".parse::<LlmTemperature>().is_err());
    }
}
