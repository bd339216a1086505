//! Conversation snapshots.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::{Message, Role};
use crate::model::LlmTemperature;

/// A conversation owned by the caller.
///
/// The window builder and the stream reconciler take a snapshot and hand
/// back a new one; neither keeps a reference across calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub name: String,
    pub model_id: String,
    /// System prompt of the conversation. Empty means the configured default.
    pub prompt: String,
    #[serde(default)]
    pub temperature: LlmTemperature,
    #[serde(default)]
    pub folder_id: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn new(model_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: "New Conversation".to_string(),
            model_id: model_id.into(),
            prompt: prompt.into(),
            temperature: LlmTemperature::default(),
            folder_id: None,
            messages: Vec::new(),
        }
    }

    pub fn with_temperature(mut self, temperature: LlmTemperature) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// The trailing message, when it is an assistant reply.
    pub fn trailing_assistant_mut(&mut self) -> Option<&mut Message> {
        self.messages
            .last_mut()
            .filter(|message| message.role == Role::Assistant)
    }
}
