//! Canonical prompt serialization.
//!
//! The text produced here is both what gets tokenized for budgeting and
//! what a completion-style provider receives, so the two never diverge.

use chatbot_core::{Llm, LlmType, Message, Role};

use crate::error::ContextResult;

/// A message's text followed by the decoded body of each attachment.
pub fn effective_content(message: &Message) -> ContextResult<String> {
    let mut content = message.content.clone();
    for attachment in &message.attachments {
        let body = attachment.decoded_text()?;
        content.push_str("\n\n");
        content.push_str(&format!(
            "The following text between <<< and >>> are the contents of the file attachment named {}:\n      <<< {} >>>",
            attachment.name, body
        ));
    }
    Ok(content)
}

/// Textual layout of a prompt for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptFormat {
    /// `<|im_start|>role…<|im_end|>` turns ending in an open assistant turn.
    ChatMl { chat: bool },
    /// `role: content` lines.
    Plain,
}

impl PromptFormat {
    /// ChatML applies to known GPT models only.
    pub fn for_model(model: &Llm) -> Self {
        match Llm::known(&model.id) {
            Some(known) if model.id.to_lowercase().contains("gpt") => Self::ChatMl {
                chat: known.kind == LlmType::Chat,
            },
            _ => Self::Plain,
        }
    }

    /// Renders `(role, effective content)` turns.
    pub fn render<'a, I>(&self, turns: I) -> String
    where
        I: IntoIterator<Item = (Role, &'a str)>,
    {
        match *self {
            Self::ChatMl { chat } => {
                let (message_sep, role_sep) = if chat { ("\n", "\n") } else { ("", "<|im_sep|>") };
                let mut parts: Vec<String> = turns
                    .into_iter()
                    .map(|(role, content)| format!("<|im_start|>{role}{role_sep}{content}<|im_end|>"))
                    .collect();
                parts.push(format!("<|im_start|>assistant{role_sep}"));
                parts.join(message_sep)
            }
            Self::Plain => turns
                .into_iter()
                .map(|(role, content)| format!("{role}: {content}"))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn serialize<'a, I>(&self, messages: I) -> ContextResult<String>
    where
        I: IntoIterator<Item = &'a Message>,
    {
        let contents = messages
            .into_iter()
            .map(|message| Ok((message.role, effective_content(message)?)))
            .collect::<ContextResult<Vec<_>>>()?;
        Ok(self.render(contents.iter().map(|(role, content)| (*role, content.as_str()))))
    }
}

/// Serializes messages in the canonical format of `model`.
pub fn serialize_messages(model: &Llm, messages: &[Message]) -> ContextResult<String> {
    PromptFormat::for_model(model).serialize(messages)
}
