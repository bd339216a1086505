//! LLM backend implementations
//!
//! Concrete implementations of the `LlmApi` trait for OpenAI, Azure OpenAI
//! and Ollama, plus the wire helpers they share.

pub mod ollama;
pub mod openai;

use std::time::Duration;

use chatbot_context::effective_content;
use chatbot_core::Message;
use reqwest::{Client, StatusCode};
use serde::Serialize;

use crate::ProviderError;

pub use ollama::OllamaApi;
pub use openai::OpenAiApi;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

pub(crate) fn http_client() -> Client {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_default()
}

/// A message as sent to chat endpoints, attachments inlined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct WireMessage {
    pub role: &'static str,
    pub content: String,
}

pub(crate) fn wire_messages(messages: &[Message]) -> Result<Vec<WireMessage>, ProviderError> {
    messages
        .iter()
        .map(|message| {
            Ok(WireMessage {
                role: message.role.as_str(),
                content: effective_content(message)
                    .map_err(|err| ProviderError::Message(err.to_string()))?,
            })
        })
        .collect()
}

/// Maps a non-success response to `HttpStatus`, preferring the error
/// message from `{"error": {"message": ..}}` or `{"error": ".."}` bodies.
pub(crate) async fn error_from_response(
    status: StatusCode,
    response: reqwest::Response,
) -> ProviderError {
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unable to read body>".to_string());

    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|value| {
            let error = value.get("error")?;
            error
                .get("message")
                .and_then(serde_json::Value::as_str)
                .or_else(|| error.as_str())
                .map(str::to_string)
        })
        .unwrap_or(body);

    ProviderError::HttpStatus {
        status: status.as_u16(),
        body: message,
    }
}

#[cfg(test)]
pub(crate) fn network_tests_enabled() -> bool {
    matches!(std::env::var("CHATBOT_RUN_NETWORK_TESTS"), Ok(value) if value == "1")
}

#[cfg(test)]
mod tests {
    use chatbot_core::Attachment;

    use super::*;

    #[test]
    fn wire_messages_inline_attachments() {
        let messages = vec![
            Message::system("Be brief."),
            Message::user("Summarize")
                .with_attachment(Attachment::from_text("a.txt", "text/plain", "alpha")),
        ];

        let wire = wire_messages(&messages).unwrap();

        assert_eq!(wire[0].role, "system");
        assert_eq!(wire[1].role, "user");
        assert!(wire[1].content.starts_with("Summarize\n\nThe following text"));
        assert!(wire[1].content.ends_with("<<< alpha >>>"));
    }

    #[test]
    fn wire_messages_reject_broken_attachments() {
        let mut attachment = Attachment::from_text("a.txt", "text/plain", "x");
        attachment.content = "!!".to_string();

        let err = wire_messages(&[Message::user("hi").with_attachment(attachment)]).unwrap_err();
        assert!(matches!(err, ProviderError::Message(_)));
    }
}
