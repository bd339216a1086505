//! Token-budgeted message window.

use std::collections::VecDeque;
use std::iter;

use chatbot_core::{Llm, Message, Role};
use tracing::debug;

use crate::error::{ContextError, ContextResult};
use crate::serialize::{effective_content, PromptFormat};
use crate::tokenizer::{AllowedSpecial, Tokenizer};

/// Messages selected for one completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowResult {
    pub system_prompt: Message,
    /// Contiguous suffix of the history, oldest first.
    pub messages: Vec<Message>,
    /// Completion budget to request from the provider.
    pub max_token: i64,
    /// Tokens used by the serialized prompt.
    pub token_count: usize,
}

impl WindowResult {
    /// The system prompt followed by the selected history.
    pub fn request_messages(&self) -> Vec<Message> {
        iter::once(self.system_prompt.clone())
            .chain(self.messages.iter().cloned())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// The completion budget, or `MessageTooLong` when nothing from the
    /// history fits or no room is left for an answer.
    pub fn completion_budget(&self) -> ContextResult<u32> {
        if self.messages.is_empty() || self.max_token <= 0 {
            return Err(ContextError::MessageTooLong);
        }
        Ok(u32::try_from(self.max_token).unwrap_or(u32::MAX))
    }
}

/// Selects the newest messages of `history` that fit `model.token_limit`
/// together with the system prompt and `reserved_for_completion`.
///
/// The system prompt is always kept. Selection stops at the first message
/// that does not fit, so older messages are never skipped over.
pub fn build_window(
    tokenizer: &dyn Tokenizer,
    model: &Llm,
    system_prompt: &str,
    reserved_for_completion: usize,
    history: &[Message],
) -> ContextResult<WindowResult> {
    let format = PromptFormat::for_model(model);
    let mut included: VecDeque<(Role, String)> = VecDeque::new();
    let mut start = history.len();
    let mut content_length = 0usize;

    for (index, message) in history.iter().enumerate().rev() {
        let candidate = (message.role, effective_content(message)?);
        let turns = iter::once((Role::System, system_prompt))
            .chain(iter::once((candidate.0, candidate.1.as_str())))
            .chain(included.iter().map(|(role, content)| (*role, content.as_str())));
        let length = tokenizer.count(&format.render(turns), &AllowedSpecial::All);

        if length + reserved_for_completion > model.token_limit {
            debug!(
                model = %model.id,
                tokens = length,
                reserved = reserved_for_completion,
                dropped = index + 1,
                "window limit reached"
            );
            break;
        }

        content_length = length;
        start = index;
        included.push_front(candidate);
    }

    let token_limit = to_i64(model.token_limit);
    let output_limit = to_i64(model.output_token_limit.unwrap_or(model.token_limit));
    let max_token = (token_limit - to_i64(content_length)).min(output_limit);

    debug!(
        model = %model.id,
        messages = history.len() - start,
        tokens = content_length,
        max_token,
        "window built"
    );

    Ok(WindowResult {
        system_prompt: Message::system(system_prompt),
        messages: history[start..].to_vec(),
        max_token,
        token_count: content_length,
    })
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
