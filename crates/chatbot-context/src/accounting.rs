//! Token accounting for prompts and completions.
//!
//! Completion tokens are counted by re-encoding the full generated text
//! once it is known, not by summing streamed deltas. Special markers that
//! appear in generated text are counted as plain text.

use chatbot_core::{Llm, Message, TokenUsage};

use crate::error::ContextResult;
use crate::serialize::serialize_messages;
use crate::tokenizer::{AllowedSpecial, Tokenizer};

/// Tokens of the serialized prompt, as sent.
pub fn prompt_tokens(
    tokenizer: &dyn Tokenizer,
    model: &Llm,
    messages: &[Message],
) -> ContextResult<usize> {
    let serialized = serialize_messages(model, messages)?;
    Ok(tokenizer.count(&serialized, &AllowedSpecial::All))
}

/// Tokens of raw input text, e.g. an embeddings request.
pub fn text_tokens(tokenizer: &dyn Tokenizer, text: &str) -> usize {
    tokenizer.count(text, &AllowedSpecial::All)
}

/// Tokens of generated text.
pub fn completion_tokens(tokenizer: &dyn Tokenizer, generated: &str) -> usize {
    tokenizer.count(generated, &AllowedSpecial::none())
}

/// Usage of one request given the window's prompt count and the text
/// generated so far.
pub fn usage_for(tokenizer: &dyn Tokenizer, prompt_tokens: usize, generated: &str) -> TokenUsage {
    TokenUsage::new(
        saturating_u32(prompt_tokens),
        saturating_u32(completion_tokens(tokenizer, generated)),
    )
}

fn saturating_u32(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}
