//! Chatbot Context - token-budgeted message windows
//!
//! This crate provides:
//! - Tokenizers per model family, handed out as scoped leases
//! - Effective-content and canonical prompt serialization
//! - The window builder selecting the newest history that fits a model
//! - Token accounting for prompts and streamed completions

pub mod accounting;
pub mod error;
pub mod serialize;
pub mod tokenizer;
pub mod window;

pub use accounting::{completion_tokens, prompt_tokens, text_tokens, usage_for};
pub use error::{ContextError, ContextResult};
pub use serialize::{effective_content, serialize_messages, PromptFormat};
pub use tokenizer::{AllowedSpecial, BpeTokenizer, Encoding, Tokenizer, TokenizerLease, Tokenizers};
pub use window::{build_window, WindowResult};

/// Prelude for common imports
pub mod prelude {
    pub use crate::error::{ContextError, ContextResult};
    pub use crate::tokenizer::{AllowedSpecial, Tokenizer, Tokenizers};
    pub use crate::window::{build_window, WindowResult};
}
