//! Error types for context windowing

use chatbot_core::AttachmentError;
use thiserror::Error;

/// Context windowing error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    /// The window holds no history message, or leaves no room for a completion.
    #[error("message is too long")]
    MessageTooLong,

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Invalid attachment: {0}")]
    Attachment(#[from] AttachmentError),
}

/// Result type for context operations
pub type ContextResult<T> = Result<T, ContextError>;
