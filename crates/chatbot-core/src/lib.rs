//! Chatbot core domain types.
//!
//! This crate implements:
//! - chat messages, attachments and conversations
//! - model metadata and the catalog of known models
//! - token usage and pricing shapes shared by the window builder,
//!   the stream reconciler and usage metering.

pub mod conversation;
pub mod message;
pub mod model;
pub mod usage;

pub use conversation::Conversation;
pub use message::{Attachment, AttachmentError, Message, Role};
pub use model::{Llm, LlmTemperature, LlmType, TemperatureMap};
pub use usage::{MessageUsage, PriceRate, TokenUsage};

pub const CORE_VERSION: &str = env!("CARGO_PKG_VERSION");
