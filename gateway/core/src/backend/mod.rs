//! LLM Backend Integration
//!
//! Abstracted access to the completion provider through a common trait.
//!
//! # Available Backends
//!
//! - **OpenAI**: any OpenAI-compatible chat completions API
//!
//! # Usage
//!
//! ```ignore
//! use gateway_core::backend::{ChatMessage, ChatRequest, LlmBackend, OpenAiBackend};
//!
//! let backend = OpenAiBackend::from_config(&config.upstream)?;
//! let request = ChatRequest::new("gpt-3.5-turbo", vec![ChatMessage::user("Hello!")]);
//! let mut rx = backend.open_stream(&request).await?;
//! ```

mod openai;
mod traits;

pub use openai::OpenAiBackend;
pub use traits::{
    ChatMessage, ChatRequest, ChatResponse, ChatRole, LlmBackend, StreamingToken, TokenReceiver,
};
