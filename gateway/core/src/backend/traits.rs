//! LLM Backend Traits
//!
//! Trait definitions for the completion provider. The gateway only speaks a
//! chat-style interface: an ordered list of role/content messages in, either
//! one reply or a lazy sequence of text deltas out.
//!
//! Implementations are responsible for classifying their failures into a
//! [`FailureKind`](crate::error::FailureKind) so the retry policy can decide
//! what is worth another attempt.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::UpstreamError;

/// Token stream events from LLM backends
#[derive(Clone, Debug, PartialEq)]
pub enum StreamingToken {
    /// An incremental text delta
    Token(String),
    /// Response completed successfully
    Complete {
        /// The complete message (concatenation of all deltas)
        message: String,
    },
    /// The stream broke after it was established
    Error(UpstreamError),
}

/// Receiving half of a streamed reply
///
/// The channel closing without a [`StreamingToken::Complete`] means the
/// stream was cut short.
pub type TokenReceiver = mpsc::Receiver<StreamingToken>;

/// Role of a chat message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// Instructions for the model
    System,
    /// Text written by the user
    User,
    /// Text written by the model
    Assistant,
}

/// One role/content pair
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Who wrote the message
    pub role: ChatRole,
    /// Message text
    pub content: String,
}

impl ChatMessage {
    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// A chat completion request
#[derive(Clone, Debug, PartialEq)]
pub struct ChatRequest {
    /// Model to use (provider-specific identifier)
    pub model: String,
    /// Ordered conversation
    pub messages: Vec<ChatMessage>,
    /// Maximum tokens in the reply (0 = provider default)
    pub max_tokens: u32,
    /// Sampling temperature
    pub temperature: f32,
    /// Whether to stream the reply
    pub stream: bool,
}

impl Default for ChatRequest {
    fn default() -> Self {
        Self {
            model: String::new(),
            messages: Vec::new(),
            max_tokens: 0,
            temperature: 0.7,
            stream: true,
        }
    }
}

impl ChatRequest {
    /// Create a new request for a model
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            ..Default::default()
        }
    }

    /// Set streaming mode
    #[must_use]
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Set temperature (clamped to the range providers accept)
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 2.0);
        self
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Response from a non-streaming request
#[derive(Clone, Debug, PartialEq)]
pub struct ChatResponse {
    /// The reply text
    pub content: String,
    /// Model that generated the reply
    pub model: String,
    /// Tokens used (if reported)
    pub tokens_used: Option<u32>,
    /// Wall time of the call in milliseconds
    pub duration_ms: Option<u64>,
}

/// LLM Backend trait
///
/// Implement this trait to plug in a completion provider.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Get the backend name (e.g., "OpenAI")
    fn name(&self) -> &str;

    /// Check if the backend is healthy and reachable
    async fn health_check(&self) -> bool;

    /// Send a request and wait for the complete reply
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, UpstreamError>;

    /// Send a request and get a streaming reply
    ///
    /// An `Err` means the stream could not be established. Once `Ok` is
    /// returned, later failures arrive as [`StreamingToken::Error`].
    async fn open_stream(&self, request: &ChatRequest) -> Result<TokenReceiver, UpstreamError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_request_builder() {
        let request = ChatRequest::new("gpt-3.5-turbo", vec![ChatMessage::user("Hello")])
            .with_stream(false)
            .with_temperature(0.5)
            .with_max_tokens(100);

        assert_eq!(request.model, "gpt-3.5-turbo");
        assert_eq!(request.messages.len(), 1);
        assert!(!request.stream);
        assert!((request.temperature - 0.5).abs() < f32::EPSILON);
        assert_eq!(request.max_tokens, 100);
    }

    #[test]
    fn test_temperature_is_clamped() {
        let request = ChatRequest::default().with_temperature(7.0);
        assert!((request.temperature - 2.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_chat_message_wire_format() {
        let json = serde_json::to_value(ChatMessage::assistant("hi")).unwrap();
        assert_eq!(json, serde_json::json!({"role": "assistant", "content": "hi"}));

        let parsed: ChatMessage =
            serde_json::from_str(r#"{"role":"user","content":"hey"}"#).unwrap();
        assert_eq!(parsed, ChatMessage::user("hey"));
    }
}
