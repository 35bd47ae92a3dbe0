//! OpenAI-Compatible Backend Implementation
//!
//! LLM backend for any provider exposing the OpenAI chat completions API.
//!
//! # API
//!
//! - `POST /chat/completions` - Chat completions (streaming or batch)
//! - `GET /models` - Used as a cheap health probe
//!
//! Streaming replies arrive as server-sent events: one `data: {json}` line
//! per delta, terminated by `data: [DONE]`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use super::traits::{ChatRequest, ChatResponse, LlmBackend, StreamingToken, TokenReceiver};
use crate::config::UpstreamConfig;
use crate::error::UpstreamError;

/// Buffered deltas between the reader task and the consumer
const STREAM_CHANNEL_CAPACITY: usize = 100;

/// OpenAI-compatible backend client
#[derive(Clone)]
pub struct OpenAiBackend {
    /// API root, e.g. `https://api.openai.com/v1`
    base_url: String,
    /// Bearer token
    api_key: String,
    /// HTTP client (carries the request timeout)
    http_client: reqwest::Client,
}

impl OpenAiBackend {
    /// Create a new backend
    ///
    /// `timeout` is the per-request ceiling enforced by the HTTP client.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, UpstreamError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UpstreamError::other(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            http_client,
        })
    }

    /// Create from the upstream section of the gateway configuration
    pub fn from_config(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        Self::new(
            config.base_url.clone(),
            config.api_key.clone(),
            config.request_timeout(),
        )
    }

    /// Get chat completions endpoint URL
    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// Get models endpoint URL
    fn models_url(&self) -> String {
        format!("{}/models", self.base_url)
    }

    /// Build the JSON body for a request
    fn request_body(request: &ChatRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": request.messages,
            "temperature": request.temperature,
            "stream": stream,
        });

        if request.max_tokens > 0 {
            body["max_tokens"] = serde_json::json!(request.max_tokens);
        }

        body
    }

    /// Post a request and turn non-success statuses into classified errors
    async fn post(
        &self,
        request: &ChatRequest,
        stream: bool,
    ) -> Result<reqwest::Response, UpstreamError> {
        let response = self
            .http_client
            .post(self.chat_url())
            .bearer_auth(&self.api_key)
            .json(&Self::request_body(request, stream))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::from_status(status, body));
        }

        Ok(response)
    }
}

impl std::fmt::Debug for OpenAiBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiBackend")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    fn name(&self) -> &'static str {
        "OpenAI"
    }

    async fn health_check(&self) -> bool {
        self.http_client
            .get(self.models_url())
            .bearer_auth(&self.api_key)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .is_ok_and(|response| response.status().is_success())
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, UpstreamError> {
        let start = Instant::now();
        let response = self.post(request, false).await?;
        let data: serde_json::Value = response.json().await?;

        let content = data
            .pointer("/choices/0/message/content")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| UpstreamError::other("response carried no message content"))?
            .to_string();

        let tokens_used = data
            .pointer("/usage/total_tokens")
            .and_then(serde_json::Value::as_u64)
            .map(|c| c as u32);

        let model = data
            .get("model")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(request.model.as_str())
            .to_string();

        Ok(ChatResponse {
            content,
            model,
            tokens_used,
            duration_ms: Some(start.elapsed().as_millis() as u64),
        })
    }

    async fn open_stream(&self, request: &ChatRequest) -> Result<TokenReceiver, UpstreamError> {
        let response = self.post(request, true).await?;
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let mut stream = response.bytes_stream();

        tokio::spawn(async move {
            let mut buffer: Vec<u8> = Vec::new();
            let mut full_response = String::new();
            let mut finished = false;

            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(StreamingToken::Error(e.into())).await;
                        return;
                    }
                };
                buffer.extend_from_slice(&bytes);

                // Split on complete lines only; a UTF-8 sequence may straddle chunks
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);

                    match parse_sse_line(&line) {
                        Some(SseEvent::Delta { content, finish }) => {
                            finished |= finish;
                            if let Some(token) = content.filter(|t| !t.is_empty()) {
                                full_response.push_str(&token);
                                if tx.send(StreamingToken::Token(token)).await.is_err() {
                                    // Receiver dropped, stop streaming
                                    return;
                                }
                            }
                        }
                        Some(SseEvent::Done) => {
                            let _ = tx
                                .send(StreamingToken::Complete {
                                    message: full_response,
                                })
                                .await;
                            return;
                        }
                        Some(SseEvent::Failed(message)) => {
                            let _ = tx
                                .send(StreamingToken::Error(UpstreamError::other(message)))
                                .await;
                            return;
                        }
                        None => {}
                    }
                }
            }

            // Body ended without the [DONE] sentinel
            let last = if finished {
                StreamingToken::Complete {
                    message: full_response,
                }
            } else {
                StreamingToken::Error(UpstreamError::connection(
                    "stream ended before completion",
                ))
            };
            let _ = tx.send(last).await;
        });

        Ok(rx)
    }
}

// =============================================================================
// Server-Sent Events
// =============================================================================

/// One meaningful SSE line
#[derive(Debug, PartialEq)]
enum SseEvent {
    /// A chunk; `content` is absent for role-only or empty deltas
    Delta {
        content: Option<String>,
        finish: bool,
    },
    /// The `[DONE]` sentinel
    Done,
    /// The provider reported an error inside the stream
    Failed(String),
}

/// Parse one line of an SSE body; comments, blanks and junk yield `None`
fn parse_sse_line(line: &str) -> Option<SseEvent> {
    let data = line.trim().strip_prefix("data:")?.trim();
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }

    let value: serde_json::Value = serde_json::from_str(data).ok()?;

    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(serde_json::Value::as_str)
            .map_or_else(|| error.to_string(), String::from);
        return Some(SseEvent::Failed(message));
    }

    let choice = value.pointer("/choices/0")?;
    let content = choice
        .pointer("/delta/content")
        .and_then(serde_json::Value::as_str)
        .map(String::from);
    let finish = choice
        .get("finish_reason")
        .is_some_and(|reason| !reason.is_null());

    Some(SseEvent::Delta { content, finish })
}
