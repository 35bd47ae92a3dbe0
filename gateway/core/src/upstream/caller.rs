//! Upstream Caller
//!
//! Wraps a single outbound call to the provider with the retry policy.
//!
//! For streamed replies the retry boundary covers establishing the stream
//! only. Once the first byte of the reply has been accepted the receiver is
//! handed to the caller, and any later failure shows up exactly once as a
//! [`StreamingToken::Error`](crate::backend::StreamingToken::Error). Partial
//! output that already reached a client cannot be taken back, so nothing is
//! replayed.

use std::sync::Arc;

use crate::backend::{ChatRequest, ChatResponse, LlmBackend, TokenReceiver};
use crate::error::{CallError, UpstreamError};

use super::retry::{call_with_policy, RetryPolicy};

/// The provider's answer: a whole reply or a stream of deltas
#[derive(Debug)]
pub enum UpstreamReply {
    /// Non-streaming reply
    Complete(ChatResponse),
    /// Streaming reply
    Stream(TokenReceiver),
}

/// Calls the provider through an [`LlmBackend`] under a [`RetryPolicy`]
#[derive(Clone)]
pub struct UpstreamCaller {
    backend: Arc<dyn LlmBackend>,
    policy: RetryPolicy,
}

impl UpstreamCaller {
    /// Create a caller
    pub fn new(backend: Arc<dyn LlmBackend>, policy: RetryPolicy) -> Self {
        Self { backend, policy }
    }

    /// The retry policy in use
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Name of the backend
    #[must_use]
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Probe the backend
    pub async fn health_check(&self) -> bool {
        self.backend.health_check().await
    }

    /// One attempt, streaming or not depending on `request.stream`
    pub async fn call(&self, request: &ChatRequest) -> Result<UpstreamReply, UpstreamError> {
        if request.stream {
            self.backend
                .open_stream(request)
                .await
                .map(UpstreamReply::Stream)
        } else {
            self.backend
                .complete(request)
                .await
                .map(UpstreamReply::Complete)
        }
    }

    /// [`call`](Self::call) under the retry policy
    pub async fn call_with_retry(&self, request: &ChatRequest) -> Result<UpstreamReply, CallError> {
        call_with_policy(&self.policy, move |attempt| {
            tracing::debug!(
                attempt = attempt,
                model = %request.model,
                stream = request.stream,
                "Calling upstream"
            );
            self.call(request)
        })
        .await
    }

    /// Non-streaming call under the retry policy
    pub async fn complete_with_retry(&self, request: &ChatRequest) -> Result<ChatResponse, CallError> {
        let request = &request.clone().with_stream(false);
        call_with_policy(&self.policy, move |attempt| {
            tracing::debug!(attempt = attempt, model = %request.model, "Calling upstream");
            self.backend.complete(request)
        })
        .await
    }

    /// Establish a stream under the retry policy
    pub async fn stream_with_retry(&self, request: &ChatRequest) -> Result<TokenReceiver, CallError> {
        let request = &request.clone().with_stream(true);
        call_with_policy(&self.policy, move |attempt| {
            tracing::debug!(attempt = attempt, model = %request.model, "Opening upstream stream");
            self.backend.open_stream(request)
        })
        .await
    }
}

impl std::fmt::Debug for UpstreamCaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamCaller")
            .field("backend", &self.backend.name())
            .field("policy", &self.policy)
            .finish()
    }
}
