//! Streaming Orchestrator
//!
//! Turns inbound client requests into upstream calls and upstream replies
//! into outbound frames.
//!
//! # Frame Flow
//!
//! ```text
//! frame ──► parse ──► limiter ──► spawn_request ──► stream_with_retry
//!             │          │                              │
//!             ▼          ▼                              ▼
//!        Error(invalid) Error(rate_limited)   Start, Token*, End | Error
//! ```
//!
//! Failures before the stream is established produce one `error` frame and
//! no `start`. Once `start` went out, the request finishes with exactly one
//! `end` or `error`, unless the connection dies first. A failed send stops
//! the request and drops the upstream receiver.
//!
//! The HTTP endpoints use the non-streaming [`generate`], [`optimize`] and
//! [`chat`] operations; admission for those is the caller's job.
//!
//! [`generate`]: StreamingOrchestrator::generate
//! [`optimize`]: StreamingOrchestrator::optimize
//! [`chat`]: StreamingOrchestrator::chat

use std::sync::Arc;
use std::time::Instant;

use crate::backend::{ChatMessage, ChatRequest, LlmBackend, StreamingToken};
use crate::config::{GatewayConfig, UpstreamConfig};
use crate::context_window::ContextWindowTruncator;
use crate::error::CallError;
use crate::events::{
    Action, ChatTurn, ClientRequest, ConnectionId, ErrorCode, RequestId, StreamEvent,
};
use crate::prompts::{DefaultPrompts, PromptComposer, PromptTask};
use crate::rate_limit::{Admission, TokenBucketLimiter};
use crate::supervisor::ConnectionSupervisor;
use crate::upstream::UpstreamCaller;

/// Admission cost of a chat turn
pub const CHAT_COST: f64 = 2.0;

/// Default sampling temperature
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

const WELCOME_MESSAGE: &str = "Connected to the Inkwell completion service";

/// Request shaping settings
#[derive(Clone, Debug, PartialEq)]
pub struct OrchestratorSettings {
    /// Model sent upstream
    pub model: String,
    /// Reply cap for completions when the client sends none
    pub completion_max_tokens: u32,
    /// Reply cap for chat when the client sends none
    pub chat_max_tokens: u32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_upstream(&UpstreamConfig::default())
    }
}

impl OrchestratorSettings {
    /// Take the settings from the upstream section
    #[must_use]
    pub fn from_upstream(config: &UpstreamConfig) -> Self {
        Self {
            model: config.model.clone(),
            completion_max_tokens: config.completion_max_tokens,
            chat_max_tokens: config.chat_max_tokens,
        }
    }
}

/// Result of a non-streaming operation
#[derive(Clone, Debug, PartialEq)]
pub struct Completion {
    /// Generated text
    pub text: String,
    /// Identifier assigned to the request
    pub request_id: RequestId,
    /// The action performed (`None` for chat)
    pub action: Option<Action>,
    /// Model that answered
    pub model: String,
}

/// Drives requests from clients to the provider and back
pub struct StreamingOrchestrator {
    supervisor: Arc<ConnectionSupervisor>,
    limiter: Arc<TokenBucketLimiter>,
    caller: UpstreamCaller,
    truncator: ContextWindowTruncator,
    prompts: Arc<dyn PromptComposer>,
    settings: OrchestratorSettings,
}

impl StreamingOrchestrator {
    /// Create an orchestrator with default prompts, budgets and settings
    ///
    /// `limiter` governs WebSocket frames and is keyed by connection id.
    pub fn new(
        supervisor: Arc<ConnectionSupervisor>,
        limiter: Arc<TokenBucketLimiter>,
        caller: UpstreamCaller,
    ) -> Self {
        Self {
            supervisor,
            limiter,
            caller,
            truncator: ContextWindowTruncator::default(),
            prompts: Arc::new(DefaultPrompts),
            settings: OrchestratorSettings::default(),
        }
    }

    /// Wire an orchestrator from the gateway configuration
    pub fn from_config(
        config: &GatewayConfig,
        supervisor: Arc<ConnectionSupervisor>,
        backend: Arc<dyn LlmBackend>,
    ) -> Self {
        let limiter = Arc::new(TokenBucketLimiter::new(config.ws_limits.clone()));
        let caller = UpstreamCaller::new(backend, config.retry.clone());
        Self::new(supervisor, limiter, caller)
            .with_truncator(ContextWindowTruncator::new(config.context_window))
            .with_settings(OrchestratorSettings::from_upstream(&config.upstream))
    }

    /// Replace the prompt composer
    #[must_use]
    pub fn with_prompts(mut self, prompts: Arc<dyn PromptComposer>) -> Self {
        self.prompts = prompts;
        self
    }

    /// Replace the context truncator
    #[must_use]
    pub fn with_truncator(mut self, truncator: ContextWindowTruncator) -> Self {
        self.truncator = truncator;
        self
    }

    /// Replace the request settings
    #[must_use]
    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// The supervisor frames are sent through
    #[must_use]
    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    /// The WebSocket limiter
    #[must_use]
    pub fn limiter(&self) -> &Arc<TokenBucketLimiter> {
        &self.limiter
    }

    /// The upstream caller
    #[must_use]
    pub fn caller(&self) -> &UpstreamCaller {
        &self.caller
    }

    // =========================================================================
    // Streaming
    // =========================================================================

    /// Greet a freshly accepted connection
    pub async fn welcome(&self, id: &ConnectionId) -> bool {
        self.supervisor
            .send(
                id,
                &StreamEvent::System {
                    message: WELCOME_MESSAGE.to_string(),
                },
            )
            .await
    }

    /// Handle one inbound text frame
    ///
    /// Returns the id of the spawned request, or `None` when the frame was
    /// rejected (and answered with an error frame) or the connection is gone.
    pub async fn handle_frame(self: &Arc<Self>, id: &ConnectionId, frame: &str) -> Option<RequestId> {
        let request = match ClientRequest::from_frame(frame) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(connection_id = %id, error = %e, "Malformed request frame");
                self.supervisor
                    .send(
                        id,
                        &StreamEvent::error(ErrorCode::InvalidRequest, format!("Invalid request: {e}")),
                    )
                    .await;
                return None;
            }
        };

        let action = request.action;
        if let Admission::Denied { retry_after_secs } =
            self.limiter.check(&id.to_string(), action.cost())
        {
            self.supervisor
                .send(id, &StreamEvent::rate_limited(action, retry_after_secs))
                .await;
            return None;
        }

        let this = Arc::clone(self);
        let connection_id = *id;
        self.supervisor.spawn_request(id, move |request_id| async move {
            this.stream_request(connection_id, request_id, request).await;
        })
    }

    /// Run one admitted request to its terminal frame
    async fn stream_request(&self, id: ConnectionId, request_id: RequestId, request: ClientRequest) {
        let action = request.action;
        let started = Instant::now();
        tracing::info!(
            connection_id = %id,
            request_id = %request_id,
            action = %action,
            chars = request.text.chars().count(),
            "Streaming request started"
        );

        let chat_request = self.build_request(&request, action);
        let mut rx = match self.caller.stream_with_retry(&chat_request).await {
            Ok(rx) => rx,
            Err(e) => {
                self.supervisor
                    .send(
                        &id,
                        &StreamEvent::Error {
                            request_id: Some(request_id),
                            action: Some(action),
                            code: ErrorCode::for_call_error(&e),
                            error: e.to_string(),
                            retry_after: None,
                        },
                    )
                    .await;
                return;
            }
        };

        if !self
            .supervisor
            .send(&id, &StreamEvent::Start { request_id, action })
            .await
        {
            return;
        }

        let mut completion = String::new();
        let mut index: u32 = 0;

        let terminal = loop {
            match rx.recv().await {
                Some(StreamingToken::Token(token)) => {
                    if token.is_empty() {
                        continue;
                    }
                    completion.push_str(&token);
                    let event = StreamEvent::Token {
                        request_id,
                        action,
                        token,
                        index,
                    };
                    if !self.supervisor.send(&id, &event).await {
                        tracing::debug!(
                            connection_id = %id,
                            request_id = %request_id,
                            "Connection gone, dropping upstream stream"
                        );
                        return;
                    }
                    index += 1;
                }
                Some(StreamingToken::Complete { .. }) => {
                    break StreamEvent::End {
                        request_id,
                        action,
                        completion,
                    };
                }
                Some(StreamingToken::Error(e)) => {
                    tracing::warn!(
                        connection_id = %id,
                        request_id = %request_id,
                        kind = %e.kind,
                        tokens = index,
                        error = %e,
                        "Upstream stream failed"
                    );
                    break StreamEvent::Error {
                        request_id: Some(request_id),
                        action: Some(action),
                        code: ErrorCode::StreamInterrupted,
                        error: e.to_string(),
                        retry_after: None,
                    };
                }
                None => {
                    break StreamEvent::Error {
                        request_id: Some(request_id),
                        action: Some(action),
                        code: ErrorCode::StreamInterrupted,
                        error: "upstream stream ended before completion".to_string(),
                        retry_after: None,
                    };
                }
            }
        };

        let succeeded = matches!(terminal, StreamEvent::End { .. });
        self.supervisor.send(&id, &terminal).await;
        tracing::info!(
            connection_id = %id,
            request_id = %request_id,
            action = %action,
            tokens = index,
            success = succeeded,
            duration_ms = started.elapsed().as_millis() as u64,
            "Streaming request finished"
        );
    }

    // =========================================================================
    // Non-streaming
    // =========================================================================

    /// Continue text at the cursor in one call
    pub async fn generate(&self, request: &ClientRequest) -> Result<Completion, CallError> {
        self.run_once(request, Action::Completion).await
    }

    /// Apply a transform in one call (completion requests become rewrites)
    pub async fn optimize(&self, request: &ClientRequest) -> Result<Completion, CallError> {
        let action = if request.action.is_transform() {
            request.action
        } else {
            Action::Rewrite
        };
        self.run_once(request, action).await
    }

    /// Answer a chat turn
    pub async fn chat(&self, turn: &ChatTurn) -> Result<Completion, CallError> {
        let request_id = RequestId::new();
        let messages = self.prompts.compose(&PromptTask::Chat {
            message: turn.message.clone(),
            context: turn.context.clone(),
            history: turn.conversation_history.clone(),
        });
        let chat_request = ChatRequest::new(self.settings.model.clone(), messages)
            .with_stream(false)
            .with_max_tokens(turn.max_tokens.unwrap_or(self.settings.chat_max_tokens))
            .with_temperature(turn.temperature.unwrap_or(DEFAULT_TEMPERATURE));

        tracing::info!(
            request_id = %request_id,
            history = turn.conversation_history.len(),
            "Chat request"
        );
        let response = self.caller.complete_with_retry(&chat_request).await?;
        Ok(Completion {
            text: response.content,
            request_id,
            action: None,
            model: response.model,
        })
    }

    async fn run_once(&self, request: &ClientRequest, action: Action) -> Result<Completion, CallError> {
        let request_id = RequestId::new();
        let chat_request = self.build_request(request, action).with_stream(false);

        tracing::info!(request_id = %request_id, action = %action, "One-shot request");
        let response = self.caller.complete_with_retry(&chat_request).await?;
        Ok(Completion {
            text: response.content,
            request_id,
            action: Some(action),
            model: response.model,
        })
    }

    // =========================================================================
    // Request Building
    // =========================================================================

    /// Build the provider request for a client request
    fn build_request(&self, request: &ClientRequest, action: Action) -> ChatRequest {
        let messages = self.build_messages(request, action);
        let max_tokens = match (request.max_tokens, action) {
            (Some(max), _) => max,
            (None, Action::Completion) => self.settings.completion_max_tokens,
            // Provider default
            (None, _) => 0,
        };

        ChatRequest::new(self.settings.model.clone(), messages)
            .with_max_tokens(max_tokens)
            .with_temperature(request.temperature.unwrap_or(DEFAULT_TEMPERATURE))
    }

    fn build_messages(&self, request: &ClientRequest, action: Action) -> Vec<ChatMessage> {
        let task = if action.is_transform() {
            PromptTask::Transform {
                action,
                text: request.text.clone(),
                target_language: request.target_language.clone(),
            }
        } else {
            match request.cursor_position {
                Some(cursor) if !request.text.is_empty() => {
                    let window = self.truncator.window(&request.text, cursor);
                    PromptTask::Completion {
                        before: window.before,
                        after: window.after,
                    }
                }
                _ => PromptTask::Completion {
                    before: format!(
                        "{}{}",
                        request.context_before.as_deref().unwrap_or_default(),
                        request.text
                    ),
                    after: request.context_after.clone().unwrap_or_default(),
                },
            }
        };
        self.prompts.compose(&task)
    }
}

impl std::fmt::Debug for StreamingOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingOrchestrator")
            .field("caller", &self.caller)
            .field("truncator", &self.truncator)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ChatResponse, ChatRole, TokenReceiver};
    use crate::context_window::ContextWindowConfig;
    use crate::error::UpstreamError;
    use crate::rate_limit::RateLimitConfig;
    use crate::supervisor::SupervisorConfig;
    use crate::upstream::RetryPolicy;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Backend that records requests and answers "ok"
    #[derive(Default)]
    struct EchoBackend {
        requests: Mutex<Vec<ChatRequest>>,
    }

    #[async_trait]
    impl LlmBackend for EchoBackend {
        fn name(&self) -> &str {
            "echo"
        }

        async fn health_check(&self) -> bool {
            true
        }

        async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, UpstreamError> {
            self.requests.lock().push(request.clone());
            Ok(ChatResponse {
                content: "ok".to_string(),
                model: request.model.clone(),
                tokens_used: Some(3),
                duration_ms: None,
            })
        }

        async fn open_stream(&self, _request: &ChatRequest) -> Result<TokenReceiver, UpstreamError> {
            Err(UpstreamError::other("not used"))
        }
    }

    fn orchestrator(backend: Arc<EchoBackend>) -> StreamingOrchestrator {
        StreamingOrchestrator::new(
            Arc::new(ConnectionSupervisor::new(SupervisorConfig::default())),
            Arc::new(TokenBucketLimiter::new(RateLimitConfig::websocket())),
            UpstreamCaller::new(backend, RetryPolicy::no_retry()),
        )
    }

    #[test]
    fn test_completion_without_cursor_uses_client_context() {
        let orchestrator = orchestrator(Arc::new(EchoBackend::default()));
        let request = ClientRequest {
            text: "middle".to_string(),
            context_before: Some("start ".to_string()),
            context_after: Some(" end".to_string()),
            ..Default::default()
        };

        let chat = orchestrator.build_request(&request, Action::Completion);
        assert_eq!(chat.messages[1].content, "start middle end");
        assert_eq!(chat.max_tokens, 50);
        assert!((chat.temperature - 0.7).abs() < f32::EPSILON);
    }

    #[test]
    fn test_completion_with_cursor_truncates_around_it() {
        let orchestrator = orchestrator(Arc::new(EchoBackend::default())).with_truncator(
            ContextWindowTruncator::new(ContextWindowConfig {
                before_tokens: 2,
                after_tokens: 2,
            }),
        );
        let request = ClientRequest::new(Action::Completion, "aaaa bbbb cccc dddd|eeee ffff gggg hhhh")
            .with_cursor(19);

        let chat = orchestrator.build_request(&request, Action::Completion);
        let prompt = &chat.messages[1].content;
        // Nearest text survives, far text is dropped
        assert!(prompt.contains("dddd"));
        assert!(!prompt.contains("aaaa"));
        assert!(!prompt.contains("hhhh"));
    }

    #[test]
    fn test_transform_uses_provider_default_length() {
        let orchestrator = orchestrator(Arc::new(EchoBackend::default()));
        let request = ClientRequest::new(Action::Simplify, "A long sentence.").with_temperature(5.0);

        let chat = orchestrator.build_request(&request, Action::Simplify);
        assert_eq!(chat.max_tokens, 0);
        assert_eq!(chat.temperature, 2.0);
        assert!(chat.messages[1].content.ends_with("A long sentence."));
    }

    #[tokio::test]
    async fn test_optimize_defaults_to_rewrite() {
        let backend = Arc::new(EchoBackend::default());
        let orchestrator = orchestrator(backend.clone());

        let completion = orchestrator
            .optimize(&ClientRequest::new(Action::Completion, "text"))
            .await
            .unwrap();
        assert_eq!(completion.action, Some(Action::Rewrite));
        assert_eq!(completion.text, "ok");
        assert!(!backend.requests.lock()[0].stream);
    }

    #[tokio::test]
    async fn test_chat_caps_tokens_and_keeps_history() {
        assert!(CHAT_COST <= crate::rate_limit::MAX_REQUEST_COST);
        let backend = Arc::new(EchoBackend::default());
        let orchestrator = orchestrator(backend.clone());
        let turn = ChatTurn {
            message: "Next?".to_string(),
            conversation_history: vec![ChatMessage::user("Hi"), ChatMessage::assistant("Hello")],
            ..Default::default()
        };

        let completion = orchestrator.chat(&turn).await.unwrap();
        assert_eq!(completion.action, None);
        assert!(completion.request_id.to_string().starts_with("req-"));

        let sent = &backend.requests.lock()[0];
        assert_eq!(sent.max_tokens, 500);
        assert_eq!(sent.messages.len(), 4);
        assert_eq!(sent.messages[0].role, ChatRole::System);
        assert_eq!(sent.messages[3], ChatMessage::user("Next?"));
    }
}
