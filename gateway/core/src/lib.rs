//! Gateway Core - Streaming Completion Gateway for Inkwell
//!
//! This crate holds everything between a client editor and the completion
//! provider except the network surface itself. It has no knowledge of HTTP
//! frameworks: connections are reached through the [`Transport`] trait and
//! the provider through the [`LlmBackend`] trait.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 Daemon (axum HTTP + WebSocket)                │
//! └───────────────┬──────────────────────────────┬───────────────┘
//!                 │ frames                       │ one-shot calls
//! ┌───────────────┼──────────────────────────────┼───────────────┐
//! │               ▼        GATEWAY CORE          ▼               │
//! │  ┌─────────────────────────────────────────────────────────┐ │
//! │  │                 StreamingOrchestrator                    │ │
//! │  │  ┌────────────┐ ┌────────────┐ ┌────────────┐ ┌────────┐ │ │
//! │  │  │ TokenBucket│ │  Context   │ │  Upstream  │ │ Prompt │ │ │
//! │  │  │  Limiter   │ │  Window    │ │   Caller   │ │Composer│ │ │
//! │  │  └────────────┘ └────────────┘ └─────┬──────┘ └────────┘ │ │
//! │  └──────────────────────┬───────────────┼───────────────────┘ │
//! │                         ▼               ▼                     │
//! │              ConnectionSupervisor   LlmBackend (OpenAI)       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`StreamingOrchestrator`]: per-frame admission, upstream call and relay
//! - [`ConnectionSupervisor`]: live connections, heartbeats, idle timeout
//! - [`TokenBucketLimiter`]: per-identity admission control
//! - [`UpstreamCaller`] and [`RetryPolicy`]: bounded retry with backoff
//! - [`StreamEvent`]: the outbound wire frames
//! - [`GatewayConfig`]: layered configuration

pub mod backend;
pub mod config;
pub mod context_window;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod prompts;
pub mod rate_limit;
pub mod supervisor;
pub mod upstream;

// Re-exports for convenience
pub use backend::{
    ChatMessage, ChatRequest, ChatResponse, ChatRole, LlmBackend, OpenAiBackend, StreamingToken,
    TokenReceiver,
};
pub use config::{GatewayConfig, ServerConfig, UpstreamConfig};
pub use context_window::{estimate_tokens, ContextWindow, ContextWindowConfig, ContextWindowTruncator};
pub use error::{
    CallError, Classify, ConfigError, FailureKind, RetryError, TransportError, UpstreamError,
};
pub use events::{
    Action, ChatTurn, ClientRequest, ConnectionId, ErrorCode, RequestId, StreamEvent,
};
pub use orchestrator::{Completion, OrchestratorSettings, StreamingOrchestrator, CHAT_COST};
pub use prompts::{normalize_history, DefaultPrompts, PromptComposer, PromptTask};
pub use rate_limit::{
    Admission, LimiterMetrics, RateLimitConfig, TokenBucketLimiter, MAX_REQUEST_COST,
};
pub use supervisor::{
    CloseReason, ConnectionPhase, ConnectionSupervisor, SupervisorConfig, SweepReport,
    SweeperHandle, Transport,
};
pub use upstream::{call_with_policy, RetryPolicy, UpstreamCaller, UpstreamReply};
