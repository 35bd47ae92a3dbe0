//! HTTP Endpoints
//!
//! One-shot completion, transform and chat calls plus the informational
//! routes. Admission is keyed by the caller's IP address.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, State};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

use gateway_core::{Action, ChatTurn, ClientRequest, CHAT_COST};

use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

/// Body of `generate` and `optimize` responses
#[derive(Debug, Serialize)]
pub struct CompletionBody {
    /// Generated text
    pub completion: String,
    /// Always `"success"`
    pub status: &'static str,
    /// Request identifier
    pub request_id: String,
    /// Action performed
    pub action: Action,
}

/// Body of chat responses
#[derive(Debug, Serialize)]
pub struct ChatBody {
    /// Assistant reply
    pub response: String,
    /// Always `"success"`
    pub status: &'static str,
    /// Request identifier
    pub request_id: String,
}

/// Body of `/health`
#[derive(Debug, Serialize)]
pub struct HealthBody {
    /// Always `"ok"`
    pub status: &'static str,
    /// Live WebSocket connections
    pub connections: usize,
    /// Identities tracked by both limiters
    pub tracked_identities: usize,
    /// Upstream backend name
    pub upstream: String,
}

/// `GET /`
pub async fn root() -> Json<Value> {
    Json(json!({
        "message": "Welcome to the Inkwell API",
        "version": env!("CARGO_PKG_VERSION"),
        "websocket": "/api/v1/completion/ws",
    }))
}

/// `GET /health`
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthBody> {
    Json(HealthBody {
        status: "ok",
        connections: state.supervisor.count(),
        tracked_identities: state.http_limiter.tracked_identities()
            + state.orchestrator.limiter().tracked_identities(),
        upstream: state.orchestrator.caller().backend_name().to_string(),
    })
}

/// `POST /api/v1/completion/generate`
pub async fn generate(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    payload: Result<Json<ClientRequest>, JsonRejection>,
) -> ApiResult<Json<CompletionBody>> {
    let Json(request) = payload?;
    state.admit(peer, Action::Completion.cost())?;

    let completion = state.orchestrator.generate(&request).await?;
    Ok(Json(CompletionBody {
        completion: completion.text,
        status: "success",
        request_id: completion.request_id.to_string(),
        action: Action::Completion,
    }))
}

/// `POST /api/v1/completion/optimize`
pub async fn optimize(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    payload: Result<Json<ClientRequest>, JsonRejection>,
) -> ApiResult<Json<CompletionBody>> {
    let Json(request) = payload?;
    if request.text.trim().is_empty() {
        return Err(ApiError::InvalidRequest("text must not be empty".to_string()));
    }
    state.admit(peer, Action::Rewrite.cost())?;

    let completion = state.orchestrator.optimize(&request).await?;
    Ok(Json(CompletionBody {
        completion: completion.text,
        status: "success",
        request_id: completion.request_id.to_string(),
        action: completion.action.unwrap_or(Action::Rewrite),
    }))
}

/// `POST /api/v1/chat/completion`
pub async fn chat(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    payload: Result<Json<ChatTurn>, JsonRejection>,
) -> ApiResult<Json<ChatBody>> {
    let Json(turn) = payload?;
    if turn.message.trim().is_empty() {
        return Err(ApiError::InvalidRequest("message must not be empty".to_string()));
    }
    state.admit(peer, CHAT_COST)?;

    let reply = state.orchestrator.chat(&turn).await?;
    Ok(Json(ChatBody {
        response: reply.text,
        status: "success",
        request_id: reply.request_id.to_string(),
    }))
}
