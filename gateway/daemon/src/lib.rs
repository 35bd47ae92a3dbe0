//! Gateway Daemon - HTTP and WebSocket Surface for Inkwell
//!
//! Exposes the gateway core over axum:
//!
//! - `GET /api/v1/completion/ws`: streaming completions and transforms
//! - `POST /api/v1/completion/generate`, `POST /api/v1/completion/optimize`
//! - `POST /api/v1/chat/completion`
//! - `GET /health`, `GET /`
//!
//! The binary (`gateway-daemon`) adds argument parsing, logging and signal
//! handling on top of [`server::run`].

pub mod error;
pub mod http;
pub mod server;
pub mod websocket;

pub use error::{ApiError, ApiResult};
pub use server::{router, run, serve, AppState};
pub use websocket::AxumTransport;
