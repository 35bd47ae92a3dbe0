//! Gateway Server
//!
//! Wires the core components into an axum application:
//!
//! ```text
//!                        GatewayServer
//!                             │
//!        ┌────────────────────┼─────────────────────┐
//!        │                    │                     │
//!   GET /api/v1/         POST /api/v1/         sweeper +
//!   completion/ws        completion/*, chat/*   housekeeping
//!        │                    │
//!   ConnectionSupervisor  HTTP limiter (per IP)
//!        └──────── StreamingOrchestrator ────────┘
//! ```
//!
//! On shutdown every WebSocket is closed through the supervisor before the
//! HTTP listener drains.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use gateway_core::{
    Admission, ConnectionSupervisor, GatewayConfig, LlmBackend, OpenAiBackend,
    StreamingOrchestrator, TokenBucketLimiter,
};

use crate::error::ApiError;
use crate::{http, websocket};

/// How often idle limiter buckets are evicted
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);

/// Shared state of all handlers
pub struct AppState {
    /// Effective configuration
    pub config: GatewayConfig,
    /// Live WebSocket connections
    pub supervisor: Arc<ConnectionSupervisor>,
    /// Request driver
    pub orchestrator: Arc<StreamingOrchestrator>,
    /// Admission control for HTTP endpoints
    pub http_limiter: Arc<TokenBucketLimiter>,
}

impl AppState {
    /// Build the component graph
    pub fn new(config: GatewayConfig, backend: Arc<dyn LlmBackend>) -> Self {
        let supervisor = Arc::new(ConnectionSupervisor::new(config.supervisor.clone()));
        let orchestrator = Arc::new(StreamingOrchestrator::from_config(
            &config,
            Arc::clone(&supervisor),
            backend,
        ));
        let http_limiter = Arc::new(TokenBucketLimiter::new(config.http_limits.clone()));

        Self {
            config,
            supervisor,
            orchestrator,
            http_limiter,
        }
    }

    /// Admit an HTTP request from `peer`
    pub fn admit(&self, peer: SocketAddr, cost: f64) -> Result<(), ApiError> {
        match self.http_limiter.check(&peer.ip().to_string(), cost) {
            Admission::Allowed => Ok(()),
            Admission::Denied { retry_after_secs } => Err(ApiError::RateLimited { retry_after_secs }),
        }
    }
}

/// Build the router
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/completion/ws", get(websocket::ws_handler))
        .route("/completion/generate", post(http::generate))
        .route("/completion/optimize", post(http::optimize))
        .route("/chat/completion", post(http::chat));

    Router::new()
        .route("/", get(http::root))
        .route("/health", get(http::health))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state.config.server.cors_origins))
        .with_state(state)
}

/// CORS for the configured origins (none configured = any origin)
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
}

fn spawn_housekeeping(state: Arc<AppState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let http = state.http_limiter.evict_idle();
            let ws = state.orchestrator.limiter().evict_idle();
            if http + ws > 0 {
                debug!(http = http, ws = ws, "Evicted idle limiter buckets");
            }
        }
    })
}

/// Serve on an already bound listener until `shutdown` resolves
pub async fn serve<F>(state: Arc<AppState>, listener: TcpListener, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr().context("listener has no local address")?;
    let sweeper = state.supervisor.spawn_sweeper();
    let housekeeping = spawn_housekeeping(Arc::clone(&state));

    let supervisor = Arc::clone(&state.supervisor);
    let shutdown = async move {
        shutdown.await;
        info!("Shutdown requested, closing connections");
        supervisor.shutdown().await;
    };

    info!(
        addr = %addr,
        upstream = state.orchestrator.caller().backend_name(),
        "Gateway listening"
    );

    axum::serve(
        listener,
        router(Arc::clone(&state)).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("server error")?;

    sweeper.stop();
    housekeeping.abort();
    // Connections accepted while draining
    state.supervisor.shutdown().await;
    info!("Gateway stopped");
    Ok(())
}

/// Bind the configured address and serve with the OpenAI-compatible backend
pub async fn run<F>(config: GatewayConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if config.upstream.api_key.is_empty() {
        warn!("OPENAI_API_KEY is not set; the provider will likely reject requests");
    }
    let backend =
        OpenAiBackend::from_config(&config.upstream).context("failed to create upstream client")?;

    let bind_addr = config.bind_addr();
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    let state = Arc::new(AppState::new(config, Arc::new(backend)));
    serve(state, listener, shutdown).await
}
