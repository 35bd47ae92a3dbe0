//! Gateway Daemon - Streaming Completion Server
//!
//! Entry point for the Inkwell gateway. Serves the WebSocket and HTTP API
//! in front of an OpenAI-compatible provider.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (0.0.0.0:8000)
//! OPENAI_API_KEY=sk-... gateway-daemon
//!
//! # Custom address and config file
//! gateway-daemon --host 127.0.0.1 --port 9000 --config ./gateway.toml
//!
//! # JSON logs, verbose
//! RUST_LOG=debug gateway-daemon --log-json
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: close all connections and exit

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use gateway_core::GatewayConfig;

/// Inkwell gateway - streaming completions over WebSocket and HTTP
#[derive(Parser, Debug)]
#[command(name = "gateway-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "INKWELL_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Interface to bind (overrides config and HOST)
    #[arg(long, value_name = "HOST")]
    host: Option<String>,

    /// Port to bind (overrides config and PORT)
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "INKWELL_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

/// Initialize logging with the specified level
fn init_logging(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "gateway_daemon={level},gateway_core={level},tower_http={level}"
        ))
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if json {
        builder.json().init();
    } else {
        builder.with_thread_ids(true).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT"),
        () = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level, args.log_json);

    info!("Gateway daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = GatewayConfig::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate().context("invalid configuration")?;

    info!(
        bind = %config.bind_addr(),
        model = %config.upstream.model,
        base_url = %config.upstream.base_url,
        heartbeat_secs = config.supervisor.heartbeat_interval_secs,
        timeout_secs = config.supervisor.connection_timeout_secs,
        "Configuration loaded"
    );

    if let Err(e) = gateway_daemon::run(config, shutdown_signal()).await {
        error!(error = %e, "Gateway failed");
        return Err(e);
    }

    info!("Gateway daemon stopped");
    Ok(())
}
