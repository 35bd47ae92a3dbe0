//! Gateway Configuration
//!
//! All settings live in one [`GatewayConfig`] made of `#[serde(default)]`
//! sections. Values are layered:
//!
//! 1. Built-in defaults
//! 2. An optional TOML file
//! 3. Environment variables
//! 4. Command line flags (applied by the daemon)
//!
//! # Example file
//!
//! ```toml
//! [server]
//! port = 9000
//!
//! [upstream]
//! model = "gpt-4o-mini"
//!
//! [ws_limits]
//! rate = 60
//! burst = 80
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::context_window::ContextWindowConfig;
use crate::error::ConfigError;
use crate::rate_limit::RateLimitConfig;
use crate::supervisor::SupervisorConfig;
use crate::upstream::RetryPolicy;

// =============================================================================
// Sections
// =============================================================================

/// Listener settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind
    pub host: String,

    /// Port to bind
    pub port: u16,

    /// Origins allowed by CORS
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            cors_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:5173".to_string(),
            ],
        }
    }
}

/// Completion provider settings
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL of the OpenAI-compatible API
    pub base_url: String,

    /// Bearer token (empty = none)
    pub api_key: String,

    /// Model name sent with every request
    pub model: String,

    /// Ceiling for a single HTTP request, in seconds
    pub request_timeout_secs: u64,

    /// Default reply cap for completions
    pub completion_max_tokens: u32,

    /// Default reply cap for chat
    pub chat_max_tokens: u32,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "gpt-3.5-turbo".to_string(),
            request_timeout_secs: 60,
            completion_max_tokens: 50,
            chat_max_tokens: 500,
        }
    }
}

impl UpstreamConfig {
    /// Per-request timeout
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("base_url", &self.base_url)
            .field(
                "api_key",
                &if self.api_key.is_empty() { "<unset>" } else { "<redacted>" },
            )
            .field("model", &self.model)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("completion_max_tokens", &self.completion_max_tokens)
            .field("chat_max_tokens", &self.chat_max_tokens)
            .finish()
    }
}

// =============================================================================
// Gateway Configuration
// =============================================================================

/// Complete gateway configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener
    pub server: ServerConfig,

    /// Completion provider
    pub upstream: UpstreamConfig,

    /// Prompt context budgets
    pub context_window: ContextWindowConfig,

    /// Connection liveness
    pub supervisor: SupervisorConfig,

    /// Upstream retry policy
    pub retry: RetryPolicy,

    /// Admission control for HTTP endpoints, keyed by client IP
    pub http_limits: RateLimitConfig,

    /// Admission control for WebSocket frames, keyed by connection
    pub ws_limits: RateLimitConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            upstream: UpstreamConfig::default(),
            context_window: ContextWindowConfig::default(),
            supervisor: SupervisorConfig::default(),
            retry: RetryPolicy::default(),
            http_limits: RateLimitConfig::http(),
            ws_limits: RateLimitConfig::websocket(),
        }
    }
}

impl GatewayConfig {
    /// Default config file location (`<config dir>/inkwell/gateway.toml`)
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("inkwell").join("gateway.toml"))
    }

    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Load file and environment layers
    ///
    /// With an explicit `path` the file must exist. Without one the default
    /// location is used when present.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let file = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::default_path().filter(|p| p.is_file()),
        };

        let mut config = match file {
            Some(file) => {
                let raw = std::fs::read_to_string(&file)
                    .with_context(|| format!("failed to read config file {}", file.display()))?;
                let config = Self::from_toml_str(&raw)
                    .with_context(|| format!("failed to parse config file {}", file.display()))?;
                tracing::debug!(path = %file.display(), "Loaded config file");
                config
            }
            None => Self::default(),
        };

        config.apply_env();
        config.validate().context("invalid configuration")?;
        Ok(config)
    }

    /// Override values from the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Override values from an arbitrary variable source
    ///
    /// Unparseable values are ignored with a warning.
    ///
    /// Variables:
    /// - `OPENAI_API_KEY`, `OPENAI_API_BASE_URL`, `OPENAI_MODEL`
    /// - `CONTEXT_WINDOW_BEFORE`, `CONTEXT_WINDOW_AFTER`: token budgets
    /// - `HOST`, `PORT`
    /// - `INKWELL_HEARTBEAT_INTERVAL`, `INKWELL_CONNECTION_TIMEOUT`: seconds
    /// - `INKWELL_MAX_SEND_FAILURES`
    /// - `INKWELL_SEND_TIMEOUT`: seconds
    /// - `INKWELL_UPSTREAM_TIMEOUT`: seconds
    /// - `INKWELL_CORS_ORIGINS`: comma-separated
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("OPENAI_API_KEY") {
            self.upstream.api_key = key;
        }
        if let Some(url) = lookup("OPENAI_API_BASE_URL").filter(|v| !v.is_empty()) {
            self.upstream.base_url = url;
        }
        if let Some(model) = lookup("OPENAI_MODEL").filter(|v| !v.is_empty()) {
            self.upstream.model = model;
        }
        if let Some(host) = lookup("HOST").filter(|v| !v.is_empty()) {
            self.server.host = host;
        }
        if let Some(origins) = lookup("INKWELL_CORS_ORIGINS") {
            self.server.cors_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(String::from)
                .collect();
        }

        override_parsed(&lookup, "PORT", &mut self.server.port);
        override_parsed(
            &lookup,
            "CONTEXT_WINDOW_BEFORE",
            &mut self.context_window.before_tokens,
        );
        override_parsed(
            &lookup,
            "CONTEXT_WINDOW_AFTER",
            &mut self.context_window.after_tokens,
        );
        override_parsed(
            &lookup,
            "INKWELL_HEARTBEAT_INTERVAL",
            &mut self.supervisor.heartbeat_interval_secs,
        );
        override_parsed(
            &lookup,
            "INKWELL_CONNECTION_TIMEOUT",
            &mut self.supervisor.connection_timeout_secs,
        );
        override_parsed(
            &lookup,
            "INKWELL_MAX_SEND_FAILURES",
            &mut self.supervisor.max_send_failures,
        );
        override_parsed(
            &lookup,
            "INKWELL_SEND_TIMEOUT",
            &mut self.supervisor.send_timeout_secs,
        );
        override_parsed(
            &lookup,
            "INKWELL_UPSTREAM_TIMEOUT",
            &mut self.upstream.request_timeout_secs,
        );
    }

    /// Set the listener host
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.server.host = host.into();
        self
    }

    /// Set the listener port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.server.port = port;
        self
    }

    /// Set the provider base URL
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.upstream.base_url = base_url.into();
        self
    }

    /// Replace the supervisor settings
    #[must_use]
    pub fn with_supervisor(mut self, supervisor: SupervisorConfig) -> Self {
        self.supervisor = supervisor;
        self
    }

    /// Replace the retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the HTTP limits
    #[must_use]
    pub fn with_http_limits(mut self, limits: RateLimitConfig) -> Self {
        self.http_limits = limits;
        self
    }

    /// Replace the WebSocket limits
    #[must_use]
    pub fn with_ws_limits(mut self, limits: RateLimitConfig) -> Self {
        self.ws_limits = limits;
        self
    }

    /// `host:port` for the listener
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Check every section
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "upstream.base_url must not be empty".to_string(),
            ));
        }
        if self.upstream.model.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "upstream.model must not be empty".to_string(),
            ));
        }
        if self.upstream.request_timeout_secs == 0 {
            return Err(ConfigError::Zero {
                field: "upstream.request_timeout_secs",
            });
        }
        self.supervisor.validate()?;
        self.retry.validate()?;
        self.http_limits.validate("http_limits")?;
        self.ws_limits.validate("ws_limits")?;
        Ok(())
    }
}

fn override_parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *target = value,
        Err(_) => tracing::warn!(variable = key, value = %raw, "Ignoring unparseable variable"),
    }
}
