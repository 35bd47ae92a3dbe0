//! Gateway Error Types
//!
//! Failure taxonomy shared by the upstream caller, the retry policy and the
//! connection supervisor. Upstream failures are classified into a small set
//! of [`FailureKind`]s; the retry policy decides per kind whether another
//! attempt is worthwhile.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of an upstream failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The request exceeded the client-side timeout
    Timeout,
    /// Could not connect, or the connection broke while talking to the provider
    Connection,
    /// The provider answered 429
    RateLimited,
    /// The provider answered with a 5xx status
    ServerError,
    /// Anything else (bad request, auth failure, malformed payload, ...)
    Other,
}

impl FailureKind {
    /// The four kinds considered transient by default
    pub const TRANSIENT: [FailureKind; 4] = [
        FailureKind::Timeout,
        FailureKind::Connection,
        FailureKind::RateLimited,
        FailureKind::ServerError,
    ];

    /// Whether this kind is in the default transient set
    #[must_use]
    pub fn is_transient(self) -> bool {
        Self::TRANSIENT.contains(&self)
    }

    /// Stable lowercase name used in logs
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connection => "connection",
            Self::RateLimited => "rate_limited",
            Self::ServerError => "server_error",
            Self::Other => "other",
        }
    }

    /// Classify an HTTP status returned by the provider
    #[must_use]
    pub fn from_status(status: u16) -> Self {
        match status {
            408 => Self::Timeout,
            429 => Self::RateLimited,
            500..=599 => Self::ServerError,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single failed interaction with the completion provider
#[derive(Clone, Debug, Error, PartialEq)]
#[error("{kind} error: {message}")]
pub struct UpstreamError {
    /// Failure classification
    pub kind: FailureKind,
    /// Human-readable detail
    pub message: String,
    /// HTTP status, when the provider answered at all
    pub status: Option<u16>,
}

impl UpstreamError {
    /// Create an error of the given kind
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
        }
    }

    /// Create an error from a non-success HTTP status and response body
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::from_status(status),
            message: format!("provider returned {status}: {}", body.into()),
            status: Some(status),
        }
    }

    /// Shorthand for [`FailureKind::Timeout`]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    /// Shorthand for [`FailureKind::Connection`]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Connection, message)
    }

    /// Shorthand for [`FailureKind::Other`]
    pub fn other(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Other, message)
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(error: reqwest::Error) -> Self {
        let kind = if error.is_timeout() {
            FailureKind::Timeout
        } else if error.is_connect() || error.is_request() || error.is_body() {
            FailureKind::Connection
        } else if let Some(status) = error.status() {
            FailureKind::from_status(status.as_u16())
        } else {
            FailureKind::Other
        };

        Self {
            kind,
            message: error.to_string(),
            status: error.status().map(|s| s.as_u16()),
        }
    }
}

/// Anything the retry loop can classify
pub trait Classify {
    /// The failure kind used to consult the retry policy
    fn failure_kind(&self) -> FailureKind;
}

impl Classify for UpstreamError {
    fn failure_kind(&self) -> FailureKind {
        self.kind
    }
}

/// Outcome of a call that went through a [`RetryPolicy`](crate::upstream::RetryPolicy)
#[derive(Clone, Debug, Error, PartialEq)]
pub enum RetryError<E> {
    /// A non-retryable failure; surfaced on the attempt it happened
    #[error("attempt {attempt} failed: {error}")]
    Fatal {
        /// 1-based attempt number
        attempt: u32,
        /// The failure
        error: E,
    },

    /// Every allowed attempt failed with a retryable failure
    #[error("gave up after {attempts} attempts, last error: {last}")]
    Exhausted {
        /// Number of attempts made
        attempts: u32,
        /// The final failure
        last: E,
    },
}

impl<E> RetryError<E> {
    /// The underlying failure (the last one for exhausted calls)
    pub fn inner(&self) -> &E {
        match self {
            Self::Fatal { error, .. } => error,
            Self::Exhausted { last, .. } => last,
        }
    }

    /// Number of attempts that were made
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Fatal { attempt, .. } => *attempt,
            Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    /// Whether the retry budget ran out
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

impl<E: Classify> RetryError<E> {
    /// Kind of the underlying failure
    pub fn kind(&self) -> FailureKind {
        self.inner().failure_kind()
    }
}

/// Error from an upstream call made with retries
pub type CallError = RetryError<UpstreamError>;

/// Failures reported by a connection transport
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The peer is gone; the transport can never be used again
    #[error("transport closed")]
    Closed,

    /// A single write failed; the transport may still be usable
    #[error("transport write failed: {0}")]
    Io(String),
}

/// Configuration problems detected by [`GatewayConfig::validate`](crate::config::GatewayConfig::validate)
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A numeric setting that must be positive was zero
    #[error("{field} must be greater than zero")]
    Zero {
        /// Dotted path of the offending field
        field: &'static str,
    },

    /// Two settings contradict each other
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
