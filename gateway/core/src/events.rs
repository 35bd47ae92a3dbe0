//! Wire Protocol Types
//!
//! Everything that crosses the client boundary: identifiers, inbound request
//! frames and outbound stream events.
//!
//! # Outbound frames
//!
//! [`StreamEvent`] is a closed enum. On the wire it is flattened into a
//! single JSON object with a `type` tag, optional payload fields and a
//! derived `status` string the front-end keys on:
//!
//! ```text
//! {"type":"start","status":"processing","request_id":"req-…","action":"rewrite"}
//! {"type":"token","status":"processing","request_id":"req-…","action":"rewrite","token":"Hel","index":0}
//! {"type":"end","status":"success","request_id":"req-…","action":"rewrite","completion":"Hello"}
//! {"type":"error","status":"error","code":"rate_limited","error":"…","retry_after":6}
//! {"type":"heartbeat","status":"ok","timestamp":1718000000.5}
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::ChatMessage;
use crate::error::{CallError, FailureKind};

// =============================================================================
// Identifiers
// =============================================================================

/// Unique identifier for a client connection
///
/// Assigned on accept and stable for the lifetime of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Create a new unique connection ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Unique identifier for one logical request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Create a new unique request ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

// =============================================================================
// Actions
// =============================================================================

/// The operation a client asks for
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Continue the text at the cursor
    #[default]
    Completion,
    /// Rephrase, keeping the meaning
    Rewrite,
    /// Add detail
    Expand,
    /// Shorten and clarify
    Simplify,
    /// Translate into `target_language`
    Translate,
}

impl Action {
    /// Admission cost in limiter tokens
    #[must_use]
    pub fn cost(self) -> f64 {
        match self {
            Self::Completion => 1.0,
            Self::Rewrite | Self::Expand | Self::Simplify | Self::Translate => 2.0,
        }
    }

    /// Whether this action rewrites the given text rather than continuing it
    #[must_use]
    pub fn is_transform(self) -> bool {
        matches!(
            self,
            Self::Rewrite | Self::Expand | Self::Simplify | Self::Translate
        )
    }

    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completion => "completion",
            Self::Rewrite => "rewrite",
            Self::Expand => "expand",
            Self::Simplify => "simplify",
            Self::Translate => "translate",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Inbound Requests
// =============================================================================

/// A completion or transform request, from a WebSocket frame or an HTTP body
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct ClientRequest {
    /// The text to continue or transform
    #[serde(default)]
    pub text: String,

    /// Requested operation
    #[serde(default)]
    pub action: Action,

    /// Text preceding the edit point
    #[serde(default)]
    pub context_before: Option<String>,

    /// Text following the edit point
    #[serde(default)]
    pub context_after: Option<String>,

    /// Character index of the cursor inside `text`
    #[serde(default)]
    pub cursor_position: Option<usize>,

    /// Sampling temperature
    #[serde(default)]
    pub temperature: Option<f32>,

    /// Target language for [`Action::Translate`]
    #[serde(default)]
    pub target_language: Option<String>,

    /// Reply length cap (HTTP only)
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl ClientRequest {
    /// Create a request for an action on some text
    pub fn new(action: Action, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            action,
            ..Default::default()
        }
    }

    /// Parse a WebSocket text frame
    pub fn from_frame(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }

    /// Set the cursor position
    #[must_use]
    pub fn with_cursor(mut self, cursor: usize) -> Self {
        self.cursor_position = Some(cursor);
        self
    }

    /// Set the temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// A chat turn submitted over HTTP
///
/// History is supplied by the client on every call and never stored.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct ChatTurn {
    /// The new user message
    pub message: String,

    /// Excerpt of the document being edited
    #[serde(default)]
    pub context: Option<String>,

    /// Earlier turns, oldest first
    #[serde(default)]
    pub conversation_history: Vec<ChatMessage>,

    /// Reply length cap
    #[serde(default)]
    pub max_tokens: Option<u32>,

    /// Sampling temperature
    #[serde(default)]
    pub temperature: Option<f32>,
}

// =============================================================================
// Outbound Events
// =============================================================================

/// Machine-readable error category carried by error frames
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The frame or body could not be understood
    InvalidRequest,
    /// Admission control denied the request
    RateLimited,
    /// The provider rejected the request
    UpstreamError,
    /// Transient provider failures outlasted the retry budget
    UpstreamUnavailable,
    /// The provider did not answer in time
    UpstreamTimeout,
    /// The reply stream broke after it started
    StreamInterrupted,
}

impl ErrorCode {
    /// Map a failed upstream call to the code shown to clients
    #[must_use]
    pub fn for_call_error(error: &CallError) -> Self {
        if error.kind() == FailureKind::Timeout {
            Self::UpstreamTimeout
        } else if error.is_exhausted() {
            Self::UpstreamUnavailable
        } else {
            Self::UpstreamError
        }
    }
}

/// One outbound frame
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireFrame", try_from = "WireFrame")]
pub enum StreamEvent {
    /// Streaming for a request began
    Start {
        /// Request being answered
        request_id: RequestId,
        /// Operation being performed
        action: Action,
    },

    /// One incremental delta
    Token {
        /// Request being answered
        request_id: RequestId,
        /// Operation being performed
        action: Action,
        /// Delta text
        token: String,
        /// Position of this delta within the request, from 0
        index: u32,
    },

    /// The request finished
    End {
        /// Request being answered
        request_id: RequestId,
        /// Operation being performed
        action: Action,
        /// Full generated text
        completion: String,
    },

    /// The request failed (or could not start)
    Error {
        /// Request that failed, if one was assigned
        request_id: Option<RequestId>,
        /// Operation that failed, if known
        action: Option<Action>,
        /// Error category
        code: ErrorCode,
        /// Human-readable detail
        error: String,
        /// Seconds to wait before retrying, for admission denials
        retry_after: Option<u64>,
    },

    /// Informational message from the gateway
    System {
        /// Message text
        message: String,
    },

    /// Liveness probe
    Heartbeat {
        /// Unix time in seconds
        timestamp: f64,
    },
}

impl StreamEvent {
    /// Build an error frame without a request context
    pub fn error(code: ErrorCode, error: impl Into<String>) -> Self {
        Self::Error {
            request_id: None,
            action: None,
            code,
            error: error.into(),
            retry_after: None,
        }
    }

    /// Build an admission-denied frame
    pub fn rate_limited(action: Action, retry_after: u64) -> Self {
        Self::Error {
            request_id: None,
            action: Some(action),
            code: ErrorCode::RateLimited,
            error: format!("Too many requests, retry in {retry_after} seconds"),
            retry_after: Some(retry_after),
        }
    }

    /// Build a heartbeat stamped with the current time
    #[must_use]
    pub fn heartbeat() -> Self {
        let now = chrono::Utc::now();
        Self::Heartbeat {
            timestamp: now.timestamp_millis() as f64 / 1000.0,
        }
    }

    /// Wire `type` tag
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Token { .. } => "token",
            Self::End { .. } => "end",
            Self::Error { .. } => "error",
            Self::System { .. } => "system",
            Self::Heartbeat { .. } => "heartbeat",
        }
    }

    /// Derived `status` field
    #[must_use]
    pub fn status(&self) -> &'static str {
        match self {
            Self::Start { .. } | Self::Token { .. } => "processing",
            Self::End { .. } => "success",
            Self::Error { .. } => "error",
            Self::System { .. } | Self::Heartbeat { .. } => "ok",
        }
    }

    /// Whether this frame ends a logical request
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End { .. } | Self::Error { .. })
    }

    /// Request this frame belongs to, if any
    #[must_use]
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::Start { request_id, .. }
            | Self::Token { request_id, .. }
            | Self::End { request_id, .. } => Some(*request_id),
            Self::Error { request_id, .. } => *request_id,
            Self::System { .. } | Self::Heartbeat { .. } => None,
        }
    }

    /// Serialize to a JSON text frame
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// =============================================================================
// Wire Representation
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum FrameKind {
    Start,
    Token,
    End,
    Error,
    System,
    Heartbeat,
}

/// Flat JSON shape of a [`StreamEvent`]
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct WireFrame {
    #[serde(rename = "type")]
    kind: Option<FrameKind>,
    #[serde(default)]
    status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    action: Option<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    completion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<f64>,
}

impl From<StreamEvent> for WireFrame {
    fn from(event: StreamEvent) -> Self {
        let status = event.status().to_string();
        match event {
            StreamEvent::Start { request_id, action } => Self {
                kind: Some(FrameKind::Start),
                status,
                request_id: Some(request_id.to_string()),
                action: Some(action),
                ..Default::default()
            },
            StreamEvent::Token {
                request_id,
                action,
                token,
                index,
            } => Self {
                kind: Some(FrameKind::Token),
                status,
                request_id: Some(request_id.to_string()),
                action: Some(action),
                token: Some(token),
                index: Some(index),
                ..Default::default()
            },
            StreamEvent::End {
                request_id,
                action,
                completion,
            } => Self {
                kind: Some(FrameKind::End),
                status,
                request_id: Some(request_id.to_string()),
                action: Some(action),
                completion: Some(completion),
                ..Default::default()
            },
            StreamEvent::Error {
                request_id,
                action,
                code,
                error,
                retry_after,
            } => Self {
                kind: Some(FrameKind::Error),
                status,
                request_id: request_id.map(|id| id.to_string()),
                action,
                code: Some(code),
                error: Some(error),
                retry_after,
                ..Default::default()
            },
            StreamEvent::System { message } => Self {
                kind: Some(FrameKind::System),
                status,
                message: Some(message),
                ..Default::default()
            },
            StreamEvent::Heartbeat { timestamp } => Self {
                kind: Some(FrameKind::Heartbeat),
                status,
                timestamp: Some(timestamp),
                ..Default::default()
            },
        }
    }
}

fn parse_request_id(raw: &str) -> Result<RequestId, String> {
    raw.strip_prefix("req-")
        .and_then(|uuid| Uuid::parse_str(uuid).ok())
        .map(RequestId)
        .ok_or_else(|| format!("invalid request_id {raw:?}"))
}

fn required<T>(field: Option<T>, name: &str) -> Result<T, String> {
    field.ok_or_else(|| format!("missing field `{name}`"))
}

impl TryFrom<WireFrame> for StreamEvent {
    type Error = String;

    fn try_from(frame: WireFrame) -> Result<Self, String> {
        let kind = required(frame.kind, "type")?;
        let request_id = frame
            .request_id
            .as_deref()
            .map(parse_request_id)
            .transpose()?;

        let event = match kind {
            FrameKind::Start => StreamEvent::Start {
                request_id: required(request_id, "request_id")?,
                action: required(frame.action, "action")?,
            },
            FrameKind::Token => StreamEvent::Token {
                request_id: required(request_id, "request_id")?,
                action: required(frame.action, "action")?,
                token: required(frame.token, "token")?,
                index: required(frame.index, "index")?,
            },
            FrameKind::End => StreamEvent::End {
                request_id: required(request_id, "request_id")?,
                action: required(frame.action, "action")?,
                completion: required(frame.completion, "completion")?,
            },
            FrameKind::Error => StreamEvent::Error {
                request_id,
                action: frame.action,
                code: required(frame.code, "code")?,
                error: frame.error.unwrap_or_default(),
                retry_after: frame.retry_after,
            },
            FrameKind::System => StreamEvent::System {
                message: frame.message.unwrap_or_default(),
            },
            FrameKind::Heartbeat => StreamEvent::Heartbeat {
                timestamp: required(frame.timestamp, "timestamp")?,
            },
        };
        Ok(event)
    }
}
