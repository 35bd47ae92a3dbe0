//! HTTP Error Responses
//!
//! Maps gateway failures onto status codes and a small JSON body:
//!
//! ```text
//! {"status":"error","code":"rate_limited","detail":"Too many requests, retry in 6 seconds"}
//! ```

use axum::extract::rejection::JsonRejection;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use gateway_core::{CallError, ErrorCode};

/// Failure of an HTTP endpoint
#[derive(Debug, Error)]
pub enum ApiError {
    /// The body could not be understood
    #[error("{0}")]
    InvalidRequest(String),

    /// Admission control denied the request
    #[error("Too many requests, retry in {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds until the same request would be admitted
        retry_after_secs: u64,
    },

    /// The provider call failed
    #[error("{0}")]
    Upstream(#[from] CallError),
}

/// JSON body of an error response
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Always `"error"`
    pub status: &'static str,
    /// Machine-readable category
    pub code: ErrorCode,
    /// Human-readable detail
    pub detail: String,
}

impl ApiError {
    /// Wire error code
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidRequest(_) => ErrorCode::InvalidRequest,
            Self::RateLimited { .. } => ErrorCode::RateLimited,
            Self::Upstream(e) => ErrorCode::for_call_error(e),
        }
    }

    /// HTTP status
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self.code() {
            ErrorCode::InvalidRequest => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::UpstreamError | ErrorCode::StreamInterrupted => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::InvalidRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %self, "Request failed upstream");
        }

        let retry_after = match &self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        };
        let body = ErrorBody {
            status: "error",
            code: self.code(),
            detail: self.to_string(),
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

/// Result type for handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::{RetryError, UpstreamError};

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ApiError::InvalidRequest("bad".into()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ApiError::RateLimited { retry_after_secs: 3 }.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );

        let fatal = ApiError::from(RetryError::Fatal {
            attempt: 1,
            error: UpstreamError::from_status(401, "bad key"),
        });
        assert_eq!(fatal.status_code(), StatusCode::BAD_GATEWAY);

        let exhausted = ApiError::from(RetryError::Exhausted {
            attempts: 3,
            last: UpstreamError::from_status(503, "busy"),
        });
        assert_eq!(exhausted.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let timeout = ApiError::from(RetryError::Exhausted {
            attempts: 3,
            last: UpstreamError::timeout("slow"),
        });
        assert_eq!(timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_rate_limited_response_has_retry_after() {
        let response = ApiError::RateLimited { retry_after_secs: 7 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "7");
    }
}
