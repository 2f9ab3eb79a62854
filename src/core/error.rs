//! Gateway error taxonomy.
//!
//! Every failure on the forwarding path maps to one of these kinds, and each
//! kind maps to exactly one HTTP status. The user-visible body is a short
//! JSON `{"error": "<message>"}`; the stable signal for clients is the status
//! code plus the `X-Request-ID` response header.
use std::time::Duration;

use axum::{
    body::Body,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use http::{header, HeaderMap, StatusCode};

/// A fully buffered upstream response. The forwarder always reads the
/// upstream body to completion before anything is written back, so a partial
/// body can never reach the client.
#[derive(Debug)]
pub struct BufferedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl BufferedResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }
}

impl IntoResponse for BufferedResponse {
    fn into_response(self) -> Response {
        let mut response = Response::builder()
            .status(self.status)
            .body(Body::from(self.body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
        *response.headers_mut() = self.headers;
        response
    }
}

/// Failure kinds on the request path.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The matched service has no upstream targets.
    #[error("no targets available for service {service}")]
    NoTargets { service: String },

    /// The circuit breaker refused the call without invoking the upstream.
    #[error("service temporarily unavailable")]
    CircuitOpen,

    /// Configured upstream origin could not be parsed.
    #[error("invalid upstream target: {0}")]
    BadTarget(String),

    /// The outbound request could not be constructed.
    #[error("failed to build upstream request: {0}")]
    RequestBuild(String),

    /// Transport-level failure or timeout talking to the upstream.
    #[error("upstream request failed: {0}")]
    Upstream(String),

    /// A bounded-time operation exceeded its deadline.
    #[error("upstream operation timed out after {0:?}")]
    UpstreamTimeout(Duration),

    /// The upstream response body could not be read to completion.
    #[error("failed to read upstream response: {0}")]
    BodyRead(String),

    /// The upstream answered with a server error. The buffered response is
    /// relayed verbatim once the resilience chain has accounted for the
    /// failure.
    #[error("upstream returned {}", .response.status)]
    UpstreamStatus { response: BufferedResponse },

    /// Authentication failed (missing or invalid JWT / API key).
    #[error("{0}")]
    Unauthorized(String),

    /// CSRF token missing on a state-changing request.
    #[error("{0}")]
    Forbidden(String),

    /// Per-client rate limit exceeded.
    #[error("rate limit exceeded")]
    RateLimited,

    /// WebSocket upgrades are never forwarded over the HTTP path.
    #[error("websocket upgrade requests are not forwarded over http")]
    UpgradeRequest,

    /// Gateway-internal failure (body reads, header construction, ...).
    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::NoTargets { .. } | GatewayError::CircuitOpen => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::UpstreamStatus { response } => response.status,
            GatewayError::BadTarget(_)
            | GatewayError::RequestBuild(_)
            | GatewayError::BodyRead(_)
            | GatewayError::UpgradeRequest
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Build the standard `{"error": "..."}` JSON response.
pub fn error_response(status: StatusCode, message: &str) -> Response {
    let body = serde_json::json!({ "error": message }).to_string();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| status.into_response())
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match self {
            // Upstream error responses are relayed as-is, not re-wrapped.
            GatewayError::UpstreamStatus { response } => response.into_response(),
            other => error_response(other.status_code(), &other.to_string()),
        }
    }
}
