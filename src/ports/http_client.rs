use async_trait::async_trait;
use axum::body::Body;
use hyper::{Request, Response};
use thiserror::Error;

/// Errors surfaced by the upstream HTTP client.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Connection to the upstream failed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The request exceeded its deadline.
    #[error("Timeout after {0:?}")]
    Timeout(std::time::Duration),

    /// The request could not be sent as constructed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// Port (interface) for the process-wide upstream HTTP client. The forwarder
/// and the health prober talk to upstreams exclusively through this trait so
/// tests can substitute a fake.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Execute a fully composed upstream request and return the raw response.
    async fn execute(&self, req: Request<Body>) -> HttpClientResult<Response<Body>>;

    /// Probe a URL; resolves to `true` when the upstream answers with a
    /// success status inside `timeout_secs`. Connection failures resolve to
    /// `Ok(false)` rather than an error.
    async fn probe(&self, url: &str, timeout_secs: u64) -> HttpClientResult<bool>;
}
