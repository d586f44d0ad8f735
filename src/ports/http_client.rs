use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response, StatusCode};
use thiserror::Error;

/// Custom error type for HTTP client operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Error when connection to backend fails, or the upstream response is malformed
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error when request times out
    #[error("Timeout error after {0:?}")]
    Timeout(Duration),

    /// Error when request is invalid
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl HttpClientError {
    /// Transport failures are worth another attempt; a request we could not
    /// even build will fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HttpClientError::ConnectionError(_) | HttpClientError::Timeout(_)
        )
    }
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient defines the port (interface) for making HTTP requests to backends
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send an HTTP request to a backend server
    ///
    /// Any status the backend answers with is a successful call; only
    /// transport problems surface as errors.
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>>;

    /// GET `url` and report the status code, bounded by `timeout`
    async fn health_check(&self, url: &str, timeout: Duration) -> HttpClientResult<StatusCode>;
}
