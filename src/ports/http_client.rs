use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Custom error type for HTTP client operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Error when connection to the target fails
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error when the probe times out
    #[error("Timeout error after {0:?}")]
    Timeout(Duration),

    /// Error when the probe URL cannot be turned into a request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient defines the port used by the health checker to probe targets.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Issue a GET to `url` bounded by `timeout`.
    ///
    /// # Returns
    /// `Ok(true)` when the target answered `200 OK`, `Ok(false)` for any other
    /// status, an error when no response arrived.
    async fn health_check(&self, url: &str, timeout: Duration) -> HttpClientResult<bool>;
}
