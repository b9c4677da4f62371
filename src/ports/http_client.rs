use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use hyper::{Request, Response};
use thiserror::Error;

/// Errors from forwarding a request to an upstream target.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum UpstreamError {
    /// Connecting to or talking with the upstream failed.
    #[error("connection error: {0}")]
    Connect(String),

    /// The call exceeded its deadline.
    #[error("upstream call timed out after {0:?}")]
    Timeout(Duration),

    /// The downstream client went away while the call was in flight.
    #[error("request canceled by client")]
    Canceled,

    /// The outgoing request could not be constructed.
    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for upstream client operations.
pub type UpstreamResult<T> = Result<T, UpstreamError>;

/// Port for the shared upstream HTTP client.
///
/// The pipeline distinguishes [`UpstreamError::Canceled`] (recorded as
/// status 499) from every other failure (502); implementations must
/// classify accordingly.
#[async_trait]
pub trait UpstreamClient: Send + Sync + 'static {
    /// Forward a fully-rewritten request to its upstream, bounded by
    /// `deadline`. The request body is streamed, not buffered.
    async fn forward(
        &self,
        req: Request<Body>,
        deadline: Duration,
    ) -> UpstreamResult<Response<Body>>;

    /// Issue a health probe GET. Success means a response status in
    /// `[200, 400)` observed before `timeout`; transport failures and
    /// timeouts are both unhealthy.
    async fn probe(&self, url: &str, timeout: Duration) -> bool;
}
