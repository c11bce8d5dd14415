use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::{handler::HandlerSettings, target::Target};

/// Errors raised while forwarding a request to a target.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ForwardError {
    /// The upstream round trip failed before a response arrived
    #[error("upstream transport error: {0}")]
    Transport(String),

    /// No response headers within the handler's response-header timeout
    #[error("upstream did not respond within {0:?}")]
    Timeout(std::time::Duration),

    /// The target (or its handler) has been closed
    #[error("forwarder closed")]
    Closed,

    /// Dialing the target for a tunnel failed
    #[error("dial failed: {0}")]
    Dial(#[from] std::io::Error),

    /// The inbound connection could not be taken over
    #[error("connection upgrade failed: {0}")]
    Upgrade(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    /// The request claims an upgrade but is missing what the handshake needs
    #[error("bad upgrade request: {0}")]
    BadUpgrade(String),
}

pub type ForwardResult<T> = Result<T, ForwardError>;

/// The three ways a target can be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForwardKind {
    /// Framed HTTP reverse proxy through the shared transport
    Http,
    /// Opaque byte splice after re-sending the request line and headers
    Raw,
    /// WebSocket upgrade answered locally and relayed message by message
    WebSocket,
}

/// Forwarder defines the port for moving one request to one target.
///
/// A forwarder is built once per target and kind and then reused for every
/// request routed there.
#[async_trait]
pub trait Forwarder: Send + Sync + 'static {
    /// Forward `req`, received from `client`, to `target`.
    async fn forward(
        &self,
        target: &Target,
        req: Request<AxumBody>,
        client: SocketAddr,
    ) -> ForwardResult<Response<AxumBody>>;

    /// Release pooled connections. Later calls to `forward` fail with
    /// [`ForwardError::Closed`].
    fn close(&self) {}
}

/// Builds forwarders for a target on first use.
pub trait ForwarderFactory: Send + Sync + 'static {
    fn build(
        &self,
        kind: ForwardKind,
        settings: &HandlerSettings,
        cancel: CancellationToken,
    ) -> Arc<dyn Forwarder>;
}
