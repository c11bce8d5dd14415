use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use axum::{
    Router,
    body::Body as AxumBody,
    extract::{ConnectInfo, Request, State},
    response::Response,
};
use tower_http::trace::TraceLayer;

use crate::{core::server::ProxyServer, tracing_setup::create_request_span};

/// Inbound HTTP adapter: hands every request to the [`ProxyServer`].
#[derive(Clone)]
pub struct HttpHandler {
    server: Arc<ProxyServer>,
}

impl HttpHandler {
    pub fn new(server: Arc<ProxyServer>) -> Self {
        Self { server }
    }

    pub fn server(&self) -> &Arc<ProxyServer> {
        &self.server
    }

    pub async fn handle_request(
        &self,
        req: Request<AxumBody>,
        client_addr: SocketAddr,
    ) -> Response<AxumBody> {
        self.server
            .serve_request(req, client_addr.to_string())
            .await
    }

    /// Axum router sending every path and method through the proxy.
    ///
    /// Serve it with `into_make_service_with_connect_info::<SocketAddr>()` so
    /// the peer address is available.
    pub fn router(self) -> Router {
        Router::new()
            .fallback(dispatch)
            .layer(TraceLayer::new_for_http().make_span_with(|req: &Request<AxumBody>| {
                let request_id = uuid::Uuid::new_v4().to_string();
                create_request_span(req.method().as_str(), req.uri().path(), &request_id)
            }))
            .with_state(self)
    }
}

async fn dispatch(
    State(handler): State<HttpHandler>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    req: Request,
) -> Result<Response<AxumBody>, Infallible> {
    Ok(handler.handle_request(req, client_addr).await)
}
