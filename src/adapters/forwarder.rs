//! HTTP reverse-proxy forwarding.
//!
//! Every target gets one [`Transport`] (a pooled hyper client configured from
//! the handler settings). [`MeteredTransport`] wraps it and reports timing,
//! status class and failures for every round trip.
use std::{net::SocketAddr, sync::Arc, time::Duration, time::Instant};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{
    HeaderMap, Request, Response, StatusCode, Uri, Version,
    body::Incoming,
    header::{self, HeaderName, HeaderValue},
};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use url::Url;

use crate::{
    adapters::{
        http_client::https_connector,
        tunnel::{RawTunnel, WebSocketTunnel},
    },
    core::{handler::HandlerSettings, target::Target},
    ports::forwarder::{ForwardError, ForwardKind, ForwardResult, Forwarder, ForwarderFactory},
    tracing_setup::create_backend_span,
};

type PooledClient = Client<HttpsConnector<HttpConnector>, AxumBody>;

/// Headers that describe a single hop and are never forwarded.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Builds the hyper-backed forwarders.
#[derive(Debug, Default, Clone, Copy)]
pub struct HyperForwarderFactory;

impl ForwarderFactory for HyperForwarderFactory {
    fn build(
        &self,
        kind: ForwardKind,
        settings: &HandlerSettings,
        cancel: CancellationToken,
    ) -> Arc<dyn Forwarder> {
        match kind {
            ForwardKind::Http => Arc::new(HttpForwarder::new(settings, cancel)),
            ForwardKind::Raw => Arc::new(RawTunnel::new(settings, cancel)),
            ForwardKind::WebSocket => Arc::new(WebSocketTunnel::new(settings, cancel)),
        }
    }
}

/// Pooled upstream client shared by every request to one target.
pub struct Transport {
    client: ArcSwapOption<PooledClient>,
    response_header_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl Transport {
    pub fn new(settings: &HandlerSettings, cancel: CancellationToken) -> Self {
        let mut http_connector = HttpConnector::new();
        http_connector.set_connect_timeout(settings.dial_timeout);
        http_connector.set_keepalive(settings.keep_alive_timeout);
        http_connector.set_nodelay(true);

        let mut builder = Client::builder(TokioExecutor::new());
        if settings.disable_keep_alives {
            builder.pool_max_idle_per_host(0);
        } else if settings.max_conn > 0 {
            builder.pool_max_idle_per_host(settings.max_conn);
        }
        if let Some(idle) = settings.keep_alive_timeout {
            builder.pool_idle_timeout(idle);
        }
        let client = builder.build::<_, AxumBody>(https_connector(http_connector));

        Self {
            client: ArcSwapOption::from_pointee(client),
            response_header_timeout: settings.response_header_timeout,
            cancel,
        }
    }

    /// Send `req` and wait for the response headers.
    ///
    /// Bounded by the response-header timeout. A round trip that has started
    /// keeps its own handle on the pool, so closing the transport only
    /// refuses later requests and never cuts one short.
    pub async fn round_trip(&self, req: Request<AxumBody>) -> ForwardResult<Response<Incoming>> {
        if self.cancel.is_cancelled() {
            return Err(ForwardError::Closed);
        }
        let client = self.client.load_full().ok_or(ForwardError::Closed)?;

        let pending = client.request(req);
        let result = match self.response_header_timeout {
            Some(limit) => tokio::time::timeout(limit, pending)
                .await
                .map_err(|_| ForwardError::Timeout(limit))?,
            None => pending.await,
        };
        result.map_err(|e| ForwardError::Transport(e.to_string()))
    }

    /// Drop the pool; later round trips fail with [`ForwardError::Closed`].
    pub fn close(&self) {
        self.client.store(None);
    }
}

/// Transport wrapper that feeds the stats collector and target counters.
pub struct MeteredTransport {
    inner: Transport,
}

impl MeteredTransport {
    pub fn new(inner: Transport) -> Self {
        Self { inner }
    }

    pub async fn round_trip(
        &self,
        target: &Target,
        req: Request<AxumBody>,
    ) -> ForwardResult<Response<Incoming>> {
        let started = Instant::now();
        let result = self.inner.round_trip(req).await;

        let status = result.as_ref().ok().map(Response::status);
        let stats = target.stats();
        stats.set_time(target.id(), started);
        stats.set_increment(&format!("{}.{}", target.id(), status_class(status)), 1);
        target.record_request(status.is_none_or(|s| s.is_server_error()));

        result
    }

    pub fn close(&self) {
        self.inner.close();
    }
}

/// `2xx`..`5xx` for the status, `5xx` when there was no response, `xxx` otherwise.
pub fn status_class(status: Option<StatusCode>) -> &'static str {
    match status.map(|s| s.as_u16()) {
        None | Some(500..=599) => "5xx",
        Some(400..=499) => "4xx",
        Some(300..=399) => "3xx",
        Some(200..=299) => "2xx",
        Some(_) => "xxx",
    }
}

/// Framed reverse proxy to a single target.
pub struct HttpForwarder {
    transport: MeteredTransport,
    disable_compression: bool,
    disable_keep_alives: bool,
}

impl HttpForwarder {
    pub fn new(settings: &HandlerSettings, cancel: CancellationToken) -> Self {
        Self {
            transport: MeteredTransport::new(Transport::new(settings, cancel)),
            disable_compression: settings.disable_compression,
            disable_keep_alives: settings.disable_keep_alives,
        }
    }

    fn prepare(
        &self,
        target: &Url,
        mut req: Request<AxumBody>,
        client: SocketAddr,
    ) -> ForwardResult<Request<AxumBody>> {
        *req.uri_mut() = rewrite_uri(target, req.uri())?;
        *req.version_mut() = Version::HTTP_11;

        let headers = req.headers_mut();
        strip_hop_by_hop(headers);
        append_forwarded_for(headers, client);
        if self.disable_compression {
            headers.remove(header::ACCEPT_ENCODING);
        }
        if self.disable_keep_alives {
            headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        }
        Ok(req)
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(
        &self,
        target: &Target,
        req: Request<AxumBody>,
        client: SocketAddr,
    ) -> ForwardResult<Response<AxumBody>> {
        let req = self.prepare(target.url(), req, client)?;

        let span = create_backend_span(target.id(), req.method().as_str(), req.uri().path());

        match self
            .transport
            .round_trip(target, req)
            .instrument(span.clone())
            .await
        {
            Ok(response) => {
                span.record("http.status_code", response.status().as_u16());
                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                Ok(Response::from_parts(parts, AxumBody::new(body)))
            }
            Err(e) => {
                span.record("http.status_code", 599u16);
                tracing::warn!(target_id = %target.id(), error = %e, "upstream round trip failed");
                Err(e)
            }
        }
    }

    fn close(&self) {
        self.transport.close();
    }
}

/// Point `original` at `target`: scheme and authority from the target, the
/// target path prefix joined with the request path, both queries merged.
pub fn rewrite_uri(target: &Url, original: &Uri) -> ForwardResult<Uri> {
    let path = join_paths(target.path(), original.path());
    let path_and_query = match (target.query(), original.query()) {
        (Some(a), Some(b)) if !a.is_empty() => format!("{path}?{a}&{b}"),
        (Some(a), None) if !a.is_empty() => format!("{path}?{a}"),
        (_, Some(b)) => format!("{path}?{b}"),
        _ => path,
    };

    Uri::builder()
        .scheme(target.scheme())
        .authority(authority(target))
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| ForwardError::Transport(format!("cannot build upstream uri: {e}")))
}

/// `host[:port]` of `url`, brackets kept for IPv6.
pub fn authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Like [`authority`] but always carries a port, for raw dials.
pub fn socket_authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    let port = url.port_or_known_default().unwrap_or(80);
    format!("{host}:{port}")
}

fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{base}{}", &path[1..]),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, client: SocketAddr) {
    let ip = client.ip().to_string();
    let value = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.is_empty() => format!("{prior}, {ip}"),
        _ => ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert("x-forwarded-for", value);
    }
}
