//! Per-request state shared between the dispatcher and middleware.
use axum::body::Body as AxumBody;
use hyper::{
    HeaderMap, Request, Response, StatusCode,
    header::{self, HeaderName, HeaderValue},
};

use crate::core::router::Params;

/// Headers consulted, in order, when looking for the originating client IP.
pub const CLIENT_IP_HEADERS: [&str; 12] = [
    "x-forwarded-for",
    "x-real-ip",
    "proxy-client-ip",
    "wl-proxy-client-ip",
    "http_x_forwarded_for",
    "http_x_forwarded",
    "http_x_cluster_client_ip",
    "http_client_ip",
    "http_forwarded_for",
    "http_forwarded",
    "http_via",
    "remote_addr",
];

/// A step in a handler's middleware chain.
///
/// Middleware may rewrite the request or terminate it by writing a response
/// (for example with [`RequestContext::unauthorized`]). A finished context is
/// never forwarded.
pub trait Middleware: Send + Sync + 'static {
    fn handle(&self, ctx: &mut RequestContext);
}

impl<F> Middleware for F
where
    F: Fn(&mut RequestContext) + Send + Sync + 'static,
{
    fn handle(&self, ctx: &mut RequestContext) {
        self(ctx)
    }
}

/// Mutable request/response bag for one inbound request.
#[derive(Debug)]
pub struct RequestContext {
    request: Request<AxumBody>,
    remote_addr: String,
    params: Params,
    finished: bool,
    written: bool,
    status: StatusCode,
    response_headers: HeaderMap,
    body: Option<String>,
}

impl RequestContext {
    pub fn new(request: Request<AxumBody>, remote_addr: impl Into<String>) -> Self {
        Self {
            request,
            remote_addr: remote_addr.into(),
            params: Params::new(),
            finished: false,
            written: false,
            status: StatusCode::OK,
            response_headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn request(&self) -> &Request<AxumBody> {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request<AxumBody> {
        &mut self.request
    }

    /// Peer address as reported by the listener, expected as `host:port`.
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// First usable client IP found in [`CLIENT_IP_HEADERS`].
    ///
    /// Empty values and the literal `unknown` are skipped. For
    /// `X-Forwarded-For` only the first hop is returned.
    pub fn client_ip(&self) -> Option<String> {
        let headers = self.request.headers();
        CLIENT_IP_HEADERS.iter().find_map(|name| {
            let value = headers.get(*name)?.to_str().ok()?;
            let first = value.split(',').next().unwrap_or_default().trim();
            if first.is_empty() || first.eq_ignore_ascii_case("unknown") {
                None
            } else {
                Some(first.to_string())
            }
        })
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_written(&self) -> bool {
        self.written
    }

    /// Mark the request as handled; the dispatcher stops forwarding it.
    pub fn finish(&mut self) {
        self.finished = true;
    }

    /// Add a header to the short-circuit response.
    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.response_headers.append(name, value);
    }

    pub fn as_json(&mut self) {
        self.set_header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
    }

    /// Write the short-circuit body and finish the context. Ignored once a
    /// body has already been written.
    pub fn write(&mut self, body: impl Into<String>) {
        if self.written {
            tracing::warn!(path = %self.request.uri().path(), "response already written");
            return;
        }
        self.body = Some(body.into());
        self.written = true;
        self.finish();
    }

    /// Respond with the structured JSON error for `status`.
    pub fn with_status(&mut self, status: StatusCode) {
        if self.written {
            tracing::warn!(path = %self.request.uri().path(), %status, "response already written");
            return;
        }
        self.status = status;
        self.as_json();
        self.write(error_body(status));
    }

    pub fn unauthorized(&mut self) {
        self.with_status(StatusCode::UNAUTHORIZED);
    }

    pub fn forbidden(&mut self) {
        self.with_status(StatusCode::FORBIDDEN);
    }

    pub fn not_found(&mut self) {
        self.with_status(StatusCode::NOT_FOUND);
    }

    pub fn none_available(&mut self) {
        self.with_status(StatusCode::SERVICE_UNAVAILABLE);
    }

    /// Build the short-circuit response accumulated so far.
    pub fn into_response(self) -> Response<AxumBody> {
        let mut response = Response::new(self.body.map(AxumBody::from).unwrap_or_default());
        *response.status_mut() = self.status;
        *response.headers_mut() = self.response_headers;
        response
    }

    /// Hand the (possibly rewritten) request over for forwarding.
    pub fn into_request(self) -> Request<AxumBody> {
        self.request
    }
}

/// `{"error": true, "code": N, "message": "<reason>"}`
pub fn error_body(status: StatusCode) -> String {
    serde_json::json!({
        "error": true,
        "code": status.as_u16(),
        "message": status.canonical_reason().unwrap_or_default(),
    })
    .to_string()
}

/// Structured error response outside of a context.
pub fn error_response(status: StatusCode) -> Response<AxumBody> {
    let mut response = Response::new(AxumBody::from(error_body(status)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}
