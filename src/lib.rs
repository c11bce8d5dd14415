//! lb-proxy - a path-routed HTTP reverse proxy and load balancer.
//!
//! Requests are matched against a route trie and handed to a named
//! **handler**: a pool of backend targets with a selection strategy, a
//! middleware chain and transport settings. The selected target receives the
//! request over a pooled HTTP client, a WebSocket relay or a raw upgraded
//! tunnel.
//!
//! # Features
//! - Route trie with literal, `:param` and trailing `*` segments plus a
//!   default handler
//! - Strategies: round-robin, weighted round-robin, weighted by observed
//!   failure ratio, random and IP consistent hash; more can be registered
//! - Active health checking, one cancellable loop per handler
//! - Live handler and target mutation with graceful drain on removal
//! - Per-target statistics through a pluggable [`StatsCollector`]
//! - Configuration hot reload and validation
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use lb_proxy::{
//!     HandlerDefinition, HttpHandler, HyperForwarderFactory, NoopStats, ProxyServer, TargetSpec,
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let server = Arc::new(ProxyServer::new(Arc::new(NoopStats), Arc::new(HyperForwarderFactory)));
//! server.put_handler(
//!     HandlerDefinition::new("api")
//!         .with_route("/api/*")
//!         .with_target(TargetSpec::new("http://10.0.0.1:8080"))
//!         .with_target(TargetSpec::new("http://10.0.0.2:8080")),
//! )?;
//!
//! let app = HttpHandler::new(server).router();
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! axum::serve(
//!     listener,
//!     app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
//! )
//! .await?;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters** (implementations)
//! while keeping routing, selection and dispatch inside `core`. The core only
//! talks to the network through [`ports::forwarder::ForwarderFactory`] and
//! learns about background monitoring through [`ports::monitor::HandlerMonitor`].
//!
//! # Error Handling
//! Library APIs return domain errors (`ProxyError`, `ForwardError`,
//! `ValidationError`); application plumbing uses `eyre::Result`.
pub mod config;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{HealthChecker, HttpClientAdapter, HttpHandler, HyperForwarderFactory},
    core::{
        HandlerDefinition, HandlerSettings, InMemoryStats, Middleware, NoopStats, ProxyError,
        ProxyServer, RequestContext, StatsCollector, TargetSpec,
    },
    ports::http_client::HttpClient,
    utils::GracefulShutdown,
};
