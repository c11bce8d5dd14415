//! Upstream pools.
//!
//! A [`Handler`] owns an ordered list of targets, the strategy that picks
//! among them and the middleware chain run before forwarding. Target list,
//! selection cursor and healthy-index cache live behind one per-handler lock
//! so dispatch on one handler never waits on another.
use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use hyper::{
    HeaderMap,
    header::{self, HeaderName, HeaderValue},
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::{
    core::{
        context::{Middleware, RequestContext},
        error::{ProxyError, ProxyResult},
        stats::StatsCollector,
        strategy::{DispatchState, Strategy},
        target::{Target, TargetSnapshot, TargetSpec},
    },
    ports::forwarder::{ForwardKind, Forwarder, ForwarderFactory},
};

const X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");
const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Transport and lifecycle knobs for one handler. `None` disables a timeout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerSettings {
    pub dial_timeout: Option<Duration>,
    pub response_header_timeout: Option<Duration>,
    pub keep_alive_timeout: Option<Duration>,
    /// Max idle connections per host; 0 keeps the client default
    pub max_conn: usize,
    pub disable_keep_alives: bool,
    pub disable_compression: bool,
    pub raw_proxy: bool,
    pub client_ip_header: Option<HeaderName>,
    /// How long a removed handler keeps serving in-flight requests
    pub shutdown_wait: Duration,
}

/// Everything needed to build a handler, already validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerDefinition {
    pub key: String,
    pub strategy: String,
    pub routes: Vec<String>,
    pub middleware: Vec<String>,
    pub targets: Vec<TargetSpec>,
    pub settings: HandlerSettings,
}

impl HandlerDefinition {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            strategy: crate::core::strategy::ROUND_ROBIN.to_string(),
            routes: Vec::new(),
            middleware: Vec::new(),
            targets: Vec::new(),
            settings: HandlerSettings::default(),
        }
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.routes.push(route.into());
        self
    }

    pub fn with_target(mut self, target: TargetSpec) -> Self {
        self.targets.push(target);
        self
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = strategy.into();
        self
    }

    pub fn with_middleware(mut self, name: impl Into<String>) -> Self {
        self.middleware.push(name.into());
        self
    }

    pub fn with_settings(mut self, settings: HandlerSettings) -> Self {
        self.settings = settings;
        self
    }
}

#[derive(Default)]
struct HandlerState {
    targets: Vec<Arc<Target>>,
    dispatch: DispatchState,
    healthy: Option<Vec<usize>>,
}

impl HandlerState {
    fn healthy_indices(&mut self) -> &[usize] {
        let targets = &self.targets;
        self.healthy.get_or_insert_with(|| {
            targets
                .iter()
                .enumerate()
                .filter(|(_, t)| t.available())
                .map(|(i, _)| i)
                .collect()
        })
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.targets
            .iter()
            .position(|t| t.id() == id || t.url().as_str() == id)
    }
}

/// A named pool of targets.
pub struct Handler {
    definition: HandlerDefinition,
    strategy: Arc<dyn Strategy>,
    middleware: Vec<Arc<dyn Middleware>>,
    stats: Arc<dyn StatsCollector>,
    forwarders: Arc<dyn ForwarderFactory>,
    state: Mutex<HandlerState>,
    available: AtomicBool,
    closed: AtomicBool,
    draining: AtomicBool,
    shutdown: CancellationToken,
}

impl Handler {
    /// Build a handler and its targets. Duplicate target URLs are rejected.
    pub fn new(
        definition: HandlerDefinition,
        strategy: Arc<dyn Strategy>,
        middleware: Vec<Arc<dyn Middleware>>,
        stats: Arc<dyn StatsCollector>,
        forwarders: Arc<dyn ForwarderFactory>,
    ) -> ProxyResult<Self> {
        let handler = Self {
            strategy,
            middleware,
            stats,
            forwarders,
            state: Mutex::new(HandlerState::default()),
            available: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            definition,
        };
        for spec in &handler.definition.targets {
            handler.add_target(spec)?;
        }
        Ok(handler)
    }

    pub fn key(&self) -> &str {
        &self.definition.key
    }

    pub fn routes(&self) -> &[String] {
        &self.definition.routes
    }

    pub fn definition(&self) -> &HandlerDefinition {
        &self.definition
    }

    pub fn settings(&self) -> &HandlerSettings {
        &self.definition.settings
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn middleware(&self) -> &[Arc<dyn Middleware>] {
        &self.middleware
    }

    fn lock(&self) -> MutexGuard<'_, HandlerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Stop handing out targets; in-flight requests keep going.
    pub fn start_draining(&self) {
        self.draining.store(true, Ordering::Release);
    }

    /// Cancelled when the handler closes. Health loops and tunnel dials watch it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop dispatch and the health loop, then drop idle upstream connections.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        for target in self.targets() {
            target.close_transport();
        }
        tracing::debug!(handler = %self.key(), "handler closed");
    }

    /// Snapshot of the current target list, in dispatch order.
    pub fn targets(&self) -> Vec<Arc<Target>> {
        self.lock().targets.clone()
    }

    pub fn add_target(&self, spec: &TargetSpec) -> ProxyResult<Arc<Target>> {
        let target = Arc::new(Target::new(spec, self.stats.clone())?);
        let mut state = self.lock();
        if state
            .targets
            .iter()
            .any(|t| t.url() == target.url() || t.id() == target.id())
        {
            return Err(ProxyError::DuplicateTarget {
                handler: self.key().to_string(),
                url: spec.url.clone(),
            });
        }
        state.targets.push(target.clone());
        drop(state);
        self.republish_health();
        Ok(target)
    }

    /// Remove a target by id (or URL) and close its transport.
    pub fn remove_target(&self, id: &str) -> ProxyResult<()> {
        let removed = {
            let mut state = self.lock();
            let index = state.position(id).ok_or_else(|| self.target_not_found(id))?;
            let removed = state.targets.remove(index);
            state.healthy = None;
            if !state.targets.is_empty() {
                state.dispatch.cursor %= state.targets.len();
            }
            removed
        };
        removed.close_transport();
        self.republish_health();
        Ok(())
    }

    pub fn update_weight(&self, id: &str, weight: u32) -> ProxyResult<()> {
        self.find_target(id)?.set_weight(weight);
        Ok(())
    }

    pub fn set_target_down(&self, id: &str, down: bool) -> ProxyResult<()> {
        self.find_target(id)?.set_down(down);
        self.republish_health();
        Ok(())
    }

    pub fn set_target_health(&self, id: &str, healthy: bool) -> ProxyResult<()> {
        self.find_target(id)?.record_health(healthy);
        self.republish_health();
        Ok(())
    }

    fn find_target(&self, id: &str) -> ProxyResult<Arc<Target>> {
        let state = self.lock();
        state
            .position(id)
            .map(|i| state.targets[i].clone())
            .ok_or_else(|| self.target_not_found(id))
    }

    fn target_not_found(&self, id: &str) -> ProxyError {
        ProxyError::TargetNotFound {
            handler: self.key().to_string(),
            target: id.to_string(),
        }
    }

    /// Rebuild the healthy-index cache and the aggregate availability flag.
    /// Returns the number of available targets.
    pub fn republish_health(&self) -> usize {
        let mut state = self.lock();
        state.healthy = None;
        let healthy = state.healthy_indices().len();
        self.available.store(healthy > 0, Ordering::Release);
        healthy
    }

    /// Fraction of targets currently available, 0 for an empty pool.
    pub fn status(&self) -> f64 {
        let mut state = self.lock();
        let total = state.targets.len();
        if total == 0 {
            return 0.0;
        }
        state.healthy_indices().len() as f64 / total as f64
    }

    /// Pick the target for this request, or `None` when nothing can serve it.
    ///
    /// A pool with a single target always returns it, healthy or not.
    pub fn next(&self, ctx: &RequestContext) -> Option<Arc<Target>> {
        if self.is_closed() || self.is_draining() {
            return None;
        }
        self.stats
            .set_increment(&format!("requests.{}", self.key()), 1);

        let client_ip = ctx.client_ip();
        let mut state = self.lock();
        let n = state.targets.len();
        match n {
            0 => return None,
            1 => return Some(state.targets[0].clone()),
            _ => {}
        }

        let (healthy, first) = {
            let indices = state.healthy_indices();
            (indices.len(), indices.first().copied())
        };
        match (healthy, first) {
            (0, _) => return None,
            (1, Some(only)) if state.targets[only].available() => {
                return Some(state.targets[only].clone());
            }
            _ => {}
        }

        let HandlerState {
            targets, dispatch, ..
        } = &mut *state;
        if let Some(target) = self
            .strategy
            .select(targets, dispatch, client_ip.as_deref())
            .and_then(|i| targets.get(i))
            .filter(|t| t.available())
        {
            return Some(target.clone());
        }

        // walk forward from the cursor to the first available target
        (0..n)
            .map(|offset| (dispatch.cursor + offset) % n)
            .find(|i| targets[*i].available())
            .map(|i| {
                dispatch.cursor = (i + 1) % n;
                targets[i].clone()
            })
    }

    /// Normalize client-identifying headers and return the parsed peer address.
    pub fn process(&self, ctx: &mut RequestContext) -> ProxyResult<SocketAddr> {
        let remote: SocketAddr = ctx
            .remote_addr()
            .parse()
            .map_err(|_| ProxyError::RemoteAddr(ctx.remote_addr().to_string()))?;
        let ip = remote.ip().to_string();
        let ip_value = HeaderValue::from_str(&ip)?;
        let ws = is_websocket(ctx.request().headers());
        let headers = ctx.request_mut().headers_mut();

        if let Some(name) = &self.settings().client_ip_header {
            if *name != X_FORWARDED_FOR && *name != X_REAL_IP {
                headers.insert(name.clone(), ip_value.clone());
            }
        }

        if !headers.contains_key(X_REAL_IP) {
            headers.insert(X_REAL_IP, ip_value.clone());
        }

        // upgrades bypass the http forwarder, which would append this itself
        if ws {
            headers.insert(X_FORWARDED_FOR, ip_value);
        }

        let proto = if ws { "ws" } else { "http" };
        if !headers.contains_key(X_FORWARDED_PROTO) {
            headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
        }

        if !headers.contains_key(header::FORWARDED) {
            headers.insert(
                header::FORWARDED,
                HeaderValue::from_str(&format!("for={ip}; proto={proto}"))?,
            );
        }

        Ok(remote)
    }

    /// The forwarder `target` should use for a request of this shape.
    pub fn forwarder(&self, target: &Target, websocket: bool) -> Arc<dyn Forwarder> {
        let kind = if self.settings().raw_proxy {
            ForwardKind::Raw
        } else if websocket {
            ForwardKind::WebSocket
        } else {
            ForwardKind::Http
        };
        target.forwarder(
            kind,
            self.forwarders.as_ref(),
            self.settings(),
            &self.shutdown,
        )
    }

    pub fn snapshot(&self) -> HandlerSnapshot {
        HandlerSnapshot {
            key: self.key().to_string(),
            strategy: self.strategy_name(),
            routes: self.definition.routes.clone(),
            middleware: self.definition.middleware.clone(),
            available: self.is_available(),
            closed: self.is_closed(),
            draining: self.is_draining(),
            status: self.status(),
            targets: self.targets().iter().map(|t| t.snapshot()).collect(),
        }
    }
}

/// `Upgrade: websocket`, compared case-insensitively.
pub fn is_websocket(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Point-in-time view of a handler for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct HandlerSnapshot {
    pub key: String,
    pub strategy: &'static str,
    pub routes: Vec<String>,
    pub middleware: Vec<String>,
    pub available: bool,
    pub closed: bool,
    pub draining: bool,
    pub status: f64,
    pub targets: Vec<TargetSnapshot>,
}
