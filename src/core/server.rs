//! Top-level proxy registry and dispatch pipeline.
//!
//! [`ProxyServer`] owns the handler map, the route tree built from every
//! handler's routes, and the middleware and strategy registries. Map and
//! tree are only ever replaced together under the write lock, so a reader
//! never sees a handler without its routes or routes without their handler.
//!
//! Dispatch: match route, look up handler, normalize headers, pick target,
//! run middleware, forward, then emit an access event.
use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use axum::body::Body as AxumBody;
use futures_util::future::join_all;
use hyper::{Request, Response, StatusCode, header};

use crate::{
    core::{
        context::{Middleware, RequestContext, error_response},
        error::{ProxyError, ProxyResult},
        handler::{Handler, HandlerDefinition, HandlerSnapshot, is_websocket},
        router::RouteTree,
        stats::StatsCollector,
        strategy::{Strategy, StrategyRegistry},
        target::{Target, TargetSpec},
    },
    ports::{forwarder::ForwarderFactory, monitor::HandlerMonitor},
};

/// Reserved path serving the registry dump; answered before route matching.
pub const DIAGNOSTICS_PATH: &str = "/_lb/handlers";

/// Target of the per-request access events.
pub const ACCESS_LOG_TARGET: &str = "lb_proxy::access";

#[derive(Default)]
struct Registry {
    handlers: HashMap<String, Arc<Handler>>,
    routes: Arc<RouteTree>,
    default_handler: String,
    middleware: HashMap<String, Arc<dyn Middleware>>,
    strategies: StrategyRegistry,
}

impl Registry {
    fn build_routes(&self, handlers: &HashMap<String, Arc<Handler>>) -> ProxyResult<RouteTree> {
        let mut tree = RouteTree::new();
        tree.set_default(self.default_handler.clone());

        let mut keys: Vec<&String> = handlers.keys().collect();
        keys.sort();
        for key in keys {
            for route in handlers[key].routes() {
                tree.add(route, key.clone())?;
            }
        }
        Ok(tree)
    }
}

/// Outcome recorded on the access event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Halted,
    NoHostsAvailable,
    NoHandlers,
    BadRemoteAddr,
}

impl Outcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Halted => "halted",
            Self::NoHostsAvailable => "no_hosts_available",
            Self::NoHandlers => "no_handlers",
            Self::BadRemoteAddr => "bad_remote_addr",
        }
    }
}

/// The load balancer: handler registry plus request dispatch.
pub struct ProxyServer {
    registry: RwLock<Registry>,
    stats: Arc<dyn StatsCollector>,
    forwarders: Arc<dyn ForwarderFactory>,
    monitor: Option<Arc<dyn HandlerMonitor>>,
    access_log: bool,
}

impl ProxyServer {
    pub fn new(stats: Arc<dyn StatsCollector>, forwarders: Arc<dyn ForwarderFactory>) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            stats,
            forwarders,
            monitor: None,
            access_log: false,
        }
    }

    /// Start `monitor` for every handler registered from now on.
    pub fn with_monitor(mut self, monitor: Arc<dyn HandlerMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_access_log(mut self, enabled: bool) -> Self {
        self.access_log = enabled;
        self
    }

    pub fn stats(&self) -> &Arc<dyn StatsCollector> {
        &self.stats
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register middleware under `name` for handlers built afterwards.
    pub fn use_middleware(&self, name: impl Into<String>, middleware: impl Middleware) {
        self.write()
            .middleware
            .insert(name.into(), Arc::new(middleware));
    }

    /// Register a strategy under `name` for handlers built afterwards.
    pub fn register_strategy(&self, name: impl Into<String>, strategy: Arc<dyn Strategy>) {
        self.write().strategies.register(name, strategy);
    }

    /// Key served when no route matches; empty means 404.
    pub fn set_default_handler(&self, key: impl Into<String>) -> ProxyResult<()> {
        let mut registry = self.write();
        registry.default_handler = key.into();
        let routes = registry.build_routes(&registry.handlers)?;
        registry.routes = Arc::new(routes);
        Ok(())
    }

    pub fn has_handler(&self, key: &str) -> bool {
        self.read().handlers.contains_key(key)
    }

    pub fn handler(&self, key: &str) -> Option<Arc<Handler>> {
        self.read().handlers.get(key).cloned()
    }

    pub fn handler_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.read().handlers.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Build a handler from `definition` and install it, replacing any
    /// handler with the same key.
    ///
    /// Nothing changes when the definition is rejected (unknown middleware,
    /// duplicate or invalid target, conflicting route).
    pub fn put_handler(&self, definition: HandlerDefinition) -> ProxyResult<Arc<Handler>> {
        let key = definition.key.clone();
        let handler = {
            let mut registry = self.write();
            let middleware = definition
                .middleware
                .iter()
                .map(|name| {
                    registry.middleware.get(name).cloned().ok_or_else(|| {
                        ProxyError::UnknownMiddleware {
                            handler: key.clone(),
                            name: name.clone(),
                        }
                    })
                })
                .collect::<ProxyResult<Vec<_>>>()?;
            let strategy = registry.strategies.resolve(&definition.strategy);
            let handler = Arc::new(Handler::new(
                definition,
                strategy,
                middleware,
                self.stats.clone(),
                self.forwarders.clone(),
            )?);

            let mut handlers = registry.handlers.clone();
            handlers.insert(key.clone(), handler.clone());
            let routes = registry.build_routes(&handlers)?;

            if let Some(previous) = registry.handlers.insert(key.clone(), handler.clone()) {
                previous.close();
            }
            registry.routes = Arc::new(routes);
            handler
        };

        tracing::info!(
            handler = %key,
            strategy = handler.strategy_name(),
            targets = handler.targets().len(),
            "handler registered"
        );
        if let Some(monitor) = &self.monitor {
            monitor.watch(handler.clone());
        }
        Ok(handler)
    }

    /// Drain and remove a handler.
    ///
    /// New requests are refused at once; the handler stays installed for its
    /// `shutdown_wait` so in-flight requests can finish, then it is removed
    /// and closed. If the key was re-registered meanwhile the newer handler
    /// is left alone.
    pub async fn remove_handler(&self, key: &str) -> ProxyResult<()> {
        let handler = self
            .handler(key)
            .ok_or_else(|| ProxyError::HandlerNotFound(key.to_string()))?;
        handler.start_draining();

        let wait = handler.settings().shutdown_wait;
        if !wait.is_zero() {
            tracing::info!(handler = %key, "draining handler for {:?}", wait);
            tokio::time::sleep(wait).await;
        }

        {
            let mut registry = self.write();
            let current = registry.handlers.get(key);
            if current.is_some_and(|current| Arc::ptr_eq(current, &handler)) {
                let mut handlers = registry.handlers.clone();
                handlers.remove(key);
                let routes = registry.build_routes(&handlers)?;
                registry.handlers = handlers;
                registry.routes = Arc::new(routes);
            } else {
                tracing::debug!(handler = %key, "handler replaced while draining");
            }
        }

        handler.close();
        tracing::info!(handler = %key, "handler removed");
        Ok(())
    }

    fn with_handler<T>(
        &self,
        key: &str,
        f: impl FnOnce(&Handler) -> ProxyResult<T>,
    ) -> ProxyResult<T> {
        let registry = self.write();
        let handler = registry
            .handlers
            .get(key)
            .ok_or_else(|| ProxyError::HandlerNotFound(key.to_string()))?;
        f(handler)
    }

    pub fn add_target(&self, key: &str, spec: &TargetSpec) -> ProxyResult<Arc<Target>> {
        self.with_handler(key, |handler| handler.add_target(spec))
    }

    pub fn remove_target(&self, key: &str, target_id: &str) -> ProxyResult<()> {
        self.with_handler(key, |handler| handler.remove_target(target_id))
    }

    pub fn update_target_weight(&self, key: &str, target_id: &str, weight: u32) -> ProxyResult<()> {
        self.with_handler(key, |handler| handler.update_weight(target_id, weight))
    }

    pub fn set_target_down(&self, key: &str, target_id: &str, down: bool) -> ProxyResult<()> {
        self.with_handler(key, |handler| handler.set_target_down(target_id, down))
    }

    /// Apply a full set of definitions: install new or changed handlers and
    /// drain the ones that disappeared.
    pub async fn reconcile(&self, definitions: Vec<HandlerDefinition>) -> ProxyResult<()> {
        let wanted: Vec<String> = definitions.iter().map(|d| d.key.clone()).collect();

        for definition in definitions {
            let unchanged = self
                .handler(&definition.key)
                .is_some_and(|current| *current.definition() == definition);
            if !unchanged {
                self.put_handler(definition)?;
            }
        }

        let vanished: Vec<String> = self
            .handler_keys()
            .into_iter()
            .filter(|key| !wanted.contains(key))
            .collect();
        for result in join_all(vanished.iter().map(|key| self.remove_handler(key))).await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "failed to remove handler during reload");
            }
        }
        Ok(())
    }

    /// Close every handler, stopping their health loops.
    pub fn close_all(&self) {
        for handler in self.read().handlers.values() {
            handler.close();
        }
    }

    /// Registry dump keyed by handler.
    pub fn diagnostics(&self) -> HashMap<String, HandlerSnapshot> {
        let handlers: Vec<Arc<Handler>> = self.read().handlers.values().cloned().collect();
        handlers
            .into_iter()
            .map(|h| (h.key().to_string(), h.snapshot()))
            .collect()
    }

    /// Handle one inbound request received from `remote_addr`.
    pub async fn serve_request(
        &self,
        req: Request<AxumBody>,
        remote_addr: impl Into<String>,
    ) -> Response<AxumBody> {
        if req.uri().path() == DIAGNOSTICS_PATH {
            return self.diagnostics_response();
        }

        let path = req.uri().path().to_string();
        let (handler, params) = {
            let registry = self.read();
            let (key, params) = registry.routes.match_path(&path);
            (registry.handlers.get(key).cloned(), params)
        };

        let mut ctx = RequestContext::new(req, remote_addr).with_params(params);
        let Some(handler) = handler else {
            ctx.not_found();
            self.access(None, &ctx, Outcome::NoHandlers, None, &path);
            return ctx.into_response();
        };

        let client = match handler.process(&mut ctx) {
            Ok(client) => client,
            Err(e) => {
                tracing::error!(handler = %handler.key(), error = %e, "cannot process request");
                self.access(Some(&handler), &ctx, Outcome::BadRemoteAddr, None, &path);
                return error_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };

        let Some(target) = handler.next(&ctx) else {
            tracing::warn!(handler = %handler.key(), "no hosts available");
            ctx.none_available();
            self.access(Some(&handler), &ctx, Outcome::NoHostsAvailable, None, &path);
            return ctx.into_response();
        };

        for middleware in handler.middleware() {
            middleware.handle(&mut ctx);
            if ctx.is_finished() {
                self.access(Some(&handler), &ctx, Outcome::Halted, Some(&target), &path);
                return ctx.into_response();
            }
        }

        self.access(Some(&handler), &ctx, Outcome::Success, Some(&target), &path);
        let forwarder = handler.forwarder(&target, is_websocket(ctx.request().headers()));
        match forwarder.forward(&target, ctx.into_request(), client).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(handler = %handler.key(), target_id = %target.id(), error = %e, "forwarding failed");
                error_response(StatusCode::BAD_GATEWAY)
            }
        }
    }

    fn diagnostics_response(&self) -> Response<AxumBody> {
        match serde_json::to_vec(&self.diagnostics()) {
            Ok(body) => {
                let mut response = Response::new(AxumBody::from(body));
                response.headers_mut().insert(
                    header::CONTENT_TYPE,
                    header::HeaderValue::from_static("application/json"),
                );
                response
            }
            Err(e) => {
                tracing::error!(error = %e, "cannot serialize diagnostics");
                error_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    fn access(
        &self,
        handler: Option<&Handler>,
        ctx: &RequestContext,
        outcome: Outcome,
        target: Option<&Target>,
        path: &str,
    ) {
        if !self.access_log {
            return;
        }
        let client_ip = ctx
            .client_ip()
            .unwrap_or_else(|| ctx.remote_addr().to_string());
        let healthy_targets = handler.map_or(0, |h| {
            h.targets().iter().filter(|t| t.available()).count()
        });
        tracing::info!(
            target: ACCESS_LOG_TARGET,
            handler = handler.map_or("", |h| h.key()),
            status = outcome.as_str(),
            client_ip = %client_ip,
            proxied_to = target.map_or("", |t| t.id()),
            handler_available = handler.is_some_and(|h| h.is_available()),
            healthy_targets,
            handler_status = handler.map_or(0.0, |h| h.status()),
            path,
        );
    }
}
