//! A single backend endpoint and its runtime state.
use std::{
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    core::{
        error::{ProxyError, ProxyResult},
        handler::HandlerSettings,
        stats::StatsCollector,
    },
    ports::forwarder::{ForwardKind, Forwarder, ForwarderFactory},
};

pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Validated description of a target, as produced by the configuration layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    /// Identifier used in stats keys and admin lookups; defaults to `url`.
    pub id: Option<String>,
    pub url: String,
    pub health: Option<String>,
    pub timeout: Duration,
    pub weight: u32,
    pub down: bool,
}

impl TargetSpec {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            id: None,
            url: url.into(),
            health: None,
            timeout: DEFAULT_HEALTH_TIMEOUT,
            weight: 1,
            down: false,
        }
    }

    pub fn with_health(mut self, health: impl Into<String>) -> Self {
        self.health = Some(health.into());
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_down(mut self, down: bool) -> Self {
        self.down = down;
        self
    }
}

/// A backend endpoint.
///
/// Health, weight and counters are atomics so the health loop, the metered
/// transport and the dispatcher can touch them without the handler lock.
pub struct Target {
    id: String,
    url: Url,
    health_url: Option<String>,
    health_timeout: Duration,
    weight: AtomicU32,
    down: AtomicBool,
    healthy: AtomicBool,
    last_checked: AtomicI64,
    requests: AtomicU64,
    failed_requests: AtomicU64,
    stats: Arc<dyn StatsCollector>,
    http: OnceLock<Arc<dyn Forwarder>>,
    raw: OnceLock<Arc<dyn Forwarder>>,
    websocket: OnceLock<Arc<dyn Forwarder>>,
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("id", &self.id)
            .field("url", &self.url.as_str())
            .field("weight", &self.weight())
            .field("healthy", &self.is_healthy())
            .field("down", &self.is_down())
            .finish()
    }
}

impl Target {
    /// Build a target from its spec. Only `http` and `https` URLs are accepted.
    pub fn new(spec: &TargetSpec, stats: Arc<dyn StatsCollector>) -> ProxyResult<Self> {
        let url = Url::parse(&spec.url).map_err(|e| ProxyError::InvalidTarget {
            url: spec.url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(ProxyError::InvalidTarget {
                url: spec.url.clone(),
                reason: "expected an http:// or https:// url with a host".to_string(),
            });
        }

        Ok(Self {
            id: spec.id.clone().unwrap_or_else(|| spec.url.clone()),
            url,
            health_url: spec.health.clone().filter(|h| !h.is_empty()),
            health_timeout: spec.timeout,
            weight: AtomicU32::new(spec.weight),
            down: AtomicBool::new(spec.down),
            healthy: AtomicBool::new(true),
            last_checked: AtomicI64::new(0),
            requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            stats,
            http: OnceLock::new(),
            raw: OnceLock::new(),
            websocket: OnceLock::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn health_url(&self) -> Option<&str> {
        self.health_url.as_deref()
    }

    pub fn health_timeout(&self) -> Duration {
        self.health_timeout
    }

    pub fn stats(&self) -> &Arc<dyn StatsCollector> {
        &self.stats
    }

    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Acquire)
    }

    pub fn set_weight(&self, weight: u32) {
        self.weight.store(weight, Ordering::Release);
    }

    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::Acquire)
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::Release);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Healthy and not manually taken down.
    pub fn available(&self) -> bool {
        self.is_healthy() && !self.is_down()
    }

    /// Store a health probe result and stamp the check time.
    pub fn record_health(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
        self.last_checked
            .store(Utc::now().timestamp(), Ordering::Release);
    }

    /// Unix seconds of the last probe, 0 when never probed.
    pub fn last_checked(&self) -> i64 {
        self.last_checked.load(Ordering::Acquire)
    }

    /// Count one round trip; `failed` covers transport errors and 5xx.
    pub fn record_request(&self, failed: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }

    /// The forwarder for `kind`, built by `factory` on first use and reused
    /// for the lifetime of the target.
    pub fn forwarder(
        &self,
        kind: ForwardKind,
        factory: &dyn ForwarderFactory,
        settings: &HandlerSettings,
        cancel: &CancellationToken,
    ) -> Arc<dyn Forwarder> {
        let slot = match kind {
            ForwardKind::Http => &self.http,
            ForwardKind::Raw => &self.raw,
            ForwardKind::WebSocket => &self.websocket,
        };
        slot.get_or_init(|| {
            tracing::debug!(target_id = %self.id, ?kind, "building forwarder");
            factory.build(kind, settings, cancel.clone())
        })
        .clone()
    }

    /// Drop idle upstream connections held by any forwarder built so far.
    pub fn close_transport(&self) {
        for forwarder in [&self.http, &self.raw, &self.websocket]
            .into_iter()
            .filter_map(OnceLock::get)
        {
            forwarder.close();
        }
    }

    pub fn snapshot(&self) -> TargetSnapshot {
        let last_checked = self.last_checked();
        TargetSnapshot {
            id: self.id.clone(),
            url: self.url.to_string(),
            health: self.health_url.clone(),
            weight: self.weight(),
            healthy: self.is_healthy(),
            down: self.is_down(),
            last_checked,
            last_checked_at: (last_checked > 0)
                .then(|| DateTime::<Utc>::from_timestamp(last_checked, 0))
                .flatten(),
            requests: self.requests(),
            failed_requests: self.failed_requests(),
        }
    }
}

/// Point-in-time view of a target for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct TargetSnapshot {
    pub id: String,
    pub url: String,
    pub health: Option<String>,
    pub weight: u32,
    pub healthy: bool,
    pub down: bool,
    pub last_checked: i64,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub requests: u64,
    pub failed_requests: u64,
}
