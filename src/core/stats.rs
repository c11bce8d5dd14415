//! Request statistics sink.
//!
//! The proxy reports counters, round-trip timings and sampled points through
//! the [`StatsCollector`] trait. Keys are free-form strings; the dispatch path
//! uses `requests.<handler>` and the metered transport uses `<target id>` for
//! timings and `<target id>.<status class>` for counters.
//!
//! Two backends ship with the crate:
//! * [`NoopStats`] discards everything (the default)
//! * [`InMemoryStats`] keeps everything in process, with one lock per metric
//!   category so counter updates never wait on timer appends. Timings and
//!   points keep the newest [`SAMPLE_LIMIT`] entries per key.
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Samples retained per timing or point key.
pub const SAMPLE_LIMIT: usize = 4096;

/// Sink for proxy statistics.
pub trait StatsCollector: Send + Sync + 'static {
    /// Add `amount` to the counter stored under `key`.
    fn set_increment(&self, key: &str, amount: i64);
    /// Record the time elapsed since `started` under `key`.
    fn set_time(&self, key: &str, started: Instant);
    /// Record a timestamped sample under `key`.
    fn set_point(&self, key: &str, value: f64);
    /// Current value of the counter stored under `key` (0 when unknown).
    fn get_increment(&self, key: &str) -> i64;
}

/// Which collector implementation to build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsBackend {
    Memory,
    #[default]
    Noop,
}

/// Build a collector for the given backend.
pub fn new_collector(backend: StatsBackend) -> Arc<dyn StatsCollector> {
    match backend {
        StatsBackend::Memory => Arc::new(InMemoryStats::new()),
        StatsBackend::Noop => Arc::new(NoopStats),
    }
}

/// Collector that drops every sample.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStats;

impl StatsCollector for NoopStats {
    fn set_increment(&self, _key: &str, _amount: i64) {}

    fn set_time(&self, _key: &str, _started: Instant) {}

    fn set_point(&self, _key: &str, _value: f64) {}

    fn get_increment(&self, _key: &str) -> i64 {
        0
    }
}

/// A single sampled value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Point {
    pub at: DateTime<Utc>,
    pub value: f64,
}

/// In-process collector with independent lock domains for counters, timers
/// and points.
#[derive(Debug, Default)]
pub struct InMemoryStats {
    increments: RwLock<HashMap<String, i64>>,
    timers: Mutex<HashMap<String, VecDeque<Duration>>>,
    points: Mutex<HashMap<String, VecDeque<Point>>>,
}

fn push_bounded<T>(samples: &mut VecDeque<T>, value: T) {
    if samples.len() == SAMPLE_LIMIT {
        samples.pop_front();
    }
    samples.push_back(value);
}

impl InMemoryStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retained timings for `key`, oldest first.
    pub fn timings(&self, key: &str) -> Vec<Duration> {
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|samples| samples.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Retained points for `key`, oldest first.
    pub fn points(&self, key: &str) -> Vec<Point> {
        self.points
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|samples| samples.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Snapshot of every counter.
    pub fn counters(&self) -> HashMap<String, i64> {
        self.increments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl StatsCollector for InMemoryStats {
    fn set_increment(&self, key: &str, amount: i64) {
        let mut increments = self
            .increments
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *increments.entry(key.to_string()).or_insert(0) += amount;
    }

    fn set_time(&self, key: &str, started: Instant) {
        let elapsed = started.elapsed();
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        push_bounded(timers.entry(key.to_string()).or_default(), elapsed);
    }

    fn set_point(&self, key: &str, value: f64) {
        let point = Point {
            at: Utc::now(),
            value,
        };
        let mut points = self.points.lock().unwrap_or_else(PoisonError::into_inner);
        push_bounded(points.entry(key.to_string()).or_default(), point);
    }

    fn get_increment(&self, key: &str) -> i64 {
        self.increments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}
