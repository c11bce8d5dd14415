//! Target selection strategies.
//!
//! A strategy proposes an index into the handler's target list. The handler
//! owns the availability check and the cyclic fallback scan, so a strategy may
//! propose a target that is currently unavailable.
use std::{collections::HashMap, sync::Arc};

use rand::Rng;

use crate::core::target::Target;

pub const ROUND_ROBIN: &str = "rr";
pub const WEIGHTED_ROUND_ROBIN: &str = "wrr";
pub const WEIGHTED_BY_HEALTH: &str = "wrrh";
pub const RANDOM: &str = "rand";
pub const IP_HASH: &str = "ip_hash";

/// Selection state kept per handler and mutated under the handler lock.
#[derive(Debug, Default, Clone)]
pub struct DispatchState {
    /// Next slot for round-robin and the fallback scan
    pub cursor: usize,
    pub wrr: WrrState,
}

#[derive(Debug, Default, Clone)]
pub struct WrrState {
    index: Option<usize>,
    current_weight: i64,
    /// Weights `max`/`gcd` were last computed for
    weights: Vec<u32>,
    max: i64,
    gcd: i64,
}

impl WrrState {
    /// `(max, gcd)` for `weights`, recomputed only when the weights change.
    fn nums(&mut self, weights: &[u32]) -> (i64, i64) {
        if self.weights != weights {
            (self.max, self.gcd) = nums(weights);
            self.weights = weights.to_vec();
        }
        (self.max, self.gcd)
    }
}

/// Trait defining the interface for target selection strategies
pub trait Strategy: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Propose an index into `targets`. `targets` holds at least two entries.
    fn select(
        &self,
        targets: &[Arc<Target>],
        state: &mut DispatchState,
        client_ip: Option<&str>,
    ) -> Option<usize>;

    fn shared(self) -> Arc<dyn Strategy>
    where
        Self: Sized,
    {
        Arc::new(self)
    }
}

/// Advances the cursor by one on every call, ignoring availability.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoundRobinStrategy;

impl Strategy for RoundRobinStrategy {
    fn name(&self) -> &'static str {
        ROUND_ROBIN
    }

    fn select(
        &self,
        targets: &[Arc<Target>],
        state: &mut DispatchState,
        _client_ip: Option<&str>,
    ) -> Option<usize> {
        if targets.is_empty() {
            return None;
        }
        let pick = state.cursor % targets.len();
        state.cursor = (pick + 1) % targets.len();
        Some(pick)
    }
}

/// Interleaved weighted round-robin over the configured weights.
#[derive(Debug, Default, Clone, Copy)]
pub struct WeightedRoundRobinStrategy;

impl Strategy for WeightedRoundRobinStrategy {
    fn name(&self) -> &'static str {
        WEIGHTED_ROUND_ROBIN
    }

    fn select(
        &self,
        targets: &[Arc<Target>],
        state: &mut DispatchState,
        _client_ip: Option<&str>,
    ) -> Option<usize> {
        let weights: Vec<u32> = targets.iter().map(|t| t.weight()).collect();
        weighted_round_robin(&weights, &mut state.wrr)
    }
}

/// Weighted round-robin whose weights come from each target's error ratio.
///
/// A target that never failed weighs 100; otherwise its weight is
/// `round(100 * failed / requests)`. Configured weights are left untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct WeightedByHealthStrategy;

impl Strategy for WeightedByHealthStrategy {
    fn name(&self) -> &'static str {
        WEIGHTED_BY_HEALTH
    }

    fn select(
        &self,
        targets: &[Arc<Target>],
        state: &mut DispatchState,
        _client_ip: Option<&str>,
    ) -> Option<usize> {
        let weights: Vec<u32> = targets
            .iter()
            .map(|t| health_weight(t.requests(), t.failed_requests()))
            .collect();
        weighted_round_robin(&weights, &mut state.wrr)
    }
}

fn health_weight(requests: u64, failed: u64) -> u32 {
    if failed == 0 || requests == 0 {
        return 100;
    }
    (100.0 * failed as f64 / requests as f64).round() as u32
}

/// Uniform pick over every target but the last one.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomStrategy;

impl Strategy for RandomStrategy {
    fn name(&self) -> &'static str {
        RANDOM
    }

    fn select(
        &self,
        targets: &[Arc<Target>],
        _state: &mut DispatchState,
        _client_ip: Option<&str>,
    ) -> Option<usize> {
        random_index(targets.len())
    }
}

// The last target is never drawn; kept as-is, see DESIGN.md.
fn random_index(len: usize) -> Option<usize> {
    match len {
        0 => None,
        1 => Some(0),
        n => Some(rand::rng().random_range(0..n - 1)),
    }
}

/// Jump-hash bucket of the client IP; random when the IP is unknown.
#[derive(Debug, Default, Clone, Copy)]
pub struct IpHashStrategy;

impl Strategy for IpHashStrategy {
    fn name(&self) -> &'static str {
        IP_HASH
    }

    fn select(
        &self,
        targets: &[Arc<Target>],
        _state: &mut DispatchState,
        client_ip: Option<&str>,
    ) -> Option<usize> {
        match client_ip {
            Some(ip) if !ip.is_empty() && ip != "unknown" => {
                Some(jump_hash(fnv1a64(ip.as_bytes()), targets.len()))
            }
            _ => random_index(targets.len()),
        }
    }
}

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Jump consistent hash bounded by `len - 1` buckets.
fn jump_hash(mut key: u64, len: usize) -> usize {
    if len < 2 {
        return 0;
    }
    let buckets = (len - 1) as i64;
    let (mut b, mut j) = (0i64, 0i64);
    while j < buckets {
        b = j;
        key = key.wrapping_mul(2_862_933_555_777_941_757).wrapping_add(1);
        j = ((b + 1) as f64 * ((1i64 << 31) as f64 / ((key >> 33) + 1) as f64)) as i64;
    }
    b as usize
}

/// Shared weighted round-robin step over a weight vector.
fn weighted_round_robin(weights: &[u32], state: &mut WrrState) -> Option<usize> {
    let n = weights.len();
    if n == 0 {
        return None;
    }
    let (max, gcd) = state.nums(weights);
    if max == 0 {
        return None;
    }

    loop {
        let index = state.index.map_or(0, |i| (i + 1) % n);
        state.index = Some(index);
        if index == 0 {
            state.current_weight -= gcd;
            if state.current_weight <= 0 {
                state.current_weight = max;
            }
        }
        if i64::from(weights[index]) >= state.current_weight {
            return Some(index);
        }
    }
}

/// Maximum weight and the largest divisor shared by every weight.
fn nums(weights: &[u32]) -> (i64, i64) {
    let max = weights.iter().copied().max().unwrap_or(0);
    let gcd = weights.iter().copied().fold(0, gcd);
    (i64::from(max), i64::from(gcd))
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 { a } else { gcd(b, a % b) }
}

/// Strategies keyed by name, resolved when a handler is built.
#[derive(Clone)]
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn Strategy>>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        let mut registry = Self {
            strategies: HashMap::new(),
        };
        registry.register(ROUND_ROBIN, RoundRobinStrategy.shared());
        registry.register(WEIGHTED_ROUND_ROBIN, WeightedRoundRobinStrategy.shared());
        registry.register(WEIGHTED_BY_HEALTH, WeightedByHealthStrategy.shared());
        registry.register(RANDOM, RandomStrategy.shared());
        registry.register(IP_HASH, IpHashStrategy.shared());
        registry
    }
}

impl StrategyRegistry {
    pub fn register(&mut self, name: impl Into<String>, strategy: Arc<dyn Strategy>) {
        self.strategies.insert(name.into(), strategy);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.strategies.contains_key(name)
    }

    /// Look up `name`, falling back to round-robin for unknown names.
    pub fn resolve(&self, name: &str) -> Arc<dyn Strategy> {
        match self.strategies.get(name) {
            Some(strategy) => strategy.clone(),
            None => {
                if !name.is_empty() {
                    tracing::warn!(strategy = name, "unknown strategy, using round-robin");
                }
                RoundRobinStrategy.shared()
            }
        }
    }
}
