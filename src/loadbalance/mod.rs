//! Load balancing strategies over candidate endpoints.
//!
//! Extensible design:
//! - Define your own policy by implementing the `LoadBalance` trait
//! - Register custom policies with the `LoadBalanceRegistry`
//!
//! The common `select` entry point handles the trivial cases (empty list,
//! single candidate) so algorithms only see two or more candidates.

mod consistent_hash;
mod least_active;
mod p2c;
mod random;
mod round_robin;
mod shortest_response;

pub use consistent_hash::ConsistentHash;
pub use least_active::LeastActive;
pub use p2c::AdaptiveP2c;
pub use random::WeightedRandom;
pub use round_robin::RoundRobin;
pub use shortest_response::ShortestResponse;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::config::{
    LoadBalanceKind, LoadBalanceTuning, DEFAULT_WARMUP_MS, DEFAULT_WEIGHT, TIMESTAMP_KEY,
    WARMUP_KEY, WEIGHT_KEY,
};
use crate::invocation::Invocation;
use crate::invoker::Invoker;
use crate::stats::StatsRegistry;

/// A pluggable endpoint-selection policy.
pub trait LoadBalance: Send + Sync {
    /// Name of this policy.
    fn name(&self) -> &'static str;

    /// Select one endpoint from the candidates.
    fn select(
        &self,
        invokers: &[Arc<dyn Invoker>],
        invocation: &Invocation,
    ) -> Option<Arc<dyn Invoker>> {
        match invokers.len() {
            0 => None,
            1 => Some(invokers[0].clone()),
            _ => Some(self.do_select(invokers, invocation)),
        }
    }

    /// Algorithm-specific selection. Called with at least two candidates.
    fn do_select(&self, invokers: &[Arc<dyn Invoker>], invocation: &Invocation)
        -> Arc<dyn Invoker>;

    /// Completion callback with the observed round-trip time. Policies
    /// that estimate latency (adaptive P2C) override this.
    fn on_complete(
        &self,
        _invoker: &Arc<dyn Invoker>,
        _invocation: &Invocation,
        _rtt: Duration,
        _ok: bool,
    ) {
    }
}

/// Weight after the linear warm-up ramp: scales from 1 to `weight` over
/// `warmup` milliseconds of uptime, clamped to `[1, weight]`.
pub fn warmup_weight(uptime_ms: i64, warmup_ms: i64, weight: i64) -> i64 {
    let ramped = (uptime_ms as f64 / (warmup_ms as f64 / weight as f64)) as i64;
    ramped.clamp(1, weight)
}

/// Effective weight of an endpoint for this call: the configured weight,
/// ramped down while the remote process is still warming up. Never
/// negative.
pub fn effective_weight(invoker: &Arc<dyn Invoker>, invocation: &Invocation) -> i64 {
    let method = invocation.method();
    let weight = invoker.param(method, WEIGHT_KEY, DEFAULT_WEIGHT);
    if weight > 0 {
        let timestamp = invoker.param(method, TIMESTAMP_KEY, 0);
        if timestamp > 0 {
            let uptime = now_millis() - timestamp;
            if uptime < 0 {
                return 1;
            }
            let warmup = invoker.param(method, WARMUP_KEY, DEFAULT_WARMUP_MS);
            if uptime > 0 && uptime < warmup {
                return warmup_weight(uptime, warmup, weight);
            }
        }
    }
    weight.max(0)
}

/// Wall-clock milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Weighted random pick over `indexes` using the matching `weights`.
/// Falls back to uniform random when the total weight is zero.
pub(crate) fn pick_weighted(indexes: &[usize], weights: &[i64]) -> usize {
    let total: i64 = indexes.iter().map(|&i| weights[i]).sum();
    let mut rng = rand::thread_rng();
    if total > 0 {
        let mut offset = rng.gen_range(0..total);
        for &i in indexes {
            offset -= weights[i];
            if offset < 0 {
                return i;
            }
        }
    }
    indexes[rng.gen_range(0..indexes.len())]
}

/// Build the configured policy. Stat-driven policies share the registry
/// the cluster invoker updates on every call.
pub fn build(
    kind: LoadBalanceKind,
    stats: Arc<StatsRegistry>,
    tuning: &LoadBalanceTuning,
) -> Arc<dyn LoadBalance> {
    match kind {
        LoadBalanceKind::Random => Arc::new(WeightedRandom::new()),
        LoadBalanceKind::RoundRobin => Arc::new(RoundRobin::new()),
        LoadBalanceKind::LeastActive => Arc::new(LeastActive::new(stats)),
        LoadBalanceKind::ConsistentHash => Arc::new(ConsistentHash::new(
            tuning.hash_replicas,
            tuning.hash_arguments.clone(),
            tuning.overload_ratio,
        )),
        LoadBalanceKind::ShortestResponse => {
            Arc::new(ShortestResponse::new(stats, tuning.slide_period))
        }
        LoadBalanceKind::AdaptiveP2c => Arc::new(AdaptiveP2c::new(stats, tuning.ewma_decay)),
    }
}

/// Factory function for a named load-balance policy.
pub type LoadBalanceFactory =
    Box<dyn Fn(Arc<StatsRegistry>, &LoadBalanceTuning) -> Arc<dyn LoadBalance> + Send + Sync>;

/// Registry of load-balance factories, keyed by policy name.
///
/// Ships with the built-in policies; custom ones can be registered.
pub struct LoadBalanceRegistry {
    factories: HashMap<String, LoadBalanceFactory>,
}

impl LoadBalanceRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };

        registry.register("random", Box::new(|_, _| Arc::new(WeightedRandom::new())));
        registry.register("round_robin", Box::new(|_, _| Arc::new(RoundRobin::new())));
        registry.register(
            "least_active",
            Box::new(|stats, _| Arc::new(LeastActive::new(stats))),
        );
        registry.register(
            "consistent_hash",
            Box::new(|_, tuning| {
                Arc::new(ConsistentHash::new(
                    tuning.hash_replicas,
                    tuning.hash_arguments.clone(),
                    tuning.overload_ratio,
                ))
            }),
        );
        registry.register(
            "shortest_response",
            Box::new(|stats, tuning| Arc::new(ShortestResponse::new(stats, tuning.slide_period))),
        );
        registry.register(
            "adaptive_p2c",
            Box::new(|stats, tuning| Arc::new(AdaptiveP2c::new(stats, tuning.ewma_decay))),
        );

        registry
    }

    /// Register a custom factory under `name`.
    pub fn register(&mut self, name: &str, factory: LoadBalanceFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    /// Instantiate a policy by name.
    pub fn create(
        &self,
        name: &str,
        stats: Arc<StatsRegistry>,
        tuning: &LoadBalanceTuning,
    ) -> Option<Arc<dyn LoadBalance>> {
        self.factories.get(name).map(|f| f(stats, tuning))
    }

    /// Names of all registered policies.
    pub fn available(&self) -> Vec<&str> {
        self.factories.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for LoadBalanceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockInvoker;

    #[test]
    fn test_warmup_weight_endpoints() {
        assert_eq!(warmup_weight(0, 600_000, 100), 1);
        assert_eq!(warmup_weight(600_000, 600_000, 100), 100);
    }

    #[test]
    fn test_warmup_weight_monotone_and_clamped() {
        let mut last = 0;
        for uptime in (0..=600_000).step_by(60_000) {
            let w = warmup_weight(uptime, 600_000, 100);
            assert!(w >= last, "ramp must be non-decreasing");
            assert!((1..=100).contains(&w));
            last = w;
        }
        // halfway through warmup, roughly half the weight
        let half = warmup_weight(300_000, 600_000, 100);
        assert!((45..=55).contains(&half), "got {half}");
    }

    #[test]
    fn test_effective_weight_defaults_to_configured() {
        let invocation = Invocation::new("echo", vec![]);
        let invoker: Arc<dyn Invoker> = Arc::new(MockInvoker::new("a:1").with_weight(7));
        assert_eq!(effective_weight(&invoker, &invocation), 7);
    }

    #[test]
    fn test_effective_weight_ramps_during_warmup() {
        let invocation = Invocation::new("echo", vec![]);
        // started 1 minute ago with a 10 minute warmup
        let invoker: Arc<dyn Invoker> = Arc::new(
            MockInvoker::new("a:1")
                .with_weight(100)
                .with_param(TIMESTAMP_KEY, now_millis() - 60_000),
        );
        let w = effective_weight(&invoker, &invocation);
        assert!((1..=15).contains(&w), "got {w}");
    }

    #[test]
    fn test_select_single_candidate_short_circuits() {
        let lb = WeightedRandom::new();
        let invocation = Invocation::new("echo", vec![]);
        let only: Arc<dyn Invoker> = Arc::new(MockInvoker::new("a:1"));
        let picked = lb.select(&[only.clone()], &invocation).unwrap();
        assert_eq!(picked.address(), "a:1");
        assert!(lb.select(&[], &invocation).is_none());
    }

    #[test]
    fn test_registry_defaults_and_custom() {
        let mut registry = LoadBalanceRegistry::new();
        let available = registry.available();
        for name in [
            "random",
            "round_robin",
            "least_active",
            "consistent_hash",
            "shortest_response",
            "adaptive_p2c",
        ] {
            assert!(available.contains(&name), "missing {name}");
        }

        registry.register("first", Box::new(|_, _| Arc::new(FirstLb)));
        let stats = Arc::new(StatsRegistry::new());
        let lb = registry
            .create("first", stats, &LoadBalanceTuning::default())
            .unwrap();
        assert_eq!(lb.name(), "first");

        struct FirstLb;
        impl LoadBalance for FirstLb {
            fn name(&self) -> &'static str {
                "first"
            }
            fn do_select(
                &self,
                invokers: &[Arc<dyn Invoker>],
                _invocation: &Invocation,
            ) -> Arc<dyn Invoker> {
                invokers[0].clone()
            }
        }
    }
}
