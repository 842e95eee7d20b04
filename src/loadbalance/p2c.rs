//! Adaptive power-of-two-choices with Peak-EWMA latency cost.
//!
//! Two candidates are sampled at random and the one with the lower load
//! wins. Load is a peak-sensitive decayed latency estimate scaled by
//! in-flight calls: a latency spike is adopted immediately (`max`) and
//! then decays over the configured half-life, so one pathological peak
//! steers traffic away for a while without being remembered forever.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::trace;

use crate::invocation::Invocation;
use crate::invoker::Invoker;
use crate::stats::StatsRegistry;

use super::{effective_weight, pick_weighted, LoadBalance};

/// Load assigned to an endpoint that is active but has never been
/// observed, so fresh endpoints are probed cautiously instead of flooded.
const UNOBSERVED_PENALTY_NS: f64 = 1e12;

/// Peak-EWMA latency estimate for one (endpoint, method) pair.
struct PeakEwma {
    cost_ns: f64,
    last_observed: Option<Instant>,
}

impl PeakEwma {
    fn new() -> Self {
        Self {
            cost_ns: 0.0,
            last_observed: None,
        }
    }

    fn observe(&mut self, rtt: Duration, decay: Duration) {
        let rtt_ns = rtt.as_nanos() as f64;
        let now = Instant::now();
        let decayed = match self.last_observed {
            Some(last) => {
                let dt = now.duration_since(last).as_nanos() as f64;
                let factor = (-dt / decay.as_nanos() as f64).exp();
                self.cost_ns * factor + rtt_ns * (1.0 - factor)
            }
            None => rtt_ns,
        };
        // peaks are adopted immediately, decay only brings the cost down
        self.cost_ns = rtt_ns.max(decayed);
        self.last_observed = Some(now);
    }

    fn load(&self, active: i64) -> f64 {
        let cost = if self.cost_ns == 0.0 && active > 0 {
            UNOBSERVED_PENALTY_NS
        } else {
            self.cost_ns
        };
        cost * (active + 1) as f64
    }
}

/// Adaptive P2C policy.
pub struct AdaptiveP2c {
    stats: Arc<StatsRegistry>,
    decay: Duration,
    costs: RwLock<HashMap<(String, String), Arc<Mutex<PeakEwma>>>>,
}

impl AdaptiveP2c {
    pub fn new(stats: Arc<StatsRegistry>, decay: Duration) -> Self {
        Self {
            stats,
            decay,
            costs: RwLock::new(HashMap::new()),
        }
    }

    fn cost_entry(&self, address: &str, method: &str) -> Arc<Mutex<PeakEwma>> {
        {
            let costs = self.costs.read().unwrap();
            if let Some(entry) = costs.get(&(address.to_string(), method.to_string())) {
                return entry.clone();
            }
        }
        self.costs
            .write()
            .unwrap()
            .entry((address.to_string(), method.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(PeakEwma::new())))
            .clone()
    }

    fn load(&self, invoker: &Arc<dyn Invoker>, method: &str) -> f64 {
        let active = self.stats.get(invoker.address(), method).active();
        let entry = self.cost_entry(invoker.address(), method);
        let load = entry.lock().unwrap().load(active);
        trace!(endpoint = invoker.address(), load, active, "p2c load");
        load
    }

    /// Sample two distinct indices. With more than two candidates the
    /// pair is re-drawn up to three times while both picks are
    /// unobserved-and-active (a degenerate comparison where neither side
    /// carries information).
    fn sample_pair(&self, invokers: &[Arc<dyn Invoker>], method: &str) -> (usize, usize) {
        let n = invokers.len();
        let mut rng = rand::thread_rng();
        let draw = |rng: &mut rand::rngs::ThreadRng| {
            let a = rng.gen_range(0..n);
            let b = (a + rng.gen_range(1..n)) % n;
            (a, b)
        };

        let mut pair = draw(&mut rng);
        if n > 2 {
            for _ in 0..2 {
                let degenerate = [pair.0, pair.1].iter().all(|&i| {
                    let stats = self.stats.get(invokers[i].address(), method);
                    let entry = self.cost_entry(invokers[i].address(), method);
                    let unobserved = entry.lock().unwrap().cost_ns == 0.0;
                    unobserved && stats.active() > 0
                });
                if !degenerate {
                    break;
                }
                pair = draw(&mut rng);
            }
        }
        pair
    }
}

impl LoadBalance for AdaptiveP2c {
    fn name(&self) -> &'static str {
        "adaptive_p2c"
    }

    fn do_select(
        &self,
        invokers: &[Arc<dyn Invoker>],
        invocation: &Invocation,
    ) -> Arc<dyn Invoker> {
        let method = invocation.method();
        let (a, b) = self.sample_pair(invokers, method);

        let load_a = self.load(&invokers[a], method);
        let load_b = self.load(&invokers[b], method);

        if load_a < load_b {
            return invokers[a].clone();
        }
        if load_b < load_a {
            return invokers[b].clone();
        }

        // equal load: weighted random between the two
        let weights: Vec<i64> = invokers
            .iter()
            .map(|i| effective_weight(i, invocation))
            .collect();
        invokers[pick_weighted(&[a, b], &weights)].clone()
    }

    fn on_complete(
        &self,
        invoker: &Arc<dyn Invoker>,
        invocation: &Invocation,
        rtt: Duration,
        ok: bool,
    ) {
        // only successful round trips inform the latency estimate;
        // failures are already steered away from by the active count
        if ok {
            let entry = self.cost_entry(invoker.address(), invocation.method());
            entry.lock().unwrap().observe(rtt, self.decay);
        }
    }
}
