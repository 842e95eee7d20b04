//! Weighted least-active selection.

use std::sync::Arc;

use crate::invocation::Invocation;
use crate::invoker::Invoker;
use crate::stats::StatsRegistry;

use super::{effective_weight, pick_weighted, LoadBalance};

/// Prefers the endpoint with the fewest in-flight calls. Endpoints tying
/// for the minimum are decided by weighted random over the tied set, or
/// uniform random when their weights are all equal.
pub struct LeastActive {
    stats: Arc<StatsRegistry>,
}

impl LeastActive {
    pub fn new(stats: Arc<StatsRegistry>) -> Self {
        Self { stats }
    }
}

impl LoadBalance for LeastActive {
    fn name(&self) -> &'static str {
        "least_active"
    }

    fn do_select(
        &self,
        invokers: &[Arc<dyn Invoker>],
        invocation: &Invocation,
    ) -> Arc<dyn Invoker> {
        let method = invocation.method();

        let mut least_active = i64::MAX;
        let mut tied: Vec<usize> = Vec::new();
        let mut weights = vec![0i64; invokers.len()];
        let mut tied_total: i64 = 0;
        let mut first_weight: i64 = 0;
        let mut same_weight = true;

        for (i, invoker) in invokers.iter().enumerate() {
            let active = self.stats.get(invoker.address(), method).active();
            let weight = effective_weight(invoker, invocation);
            weights[i] = weight;

            if active < least_active {
                least_active = active;
                tied.clear();
                tied.push(i);
                tied_total = weight;
                first_weight = weight;
                same_weight = true;
            } else if active == least_active {
                tied.push(i);
                tied_total += weight;
                if weight != first_weight {
                    same_weight = false;
                }
            }
        }

        if tied.len() == 1 {
            return invokers[tied[0]].clone();
        }

        if !same_weight && tied_total > 0 {
            return invokers[pick_weighted(&tied, &weights)].clone();
        }

        let i = tied[rand::Rng::gen_range(&mut rand::thread_rng(), 0..tied.len())];
        invokers[i].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockInvoker;

    fn invoker(addr: &str, weight: i64) -> Arc<dyn Invoker> {
        Arc::new(MockInvoker::new(addr).with_weight(weight))
    }

    #[test]
    fn test_least_active_always_wins() {
        let stats = Arc::new(StatsRegistry::new());
        let lb = LeastActive::new(stats.clone());
        let invocation = Invocation::new("echo", vec![]);
        let invokers = vec![invoker("a:1", 100), invoker("b:2", 100), invoker("c:3", 100)];

        // a and b each have one call in flight, c has none
        let _g1 = stats.begin("a:1", "echo");
        let _g2 = stats.begin("b:2", "echo");

        for _ in 0..50 {
            assert_eq!(lb.do_select(&invokers, &invocation).address(), "c:3");
        }
    }

    #[test]
    fn test_tied_set_uses_weighted_random() {
        let stats = Arc::new(StatsRegistry::new());
        let lb = LeastActive::new(stats.clone());
        let invocation = Invocation::new("echo", vec![]);
        // c is busy, a and b tie at zero active with unequal weights
        let invokers = vec![invoker("a:1", 90), invoker("b:2", 10), invoker("c:3", 100)];
        let _busy = stats.begin("c:3", "echo");

        let mut a_hits = 0;
        for _ in 0..1_000 {
            match lb.do_select(&invokers, &invocation).address() {
                "a:1" => a_hits += 1,
                "b:2" => {}
                other => panic!("busy endpoint {other} must not be selected"),
            }
        }
        assert!(a_hits > 750, "a:1 picked only {a_hits}/1000 times");
    }

    #[test]
    fn test_all_idle_equal_weight_spreads() {
        let stats = Arc::new(StatsRegistry::new());
        let lb = LeastActive::new(stats);
        let invocation = Invocation::new("echo", vec![]);
        let invokers = vec![invoker("a:1", 100), invoker("b:2", 100)];

        let mut a_hits = 0;
        for _ in 0..1_000 {
            if lb.do_select(&invokers, &invocation).address() == "a:1" {
                a_hits += 1;
            }
        }
        assert!((300..=700).contains(&a_hits), "got {a_hits}");
    }
}
