//! Weighted random selection.

use std::sync::Arc;

use rand::Rng;

use crate::invocation::Invocation;
use crate::invoker::Invoker;

use super::{effective_weight, LoadBalance};

/// Picks an endpoint at random, biased by effective weight. When every
/// candidate carries the same weight the draw is uniform.
pub struct WeightedRandom;

impl WeightedRandom {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WeightedRandom {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalance for WeightedRandom {
    fn name(&self) -> &'static str {
        "random"
    }

    fn do_select(
        &self,
        invokers: &[Arc<dyn Invoker>],
        invocation: &Invocation,
    ) -> Arc<dyn Invoker> {
        let mut total: i64 = 0;
        let mut same_weight = true;
        let mut weights = Vec::with_capacity(invokers.len());

        for (i, invoker) in invokers.iter().enumerate() {
            let weight = effective_weight(invoker, invocation);
            weights.push(weight);
            total += weight;
            if same_weight && i > 0 && weight != weights[i - 1] {
                same_weight = false;
            }
        }

        let mut rng = rand::thread_rng();
        if total > 0 && !same_weight {
            let mut offset = rng.gen_range(0..total);
            for (i, &weight) in weights.iter().enumerate() {
                offset -= weight;
                if offset < 0 {
                    return invokers[i].clone();
                }
            }
        }

        invokers[rng.gen_range(0..invokers.len())].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockInvoker;

    fn weighted(addr: &str, weight: i64) -> Arc<dyn Invoker> {
        Arc::new(MockInvoker::new(addr).with_weight(weight))
    }

    #[test]
    fn test_zero_total_weight_falls_back_to_uniform() {
        let lb = WeightedRandom::new();
        let invocation = Invocation::new("echo", vec![]);
        let invokers = vec![weighted("a:1", 0), weighted("b:2", 0)];
        // must not panic and must return one of the candidates
        for _ in 0..50 {
            let picked = lb.do_select(&invokers, &invocation);
            assert!(["a:1", "b:2"].contains(&picked.address()));
        }
    }

    #[test]
    fn test_heaviest_dominates() {
        let lb = WeightedRandom::new();
        let invocation = Invocation::new("echo", vec![]);
        let invokers = vec![weighted("a:1", 90), weighted("b:2", 10)];

        let mut a_hits = 0;
        for _ in 0..2_000 {
            if lb.do_select(&invokers, &invocation).address() == "a:1" {
                a_hits += 1;
            }
        }
        // Expectation is 1800; a wide margin keeps the test stable.
        assert!(a_hits > 1_500, "a:1 picked only {a_hits}/2000 times");
    }
}
