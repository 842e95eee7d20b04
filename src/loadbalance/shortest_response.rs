//! Shortest estimated response selection.
//!
//! Estimates each candidate's response time as its windowed average
//! successful latency scaled by in-flight calls, and picks the minimum.
//! Windows reset periodically; a compare-and-swap flag makes sure only
//! one reset task runs at a time.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::invocation::Invocation;
use crate::invoker::Invoker;
use crate::stats::StatsRegistry;

use super::{effective_weight, pick_weighted, LoadBalance};

/// Shortest-estimated-response policy over sliding-window statistics.
pub struct ShortestResponse {
    stats: Arc<StatsRegistry>,
    slide_period: Duration,
    started: Instant,
    last_reset_ms: AtomicU64,
    resetting: Arc<AtomicBool>,
}

impl ShortestResponse {
    pub fn new(stats: Arc<StatsRegistry>, slide_period: Duration) -> Self {
        Self {
            stats,
            slide_period,
            started: Instant::now(),
            last_reset_ms: AtomicU64::new(0),
            resetting: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Estimated response time in nanoseconds: windowed average succeeded
    /// latency times (active + 1).
    fn estimate(&self, invoker: &Arc<dyn Invoker>, method: &str) -> u128 {
        let stats = self.stats.get(invoker.address(), method);
        let avg = stats.windowed_avg_succeeded_elapsed() as u128;
        let active = stats.active().max(0) as u128;
        avg * (active + 1)
    }

    /// Schedule a window reset for the candidates if the slide period has
    /// elapsed. The CAS flag guarantees resets never overlap; readers see
    /// either the old or the new offsets, never a mix.
    fn maybe_reset(&self, invokers: &[Arc<dyn Invoker>], method: &str) {
        let now_ms = self.started.elapsed().as_millis() as u64;
        let last = self.last_reset_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) < self.slide_period.as_millis() as u64 {
            return;
        }
        if self
            .resetting
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        self.last_reset_ms.store(now_ms, Ordering::Relaxed);

        let stats: Vec<_> = invokers
            .iter()
            .map(|i| self.stats.get(i.address(), method))
            .collect();
        trace!(method, windows = stats.len(), "resetting sliding windows");

        let resetting = self.resetting.clone();
        let reset = move || {
            for stat in &stats {
                stat.reset_window();
            }
            resetting.store(false, Ordering::Release);
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { reset() });
            }
            // no runtime (synchronous caller): reset inline
            Err(_) => reset(),
        }
    }
}

impl LoadBalance for ShortestResponse {
    fn name(&self) -> &'static str {
        "shortest_response"
    }

    fn do_select(
        &self,
        invokers: &[Arc<dyn Invoker>],
        invocation: &Invocation,
    ) -> Arc<dyn Invoker> {
        let method = invocation.method();

        let mut shortest = u128::MAX;
        let mut tied: Vec<usize> = Vec::new();
        let mut weights = vec![0i64; invokers.len()];
        let mut tied_total: i64 = 0;
        let mut first_weight: i64 = 0;
        let mut same_weight = true;

        for (i, invoker) in invokers.iter().enumerate() {
            let estimate = self.estimate(invoker, method);
            let weight = effective_weight(invoker, invocation);
            weights[i] = weight;

            if estimate < shortest {
                shortest = estimate;
                tied.clear();
                tied.push(i);
                tied_total = weight;
                first_weight = weight;
                same_weight = true;
            } else if estimate == shortest {
                tied.push(i);
                tied_total += weight;
                if weight != first_weight {
                    same_weight = false;
                }
            }
        }

        self.maybe_reset(invokers, method);

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
