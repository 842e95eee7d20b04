//! Per (endpoint, method) call statistics.
//!
//! One `MethodStats` instance is shared by every concurrent call to the
//! same (endpoint, method) pair. The active count is incremented when a
//! call starts and decremented exactly once when it completes, which the
//! RAII [`CallGuard`] enforces even if the call future is dropped mid-way
//! (timeout, cancellation).

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Counters for one (endpoint, method) pair. All elapsed sums are in
/// nanoseconds.
pub struct MethodStats {
    active: AtomicI64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    succeeded_elapsed: AtomicU64,
    failed_elapsed: AtomicU64,

    /// Sliding-window offsets, replaced wholesale on reset so readers
    /// never observe a torn snapshot.
    window: RwLock<Arc<WindowOffsets>>,
}

/// Counter values observed at the last window reset.
#[derive(Debug, Default, Clone, Copy)]
struct WindowOffsets {
    succeeded: u64,
    succeeded_elapsed: u64,
}

impl MethodStats {
    fn new() -> Self {
        Self {
            active: AtomicI64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            succeeded_elapsed: AtomicU64::new(0),
            failed_elapsed: AtomicU64::new(0),
            window: RwLock::new(Arc::new(WindowOffsets::default())),
        }
    }

    /// Calls currently in flight.
    pub fn active(&self) -> i64 {
        self.active.load(Ordering::Relaxed)
    }

    /// Completed successful calls.
    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    /// Completed failed calls.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Cumulative elapsed nanoseconds of successful calls.
    pub fn succeeded_elapsed(&self) -> u64 {
        self.succeeded_elapsed.load(Ordering::Relaxed)
    }

    /// Cumulative elapsed nanoseconds of failed calls.
    pub fn failed_elapsed(&self) -> u64 {
        self.failed_elapsed.load(Ordering::Relaxed)
    }

    /// Average successful latency in nanoseconds over the whole lifetime.
    pub fn avg_succeeded_elapsed(&self) -> u64 {
        let count = self.succeeded();
        if count == 0 {
            0
        } else {
            self.succeeded_elapsed() / count
        }
    }

    /// Successful calls since the last window reset.
    pub fn windowed_succeeded(&self) -> u64 {
        let offsets = *self.window.read().unwrap().clone();
        self.succeeded().saturating_sub(offsets.succeeded)
    }

    /// Elapsed nanoseconds of successful calls since the last reset.
    pub fn windowed_succeeded_elapsed(&self) -> u64 {
        let offsets = *self.window.read().unwrap().clone();
        self.succeeded_elapsed()
            .saturating_sub(offsets.succeeded_elapsed)
    }

    /// Average successful latency in nanoseconds inside the window.
    pub fn windowed_avg_succeeded_elapsed(&self) -> u64 {
        let count = self.windowed_succeeded();
        if count == 0 {
            0
        } else {
            self.windowed_succeeded_elapsed() / count
        }
    }

    /// Replace the window offsets with the current counters.
    pub fn reset_window(&self) {
        let snapshot = Arc::new(WindowOffsets {
            succeeded: self.succeeded(),
            succeeded_elapsed: self.succeeded_elapsed(),
        });
        *self.window.write().unwrap() = snapshot;
    }

    fn begin(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    fn complete(&self, elapsed_ns: u64, ok: bool) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        if ok {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
            self.succeeded_elapsed.fetch_add(elapsed_ns, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
            self.failed_elapsed.fetch_add(elapsed_ns, Ordering::Relaxed);
        }
    }
}

/// Registry of `MethodStats`, created lazily on first reference and kept
/// for the process lifetime of the endpoint.
#[derive(Default)]
pub struct StatsRegistry {
    entries: RwLock<HashMap<(String, String), Arc<MethodStats>>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stats for (address, method), created on first use.
    pub fn get(&self, address: &str, method: &str) -> Arc<MethodStats> {
        {
            let entries = self.entries.read().unwrap();
            if let Some(stats) = entries.get(&(address.to_string(), method.to_string())) {
                return stats.clone();
            }
        }
        let mut entries = self.entries.write().unwrap();
        entries
            .entry((address.to_string(), method.to_string()))
            .or_insert_with(|| Arc::new(MethodStats::new()))
            .clone()
    }

    /// Start tracking a call. The returned guard decrements the active
    /// count exactly once: explicitly via `success`/`failure`, or as a
    /// failure when dropped without either.
    pub fn begin(&self, address: &str, method: &str) -> CallGuard {
        let stats = self.get(address, method);
        stats.begin();
        CallGuard {
            stats,
            started: Instant::now(),
            done: false,
        }
    }
}

/// RAII completion guard for one in-flight call.
pub struct CallGuard {
    stats: Arc<MethodStats>,
    started: Instant,
    done: bool,
}

impl CallGuard {
    /// Record a successful completion.
    pub fn success(mut self) {
        self.finish(true);
    }

    /// Record a failed completion.
    pub fn failure(mut self) {
        self.finish(false);
    }

    /// Elapsed time since the call started.
    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    fn finish(&mut self, ok: bool) {
        if !self.done {
            self.done = true;
            let elapsed_ns = self.started.elapsed().as_nanos() as u64;
            self.stats.complete(elapsed_ns, ok);
        }
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        // A guard dropped without explicit completion counts as a failure;
        // this covers timed-out and cancelled call futures.
        self.finish(false);
    }
}
