//! Smooth weighted round robin.
//!
//! Nginx-style smoothing: every candidate's running counter grows by its
//! weight on each pass, the maximum wins and is pushed back down by the
//! weight total. This interleaves selections evenly instead of bursting
//! all of a heavy endpoint's turns together.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::invocation::Invocation;
use crate::invoker::Invoker;

use super::{effective_weight, now_millis, LoadBalance};

/// Entries unseen for this long are purged from the per-method table.
const RECYCLE_PERIOD_MS: i64 = 60_000;

struct WeightedEntry {
    weight: AtomicI64,
    current: AtomicI64,
    last_update: AtomicI64,
}

impl WeightedEntry {
    fn new(weight: i64) -> Self {
        Self {
            weight: AtomicI64::new(weight),
            current: AtomicI64::new(0),
            last_update: AtomicI64::new(now_millis()),
        }
    }

    /// Weight changed (warm-up ramp); restart the smoothing counter.
    fn set_weight(&self, weight: i64) {
        self.weight.store(weight, Ordering::Relaxed);
        self.current.store(0, Ordering::Relaxed);
    }

    fn advance(&self, weight: i64, now: i64) -> i64 {
        self.last_update.store(now, Ordering::Relaxed);
        self.current.fetch_add(weight, Ordering::Relaxed) + weight
    }
}

type MethodTable = Arc<RwLock<HashMap<String, Arc<WeightedEntry>>>>;

/// Smooth weighted round-robin policy with a per-method weight table.
pub struct RoundRobin {
    tables: RwLock<HashMap<String, MethodTable>>,
    cleaning: AtomicBool,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            cleaning: AtomicBool::new(false),
        }
    }

    fn table(&self, method: &str) -> MethodTable {
        {
            let tables = self.tables.read().unwrap();
            if let Some(table) = tables.get(method) {
                return table.clone();
            }
        }
        self.tables
            .write()
            .unwrap()
            .entry(method.to_string())
            .or_default()
            .clone()
    }

    fn entry(table: &MethodTable, address: &str, weight: i64) -> Arc<WeightedEntry> {
        {
            let entries = table.read().unwrap();
            if let Some(entry) = entries.get(address) {
                return entry.clone();
            }
        }
        table
            .write()
            .unwrap()
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(WeightedEntry::new(weight)))
            .clone()
    }

    /// Drop entries for endpoints that left the candidate list. Only one
    /// thread cleans at a time; concurrent selections proceed untouched.
    fn purge_stale(&self, table: &MethodTable, now: i64) {
        if self
            .cleaning
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let mut entries = table.write().unwrap();
        let before = entries.len();
        entries.retain(|_, e| now - e.last_update.load(Ordering::Relaxed) <= RECYCLE_PERIOD_MS);
        if entries.len() < before {
            debug!(purged = before - entries.len(), "round robin table purged");
        }
        self.cleaning.store(false, Ordering::Release);
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalance for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn do_select(
        &self,
        invokers: &[Arc<dyn Invoker>],
        invocation: &Invocation,
    ) -> Arc<dyn Invoker> {
        let table = self.table(invocation.method());
        let now = now_millis();

        let mut total_weight: i64 = 0;
        let mut max_current = i64::MIN;
        let mut selected = 0;
        let mut selected_entry: Option<Arc<WeightedEntry>> = None;

        for (i, invoker) in invokers.iter().enumerate() {
            let weight = effective_weight(invoker, invocation);
            let entry = Self::entry(&table, invoker.address(), weight);
            if entry.weight.load(Ordering::Relaxed) != weight {
                entry.set_weight(weight);
            }
            let current = entry.advance(weight, now);
            if current > max_current {
                max_current = current;
                selected = i;
                selected_entry = Some(entry.clone());
            }
            total_weight += weight;
        }

        if invokers.len() != table.read().unwrap().len() {
            self.purge_stale(&table, now);
        }

        if let Some(entry) = selected_entry {
            entry.current.fetch_sub(total_weight, Ordering::Relaxed);
            return invokers[selected].clone();
        }
        invokers[0].clone()
    }
}
