//! Cluster invocation: endpoint selection plus fault tolerance.
//!
//! A fault-tolerance strategy wraps the shared selection core:
//! - the core picks one endpoint per attempt (sticky cache, exclusion of
//!   already-tried endpoints, reselection around unavailable picks)
//! - the strategy decides what happens on failure: propagate, retry on a
//!   distinct endpoint, swallow, requeue on a timer, or fan out to all

mod broadcast;
mod failback;
mod failfast;
mod failover;
mod failsafe;

pub use broadcast::{Broadcast, BROADCAST_RESULT_PREFIX};
pub use failback::Failback;
pub use failfast::Failfast;
pub use failover::Failover;
pub use failsafe::Failsafe;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::{ClusterConfig, StrategyKind, STICKY_KEY, TIMEOUT_KEY};
use crate::directory::Directory;
use crate::error::Error;
use crate::invocation::Invocation;
use crate::invoker::{Invoker, Response};
use crate::loadbalance::{self, LoadBalance};
use crate::stats::StatsRegistry;

/// Attachment key recording which strategy handled the call.
pub const CLUSTER_ATTACHMENT_KEY: &str = "cluster";

/// A fault-tolerance strategy over a cluster of endpoints.
#[async_trait]
pub trait ClusterInvoker: Send + Sync {
    /// Strategy name.
    fn name(&self) -> &'static str;

    /// Execute one logical call under this strategy's policy.
    async fn invoke(&self, invocation: Arc<Invocation>) -> Result<Response, Error>;

    /// Whether a call stands a chance of succeeding right now.
    fn is_available(&self) -> bool;

    /// Release resources. Idempotent.
    fn destroy(&self);
}

/// Build the configured strategy over `directory`.
pub fn build_cluster(
    directory: Arc<dyn Directory>,
    config: ClusterConfig,
) -> Arc<dyn ClusterInvoker> {
    let stats = Arc::new(StatsRegistry::new());
    let load_balance = loadbalance::build(config.load_balance, stats.clone(), &config.tuning);
    build_cluster_with(directory, load_balance, stats, config)
}

/// Build the configured strategy with an explicit policy and registry.
pub fn build_cluster_with(
    directory: Arc<dyn Directory>,
    load_balance: Arc<dyn LoadBalance>,
    stats: Arc<StatsRegistry>,
    config: ClusterConfig,
) -> Arc<dyn ClusterInvoker> {
    info!(
        strategy = ?config.strategy,
        load_balance = load_balance.name(),
        "cluster invoker created"
    );
    let core = Arc::new(ClusterCore::new(directory, load_balance, stats, config));

    match core.config().strategy {
        StrategyKind::Failover => Arc::new(Failover::new(core)),
        StrategyKind::Failfast => Arc::new(Failfast::new(core)),
        StrategyKind::Failsafe => Arc::new(Failsafe::new(core)),
        StrategyKind::Failback => Arc::new(Failback::new(core)),
        StrategyKind::Broadcast => Arc::new(Broadcast::new(core)),
    }
}

/// Shared selection and bookkeeping used by every strategy.
pub struct ClusterCore {
    directory: Arc<dyn Directory>,
    load_balance: Arc<dyn LoadBalance>,
    stats: Arc<StatsRegistry>,
    config: ClusterConfig,
    sticky_invoker: RwLock<Option<Arc<dyn Invoker>>>,
    destroyed: AtomicBool,
}

impl ClusterCore {
    pub fn new(
        directory: Arc<dyn Directory>,
        load_balance: Arc<dyn LoadBalance>,
        stats: Arc<StatsRegistry>,
        config: ClusterConfig,
    ) -> Self {
        Self {
            directory,
            load_balance,
            stats,
            config,
            sticky_invoker: RwLock::new(None),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<StatsRegistry> {
        &self.stats
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    /// Current candidates from the directory.
    pub fn list(&self, invocation: &Invocation) -> Vec<Arc<dyn Invoker>> {
        self.directory.list(invocation)
    }

    pub fn check_destroyed(&self) -> Result<(), Error> {
        if self.destroyed.load(Ordering::SeqCst) {
            Err(Error::Destroyed)
        } else {
            Ok(())
        }
    }

    pub fn check_candidates(
        &self,
        invokers: &[Arc<dyn Invoker>],
        invocation: &Invocation,
    ) -> Result<(), Error> {
        if invokers.is_empty() {
            Err(Error::NoCandidates {
                method: invocation.method().to_string(),
            })
        } else {
            Ok(())
        }
    }

    pub fn is_available(&self) -> bool {
        if let Some(sticky) = self.sticky_invoker.read().unwrap().as_ref() {
            return sticky.is_available();
        }
        self.directory.is_available()
    }

    /// Idempotent destroy, forwarded to the directory.
    pub fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            self.directory.destroy();
            debug!("cluster core destroyed");
        }
    }

    /// Select one endpoint for this attempt.
    ///
    /// Sticky routing is consulted first; otherwise the policy picks, and
    /// a pick that is unavailable or already in `selected` triggers
    /// reselection.
    pub fn select(
        &self,
        invocation: &Invocation,
        invokers: &[Arc<dyn Invoker>],
        selected: &[Arc<dyn Invoker>],
    ) -> Option<Arc<dyn Invoker>> {
        if invokers.is_empty() {
            return None;
        }

        let method = invocation.method();
        let sticky = invokers[0].param(method, STICKY_KEY, self.config.sticky as i64) != 0;

        // a pinned endpoint that left the candidate list is forgotten
        {
            let mut cached = self.sticky_invoker.write().unwrap();
            if let Some(inv) = cached.as_ref() {
                if !contains(invokers, inv.address()) {
                    *cached = None;
                }
            }
        }

        if sticky {
            let cached = self.sticky_invoker.read().unwrap().clone();
            if let Some(inv) = cached {
                if !contains(selected, inv.address())
                    && (!self.config.availability_check || inv.is_available())
                {
                    return Some(inv);
                }
            }
        }

        let invoker = self.do_select(invocation, invokers, selected);

        if sticky {
            *self.sticky_invoker.write().unwrap() = invoker.clone();
        }
        invoker
    }

    fn do_select(
        &self,
        invocation: &Invocation,
        invokers: &[Arc<dyn Invoker>],
        selected: &[Arc<dyn Invoker>],
    ) -> Option<Arc<dyn Invoker>> {
        if invokers.len() == 1 {
            let only = invokers[0].clone();
            if self.config.availability_check && !only.is_available() {
                self.invalidate(&only);
            }
            return Some(only);
        }

        let mut invoker = self.load_balance.select(invokers, invocation)?;

        let is_selected = contains(selected, invoker.address());
        let is_unavailable = self.config.availability_check && !invoker.is_available();
        if is_unavailable {
            self.invalidate(&invoker);
        }

        if is_selected || is_unavailable {
            match self.reselect(invocation, invokers, selected) {
                Some(reselected) => invoker = reselected,
                None => {
                    // last resort: the next index after the original pick
                    let index = invokers
                        .iter()
                        .position(|i| i.address() == invoker.address())
                        .unwrap_or(0);
                    invoker = invokers[(index + 1) % invokers.len()].clone();
                }
            }
        }

        Some(invoker)
    }

    /// Prefer endpoints not yet tried and currently available; fall back
    /// to already-tried endpoints that recovered.
    fn reselect(
        &self,
        invocation: &Invocation,
        invokers: &[Arc<dyn Invoker>],
        selected: &[Arc<dyn Invoker>],
    ) -> Option<Arc<dyn Invoker>> {
        let reselect_count = self.config.reselect_count.max(1);
        let mut pool: Vec<Arc<dyn Invoker>> =
            Vec::with_capacity(reselect_count.min(invokers.len()));

        if reselect_count >= invokers.len() {
            for invoker in invokers {
                if self.config.availability_check && !invoker.is_available() {
                    self.invalidate(invoker);
                    continue;
                }
                if !contains(selected, invoker.address()) {
                    pool.push(invoker.clone());
                }
            }
        } else {
            // candidate set is large: sample instead of scanning everything
            let mut rng = rand::thread_rng();
            for _ in 0..reselect_count {
                let invoker = &invokers[rng.gen_range(0..invokers.len())];
                if self.config.availability_check && !invoker.is_available() {
                    self.invalidate(invoker);
                    continue;
                }
                if !contains(selected, invoker.address()) && !contains(&pool, invoker.address()) {
                    pool.push(invoker.clone());
                }
            }
        }

        if !pool.is_empty() {
            return self.load_balance.select(&pool, invocation);
        }

        // everything has been tried; accept a tried endpoint that is
        // available again
        for invoker in selected {
            if invoker.is_available() && !contains(&pool, invoker.address()) {
                pool.push(invoker.clone());
            }
        }
        if !pool.is_empty() {
            return self.load_balance.select(&pool, invocation);
        }

        None
    }

    fn invalidate(&self, invoker: &Arc<dyn Invoker>) {
        if self.config.connectivity_validation {
            self.directory.add_invalidated(invoker);
        }
    }

    /// Invoke one endpoint with statistics bookkeeping and the per-attempt
    /// timeout. The active count is incremented before the call and
    /// decremented exactly once however the call ends.
    pub async fn invoke_with_stats(
        &self,
        invoker: &Arc<dyn Invoker>,
        invocation: &Invocation,
    ) -> Result<Response, Error> {
        invocation.add_invoked(invoker.clone());

        let method = invocation.method();
        let guard = self.stats.begin(invoker.address(), method);
        let timeout_ms = invoker
            .param(method, TIMEOUT_KEY, self.config.timeout.as_millis() as i64)
            .max(1) as u64;
        let timeout = Duration::from_millis(timeout_ms);

        match tokio::time::timeout(timeout, invoker.invoke(invocation)).await {
            Ok(Ok(response)) => {
                let rtt = guard.elapsed();
                guard.success();
                self.load_balance.on_complete(invoker, invocation, rtt, true);
                Ok(response)
            }
            Ok(Err(err)) => {
                let rtt = guard.elapsed();
                guard.failure();
                self.load_balance.on_complete(invoker, invocation, rtt, false);
                Err(err)
            }
            Err(_) => {
                let rtt = guard.elapsed();
                guard.failure();
                self.load_balance.on_complete(invoker, invocation, rtt, false);
                warn!(endpoint = %invoker.address(), method, ?timeout, "invocation timed out");
                Err(Error::Timeout {
                    address: invoker.address().to_string(),
                    timeout,
                })
            }
        }
    }
}

fn contains(invokers: &[Arc<dyn Invoker>], address: &str) -> bool {
    invokers.iter().any(|i| i.address() == address)
}
