//! Cluster configuration types and per-method parameter keys.
//!
//! Every tunable can also be overridden per call via the invoker's
//! method-scoped parameter lookup; the config value acts as the default.

use std::time::Duration;

use serde::Deserialize;

/// Parameter key: configured endpoint weight.
pub const WEIGHT_KEY: &str = "weight";
/// Parameter key: warm-up period in milliseconds.
pub const WARMUP_KEY: &str = "warmup";
/// Parameter key: remote process start timestamp, epoch milliseconds.
pub const TIMESTAMP_KEY: &str = "timestamp";
/// Parameter key: failover retry count (attempts = retries + 1).
pub const RETRIES_KEY: &str = "retries";
/// Parameter key: per-attempt timeout in milliseconds.
pub const TIMEOUT_KEY: &str = "timeout";
/// Parameter key: sticky routing toggle (0 or 1).
pub const STICKY_KEY: &str = "sticky";

/// Default endpoint weight.
pub const DEFAULT_WEIGHT: i64 = 100;
/// Default warm-up period: 10 minutes.
pub const DEFAULT_WARMUP_MS: i64 = 10 * 60 * 1000;

/// Cluster-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Fault-tolerance strategy.
    #[serde(default)]
    pub strategy: StrategyKind,

    /// Load-balancing policy.
    #[serde(default)]
    pub load_balance: LoadBalanceKind,

    /// Failover retry count (total attempts = retries + 1).
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Per-attempt invocation timeout.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Prefer the last successfully selected endpoint.
    #[serde(default)]
    pub sticky: bool,

    /// Consult `is_available` during selection and reselection.
    #[serde(default = "default_true")]
    pub availability_check: bool,

    /// Upper bound on the reselection candidate pool.
    #[serde(default = "default_reselect_count")]
    pub reselect_count: usize,

    /// Report unreachable endpoints back to the directory.
    #[serde(default = "default_true")]
    pub connectivity_validation: bool,

    /// How broadcast picks the overall result value.
    #[serde(default)]
    pub broadcast_results: BroadcastResults,

    /// Delay before the first failback retry and between retries.
    #[serde(default = "default_failback_delay", with = "humantime_serde")]
    pub failback_delay: Duration,

    /// Failback retry budget. Defaults to `retries + 1` when unset.
    #[serde(default)]
    pub failback_retries: Option<u32>,

    /// Load-balance algorithm tunables.
    #[serde(default)]
    pub tuning: LoadBalanceTuning,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            load_balance: LoadBalanceKind::default(),
            retries: default_retries(),
            timeout: default_timeout(),
            sticky: false,
            availability_check: true,
            reselect_count: default_reselect_count(),
            connectivity_validation: true,
            broadcast_results: BroadcastResults::default(),
            failback_delay: default_failback_delay(),
            failback_retries: None,
            tuning: LoadBalanceTuning::default(),
        }
    }
}

impl ClusterConfig {
    /// Effective failback retry budget.
    pub fn failback_budget(&self) -> u32 {
        self.failback_retries.unwrap_or(self.retries + 1)
    }
}

/// Fault-tolerance strategy kind.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    Failover,
    Failfast,
    Failsafe,
    Failback,
    Broadcast,
}

/// Load-balancing policy kind.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceKind {
    #[default]
    Random,
    RoundRobin,
    LeastActive,
    ConsistentHash,
    ShortestResponse,
    AdaptiveP2c,
}

/// Broadcast overall-result selection mode.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastResults {
    /// Return the first successful endpoint's payload.
    #[default]
    First,
    /// Return an empty payload; per-endpoint outcomes live in the
    /// invocation attachments.
    All,
}

/// Tunables for the load-balance algorithms.
#[derive(Debug, Clone, Deserialize)]
pub struct LoadBalanceTuning {
    /// Virtual nodes per endpoint on the consistent-hash ring.
    /// Rounded down to a multiple of 4 (four 32-bit slices per digest).
    #[serde(default = "default_hash_replicas")]
    pub hash_replicas: usize,

    /// Argument indices hashed for consistent-hash selection.
    #[serde(default = "default_hash_arguments")]
    pub hash_arguments: Vec<usize>,

    /// Overload protection ratio for consistent hashing.
    #[serde(default = "default_overload_ratio")]
    pub overload_ratio: f64,

    /// Sliding-window reset period for shortest-response.
    #[serde(default = "default_slide_period", with = "humantime_serde")]
    pub slide_period: Duration,

    /// Peak-EWMA decay half-life for adaptive P2C.
    #[serde(default = "default_ewma_decay", with = "humantime_serde")]
    pub ewma_decay: Duration,
}

impl Default for LoadBalanceTuning {
    fn default() -> Self {
        Self {
            hash_replicas: default_hash_replicas(),
            hash_arguments: default_hash_arguments(),
            overload_ratio: default_overload_ratio(),
            slide_period: default_slide_period(),
            ewma_decay: default_ewma_decay(),
        }
    }
}

fn default_retries() -> u32 {
    2
}

fn default_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_true() -> bool {
    true
}

fn default_reselect_count() -> usize {
    10
}

fn default_failback_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_hash_replicas() -> usize {
    160
}

fn default_hash_arguments() -> Vec<usize> {
    vec![0]
}

fn default_overload_ratio() -> f64 {
    1.5
}

fn default_slide_period() -> Duration {
    Duration::from_secs(30)
}

fn default_ewma_decay() -> Duration {
    Duration::from_secs(10)
}
