//! Mock invoker for testing without a transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::trace;

use crate::error::Error;
use crate::invocation::Invocation;
use crate::invoker::{Invoker, Response};

/// Scripted behavior for a [`MockInvoker`].
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Always succeed; the response payload is the endpoint address.
    Success,
    /// Always fail with a transport error.
    Transport,
    /// Always fail with a business error.
    Business,
    /// Fail the first `n` calls with a transport error, then succeed.
    FailTimes(u64),
    /// Never complete (for timeout tests).
    Hang,
    /// Panic inside the handler (for fan-out isolation tests).
    Panic,
}

/// Endpoint stand-in with configurable behavior, parameters, latency and
/// availability.
pub struct MockInvoker {
    address: String,
    available: AtomicBool,
    behavior: MockBehavior,
    latency: Duration,
    params: HashMap<String, i64>,
    calls: AtomicU64,
}

impl MockInvoker {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            available: AtomicBool::new(true),
            behavior: MockBehavior::Success,
            latency: Duration::ZERO,
            params: HashMap::new(),
            calls: AtomicU64::new(0),
        }
    }

    pub fn with_behavior(mut self, behavior: MockBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Set the `weight` parameter.
    pub fn with_weight(self, weight: i64) -> Self {
        self.with_param(crate::config::WEIGHT_KEY, weight)
    }

    /// Set a parameter returned by `param` for every method.
    pub fn with_param(mut self, key: impl Into<String>, value: i64) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Flip the availability flag.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of `invoke` calls received.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Invoker for MockInvoker {
    fn address(&self) -> &str {
        &self.address
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn param(&self, method: &str, key: &str, default: i64) -> i64 {
        // method-scoped value first, then the unscoped one
        self.params
            .get(&format!("{method}.{key}"))
            .or_else(|| self.params.get(key))
            .copied()
            .unwrap_or(default)
    }

    async fn invoke(&self, invocation: &Invocation) -> Result<Response, Error> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        trace!(endpoint = %self.address, method = invocation.method(), call, "mock invoke");

        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }

        match &self.behavior {
            MockBehavior::Success => Ok(Response::new(self.address.clone().into_bytes())),
            MockBehavior::Transport => Err(Error::Transport {
                address: self.address.clone(),
                message: "connection refused".into(),
            }),
            MockBehavior::Business => Err(Error::Business {
                address: self.address.clone(),
                message: "rejected by remote method".into(),
            }),
            MockBehavior::FailTimes(n) => {
                if call < *n {
                    Err(Error::Transport {
                        address: self.address.clone(),
                        message: format!("transient failure #{}", call + 1),
                    })
                } else {
                    Ok(Response::new(self.address.clone().into_bytes()))
                }
            }
            MockBehavior::Hang => {
                futures::future::pending::<()>().await;
                unreachable!()
            }
            MockBehavior::Panic => panic!("scripted handler crash at {}", self.address),
        }
    }
}
