//! Failure taxonomy for cluster invocations.
//!
//! Business errors come from the remote method itself and are never
//! retried; transport errors and timeouts are eligible for retry and
//! reselection depending on the fault-tolerance strategy in use.

use std::time::Duration;

/// Errors surfaced by cluster invocation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The directory returned no candidates for this call.
    #[error("no provider available for method `{method}`")]
    NoCandidates { method: String },

    /// The remote method signaled a domain-level failure.
    #[error("business error from {address}: {message}")]
    Business { address: String, message: String },

    /// Connection or protocol failure while talking to an endpoint.
    #[error("transport error to {address}: {message}")]
    Transport { address: String, message: String },

    /// The per-call deadline elapsed before a result was observed.
    /// The call may or may not have executed remotely.
    #[error("call to {address} timed out after {timeout:?}")]
    Timeout { address: String, timeout: Duration },

    /// Failover or failback exhausted its retry budget.
    #[error(
        "method `{method}` failed after {attempts} attempts on [{}]",
        tried.join(", ")
    )]
    RetriesExhausted {
        method: String,
        attempts: usize,
        tried: Vec<String>,
        #[source]
        last: Box<Error>,
    },

    /// At least one endpoint of a broadcast fan-out failed. Partial
    /// success may have occurred on other endpoints.
    #[error("broadcast failed on {failed} of {total} endpoints, first failure at {address}")]
    Broadcast {
        address: String,
        failed: usize,
        total: usize,
        #[source]
        first: Box<Error>,
    },

    /// The cluster invoker has been destroyed and accepts no more calls.
    #[error("cluster invoker is destroyed")]
    Destroyed,
}

impl Error {
    /// Whether this is a domain-level error raised by the remote method.
    /// Business errors always propagate immediately and bypass retries.
    pub fn is_business(&self) -> bool {
        matches!(self, Error::Business { .. })
    }

    /// Whether a fault-tolerance strategy may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport { .. } | Error::Timeout { .. })
    }

    /// The endpoint address this error originated from, if any.
    pub fn address(&self) -> Option<&str> {
        match self {
            Error::Business { address, .. }
            | Error::Transport { address, .. }
            | Error::Timeout { address, .. }
            | Error::Broadcast { address, .. } => Some(address),
            _ => None,
        }
    }
}
