//! Candidate list supplier.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use crate::invocation::Invocation;
use crate::invoker::Invoker;

/// Supplies the current candidate list for a call.
///
/// The list may change between calls as the registry pushes updates; the
/// cluster layer re-fetches it before every retry. `add_invalidated` is a
/// best-effort hint that an endpoint was found unreachable, not a
/// guarantee of exclusion.
pub trait Directory: Send + Sync {
    /// Current candidates for this call.
    fn list(&self, invocation: &Invocation) -> Vec<Arc<dyn Invoker>>;

    /// Report an endpoint found unreachable during selection.
    fn add_invalidated(&self, invoker: &Arc<dyn Invoker>);

    /// Whether any endpoint is believed available.
    fn is_available(&self) -> bool;

    /// Release resources. Idempotent.
    fn destroy(&self);
}

/// In-memory directory over a fixed invoker set.
///
/// Invalidated endpoints are dropped from `list` until they report
/// available again, at which point the invalidation is forgotten.
pub struct StaticDirectory {
    invokers: RwLock<Vec<Arc<dyn Invoker>>>,
    invalidated: RwLock<HashSet<String>>,
    destroyed: AtomicBool,
}

impl StaticDirectory {
    pub fn new(invokers: Vec<Arc<dyn Invoker>>) -> Self {
        Self {
            invokers: RwLock::new(invokers),
            invalidated: RwLock::new(HashSet::new()),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Replace the candidate set, simulating a registry push.
    pub fn update(&self, invokers: Vec<Arc<dyn Invoker>>) {
        info!(count = invokers.len(), "directory updated");
        *self.invokers.write().unwrap() = invokers;
    }

    /// Number of invokers currently held, ignoring invalidation.
    pub fn len(&self) -> usize {
        self.invokers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.invokers.read().unwrap().is_empty()
    }
}

impl Directory for StaticDirectory {
    fn list(&self, _invocation: &Invocation) -> Vec<Arc<dyn Invoker>> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Vec::new();
        }

        let invokers = self.invokers.read().unwrap();
        let mut invalidated = self.invalidated.write().unwrap();
        if invalidated.is_empty() {
            return invokers.clone();
        }

        // Recovered endpoints shed their invalidation mark.
        invalidated.retain(|addr| {
            invokers
                .iter()
                .any(|i| i.address() == addr && !i.is_available())
        });

        invokers
            .iter()
            .filter(|i| !invalidated.contains(i.address()))
            .cloned()
            .collect()
    }

    fn add_invalidated(&self, invoker: &Arc<dyn Invoker>) {
        let inserted = self
            .invalidated
            .write()
            .unwrap()
            .insert(invoker.address().to_string());
        if inserted {
            debug!(endpoint = %invoker.address(), "endpoint invalidated");
        }
    }

    fn is_available(&self) -> bool {
        !self.destroyed.load(Ordering::SeqCst)
            && self
                .invokers
                .read()
                .unwrap()
                .iter()
                .any(|i| i.is_available())
    }

    fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            debug!("directory destroyed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockInvoker;

    fn invoker(addr: &str) -> Arc<dyn Invoker> {
        Arc::new(MockInvoker::new(addr))
    }

    #[test]
    fn test_list_returns_all() {
        let dir = StaticDirectory::new(vec![invoker("a:1"), invoker("b:2")]);
        let inv = Invocation::new("echo", vec![]);
        assert_eq!(dir.list(&inv).len(), 2);
        assert!(dir.is_available());
    }

    #[test]
    fn test_invalidated_unavailable_endpoint_is_hidden() {
        let bad = Arc::new(MockInvoker::new("b:2"));
        bad.set_available(false);
        let bad_dyn: Arc<dyn Invoker> = bad.clone();
        let dir = StaticDirectory::new(vec![invoker("a:1"), bad_dyn.clone()]);
        dir.add_invalidated(&bad_dyn);

        let inv = Invocation::new("echo", vec![]);
        let listed = dir.list(&inv);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].address(), "a:1");

        // Endpoint recovers; the invalidation hint is forgotten.
        bad.set_available(true);
        assert_eq!(dir.list(&inv).len(), 2);
    }

    #[test]
    fn test_destroyed_directory_lists_nothing() {
        let dir = StaticDirectory::new(vec![invoker("a:1")]);
        dir.destroy();
        dir.destroy(); // idempotent
        let inv = Invocation::new("echo", vec![]);
        assert!(dir.list(&inv).is_empty());
        assert!(!dir.is_available());
    }
}
