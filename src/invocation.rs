//! Description of one logical method call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::invoker::Invoker;

/// One logical method call moving through the cluster layer.
///
/// The attachment bag carries out-of-band string hints (for example which
/// strategy last handled the call); the invoked list accumulates every
/// endpoint that has already been attempted, so retries can exclude them.
/// Both use interior mutability because strategies hold the invocation
/// behind an `Arc` while fan-out tasks run.
pub struct Invocation {
    method: String,
    args: Vec<String>,
    attachments: Mutex<HashMap<String, String>>,
    invoked: Mutex<Vec<Arc<dyn Invoker>>>,
}

impl Invocation {
    /// Create an invocation for `method` with positional arguments.
    pub fn new(method: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            method: method.into(),
            args,
            attachments: Mutex::new(HashMap::new()),
            invoked: Mutex::new(Vec::new()),
        }
    }

    /// Method name.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Positional arguments.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Set an out-of-band attachment.
    pub fn set_attachment(&self, key: impl Into<String>, value: impl Into<String>) {
        self.attachments
            .lock()
            .unwrap()
            .insert(key.into(), value.into());
    }

    /// Read an attachment by key.
    pub fn attachment(&self, key: &str) -> Option<String> {
        self.attachments.lock().unwrap().get(key).cloned()
    }

    /// Snapshot of all attachments.
    pub fn attachments(&self) -> HashMap<String, String> {
        self.attachments.lock().unwrap().clone()
    }

    /// Record that `invoker` has been attempted for this call.
    pub fn add_invoked(&self, invoker: Arc<dyn Invoker>) {
        self.invoked.lock().unwrap().push(invoker);
    }

    /// Snapshot of every endpoint attempted so far.
    pub fn invoked(&self) -> Vec<Arc<dyn Invoker>> {
        self.invoked.lock().unwrap().clone()
    }

    /// Whether the endpoint at `address` has already been attempted.
    pub fn has_invoked(&self, address: &str) -> bool {
        self.invoked
            .lock()
            .unwrap()
            .iter()
            .any(|i| i.address() == address)
    }
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("method", &self.method)
            .field("args", &self.args)
            .field("invoked", &self.invoked.lock().unwrap().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockInvoker;

    #[test]
    fn test_attachments() {
        let inv = Invocation::new("echo", vec!["hello".into()]);
        assert_eq!(inv.attachment("cluster"), None);
        inv.set_attachment("cluster", "failover");
        assert_eq!(inv.attachment("cluster").as_deref(), Some("failover"));
    }

    #[test]
    fn test_invoked_tracking() {
        let inv = Invocation::new("echo", vec![]);
        let a: Arc<dyn Invoker> = Arc::new(MockInvoker::new("a:20880"));
        assert!(!inv.has_invoked("a:20880"));
        inv.add_invoked(a);
        assert!(inv.has_invoked("a:20880"));
        assert_eq!(inv.invoked().len(), 1);
    }
}
