//! Endpoint handle contract.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Error;
use crate::invocation::Invocation;

/// A handle to one remote service instance capable of executing a call.
///
/// Implementations are owned by the directory and stay immutable for the
/// lifetime of a candidate-list snapshot. The transport behind `invoke`
/// is out of scope for this crate.
#[async_trait]
pub trait Invoker: Send + Sync {
    /// Stable identity: the remote network address.
    fn address(&self) -> &str;

    /// Whether the endpoint is currently believed reachable.
    fn is_available(&self) -> bool;

    /// Integer parameter lookup scoped by method name, with a default
    /// fallback. Used for weight, warmup, timestamp, retries, timeout.
    fn param(&self, method: &str, key: &str, default: i64) -> i64 {
        let _ = (method, key);
        default
    }

    /// Execute the call against this endpoint.
    async fn invoke(&self, invocation: &Invocation) -> Result<Response, Error>;
}

/// Result value of a successful invocation.
#[derive(Debug, Clone, Default)]
pub struct Response {
    value: Option<Vec<u8>>,
    attachments: HashMap<String, String>,
}

impl Response {
    /// A response carrying a payload.
    pub fn new(value: Vec<u8>) -> Self {
        Self {
            value: Some(value),
            attachments: HashMap::new(),
        }
    }

    /// An empty response, used by fail-safe and fail-back when the
    /// failure is swallowed.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Payload, if any.
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    /// Attach an out-of-band key/value to the response.
    pub fn set_attachment(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attachments.insert(key.into(), value.into());
    }

    /// Read a response attachment.
    pub fn attachment(&self, key: &str) -> Option<&str> {
        self.attachments.get(key).map(|s| s.as_str())
    }

    /// All response attachments.
    pub fn attachments(&self) -> &HashMap<String, String> {
        &self.attachments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_response_has_no_value() {
        let resp = Response::empty();
        assert!(resp.value().is_none());
        assert!(resp.attachments().is_empty());
    }

    #[test]
    fn test_response_attachments() {
        let mut resp = Response::new(b"ok".to_vec());
        resp.set_attachment("broadcast.a:1", "ok");
        assert_eq!(resp.value(), Some(&b"ok"[..]));
        assert_eq!(resp.attachment("broadcast.a:1"), Some("ok"));
    }
}
