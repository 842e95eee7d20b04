//! Swallow failures, return an empty response.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::error::Error;
use crate::invocation::Invocation;
use crate::invoker::Response;

use super::{ClusterCore, ClusterInvoker, CLUSTER_ATTACHMENT_KEY};

/// Single attempt; any failure is logged and converted into an empty
/// response. For fire-and-forget work (audit trails, notification fanout)
/// where the caller must never be disturbed by a downstream outage.
pub struct Failsafe {
    core: Arc<ClusterCore>,
}

impl Failsafe {
    pub fn new(core: Arc<ClusterCore>) -> Self {
        Self { core }
    }

    async fn try_invoke(&self, invocation: &Arc<Invocation>) -> Result<Response, Error> {
        self.core.check_destroyed()?;
        let invokers = self.core.list(invocation);
        self.core.check_candidates(&invokers, invocation)?;

        let invoker = self
            .core
            .select(invocation, &invokers, &[])
            .ok_or_else(|| Error::NoCandidates {
                method: invocation.method().to_string(),
            })?;
        self.core.invoke_with_stats(&invoker, invocation).await
    }
}

#[async_trait]
impl ClusterInvoker for Failsafe {
    fn name(&self) -> &'static str {
        "failsafe"
    }

    async fn invoke(&self, invocation: Arc<Invocation>) -> Result<Response, Error> {
        invocation.set_attachment(CLUSTER_ATTACHMENT_KEY, self.name());
        match self.try_invoke(&invocation).await {
            Ok(response) => Ok(response),
            Err(err) => {
                warn!(
                    method = invocation.method(),
                    error = %err,
                    "ignoring failed invocation"
                );
                Ok(Response::empty())
            }
        }
    }

    fn is_available(&self) -> bool {
        self.core.is_available()
    }

    fn destroy(&self) {
        self.core.destroy();
    }
}
