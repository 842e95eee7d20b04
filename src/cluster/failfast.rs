//! Fail immediately on the first error.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Error;
use crate::invocation::Invocation;
use crate::invoker::Response;

use super::{ClusterCore, ClusterInvoker, CLUSTER_ATTACHMENT_KEY};

/// Single attempt, errors propagate to the caller. Suited to
/// non-idempotent operations where a blind retry could apply the side
/// effect twice.
pub struct Failfast {
    core: Arc<ClusterCore>,
}

impl Failfast {
    pub fn new(core: Arc<ClusterCore>) -> Self {
        Self { core }
    }
}

#[async_trait]
impl ClusterInvoker for Failfast {
    fn name(&self) -> &'static str {
        "failfast"
    }

    async fn invoke(&self, invocation: Arc<Invocation>) -> Result<Response, Error> {
        self.core.check_destroyed()?;
        invocation.set_attachment(CLUSTER_ATTACHMENT_KEY, self.name());

        let invokers = self.core.list(&invocation);
        self.core.check_candidates(&invokers, &invocation)?;

        let invoker = self
            .core
            .select(&invocation, &invokers, &[])
            .ok_or_else(|| Error::NoCandidates {
                method: invocation.method().to_string(),
            })?;
        self.core.invoke_with_stats(&invoker, &invocation).await
    }

    fn is_available(&self) -> bool {
        self.core.is_available()
    }

    fn destroy(&self) {
        self.core.destroy();
    }
}
