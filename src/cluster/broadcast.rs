//! Invoke every endpoint in parallel.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, warn};

use crate::config::BroadcastResults;
use crate::error::Error;
use crate::invocation::Invocation;
use crate::invoker::Response;

use super::{ClusterCore, ClusterInvoker, CLUSTER_ATTACHMENT_KEY};

/// Attachment key prefix for per-endpoint broadcast outcomes.
pub const BROADCAST_RESULT_PREFIX: &str = "broadcast.result.";

/// Fans one call out to every candidate and waits for all of them. Used
/// to propagate state every endpoint must see, such as cache invalidation.
/// Any endpoint failing fails the broadcast; per-endpoint outcomes are
/// recorded in the invocation attachments either way.
pub struct Broadcast {
    core: Arc<ClusterCore>,
}

impl Broadcast {
    pub fn new(core: Arc<ClusterCore>) -> Self {
        Self { core }
    }
}

#[async_trait]
impl ClusterInvoker for Broadcast {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    async fn invoke(&self, invocation: Arc<Invocation>) -> Result<Response, Error> {
        self.core.check_destroyed()?;
        invocation.set_attachment(CLUSTER_ATTACHMENT_KEY, self.name());

        let invokers = self.core.list(&invocation);
        self.core.check_candidates(&invokers, &invocation)?;
        let total = invokers.len();
        debug!(method = invocation.method(), endpoints = total, "broadcasting");

        let (addresses, handles): (Vec<String>, Vec<_>) = invokers
            .into_iter()
            .map(|invoker| {
                let core = self.core.clone();
                let invocation = invocation.clone();
                let address = invoker.address().to_string();
                let handle = tokio::spawn(async move {
                    core.invoke_with_stats(&invoker, &invocation).await
                });
                (address, handle)
            })
            .unzip();

        let mut first_response: Option<Response> = None;
        let mut first_error: Option<(String, Error)> = None;
        let mut failed = 0usize;

        for (address, joined) in addresses.into_iter().zip(join_all(handles).await) {
            // a panicked fan-out task counts as a failure of its endpoint
            let result = joined.unwrap_or_else(|err| {
                warn!(endpoint = %address, error = %err, "broadcast task panicked");
                Err(Error::Transport {
                    address: address.clone(),
                    message: format!("fan-out task failed: {err}"),
                })
            });
            let key = format!("{BROADCAST_RESULT_PREFIX}{address}");
            match result {
                Ok(response) => {
                    invocation.set_attachment(key, "ok");
                    if first_response.is_none() {
                        first_response = Some(response);
                    }
                }
                Err(err) => {
                    invocation.set_attachment(key, err.to_string());
                    failed += 1;
                    if first_error.is_none() {
                        first_error = Some((address, err));
                    }
                }
            }
        }

        if let Some((address, first)) = first_error {
            warn!(
                method = invocation.method(),
                failed,
                total,
                "broadcast partially failed"
            );
            return Err(Error::Broadcast {
                address,
                failed,
                total,
                first: Box::new(first),
            });
        }

        match self.core.config().broadcast_results {
            BroadcastResults::First => Ok(first_response.unwrap_or_else(Response::empty)),
            // callers inspect the per-endpoint attachments instead
            BroadcastResults::All => Ok(Response::empty()),
        }
    }

    fn is_available(&self) -> bool {
        self.core.is_available()
    }

    fn destroy(&self) {
        self.core.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::directory::StaticDirectory;
    use crate::invoker::Invoker;
    use crate::loadbalance;
    use crate::mock::{MockBehavior, MockInvoker};
    use crate::stats::StatsRegistry;

    fn broadcast(invokers: Vec<Arc<dyn Invoker>>, config: ClusterConfig) -> Broadcast {
        let directory = Arc::new(StaticDirectory::new(invokers));
        let stats = Arc::new(StatsRegistry::new());
        let lb = loadbalance::build(config.load_balance, stats.clone(), &config.tuning);
        Broadcast::new(Arc::new(ClusterCore::new(directory, lb, stats, config)))
    }

    #[tokio::test]
    async fn test_every_endpoint_invoked_once() {
        let invokers: Vec<Arc<MockInvoker>> = (1..=3)
            .map(|i| Arc::new(MockInvoker::new(format!("e{i}:{i}"))))
            .collect();
        let cluster = broadcast(
            invokers.iter().map(|i| i.clone() as Arc<dyn Invoker>).collect(),
            ClusterConfig::default(),
        );

        let invocation = Arc::new(Invocation::new("flush", vec![]));
        let response = cluster.invoke(invocation.clone()).await.unwrap();
        assert!(response.value().is_some());
        for invoker in &invokers {
            assert_eq!(invoker.calls(), 1);
            let key = format!("{BROADCAST_RESULT_PREFIX}{}", invoker.address());
            assert_eq!(invocation.attachment(&key).as_deref(), Some("ok"));
        }
    }

    #[tokio::test]
    async fn test_single_failure_fails_broadcast() {
        let good = Arc::new(MockInvoker::new("good:1"));
        let bad = Arc::new(MockInvoker::new("bad:2").with_behavior(MockBehavior::Transport));
        let cluster = broadcast(vec![good.clone(), bad.clone()], ClusterConfig::default());

        let invocation = Arc::new(Invocation::new("flush", vec![]));
        let err = cluster.invoke(invocation.clone()).await.unwrap_err();
        match err {
            Error::Broadcast { address, failed, total, .. } => {
                assert_eq!(address, "bad:2");
                assert_eq!(failed, 1);
                assert_eq!(total, 2);
            }
            other => panic!("expected Broadcast error, got {other}"),
        }
        // the good endpoint was still invoked and recorded
        assert_eq!(good.calls(), 1);
        let key = format!("{BROADCAST_RESULT_PREFIX}good:1");
        assert_eq!(invocation.attachment(&key).as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn test_panicked_task_fails_broadcast() {
        let good = Arc::new(MockInvoker::new("good:1"));
        let crashing = Arc::new(MockInvoker::new("crash:2").with_behavior(MockBehavior::Panic));
        let cluster = broadcast(vec![good.clone(), crashing], ClusterConfig::default());

        let invocation = Arc::new(Invocation::new("flush", vec![]));
        let err = cluster.invoke(invocation.clone()).await.unwrap_err();
        match err {
            Error::Broadcast { address, failed, total, first } => {
                assert_eq!(address, "crash:2");
                assert_eq!(failed, 1);
                assert_eq!(total, 2);
                assert!(matches!(*first, Error::Transport { .. }));
            }
            other => panic!("expected Broadcast error, got {other}"),
        }
        // the crashed endpoint still gets an outcome attachment
        let key = format!("{BROADCAST_RESULT_PREFIX}crash:2");
        assert!(invocation.attachment(&key).is_some());
        assert_eq!(good.calls(), 1);
    }

    #[tokio::test]
    async fn test_all_mode_returns_empty_payload() {
        let config = ClusterConfig {
            broadcast_results: BroadcastResults::All,
            ..ClusterConfig::default()
        };
        let good = Arc::new(MockInvoker::new("good:1"));
        let cluster = broadcast(vec![good], config);

        let invocation = Arc::new(Invocation::new("flush", vec![]));
        let response = cluster.invoke(invocation).await.unwrap();
        assert_eq!(response.value(), None);
    }

    #[tokio::test]
    async fn test_empty_directory_is_an_error() {
        let cluster = broadcast(vec![], ClusterConfig::default());
        let invocation = Arc::new(Invocation::new("flush", vec![]));
        let err = cluster.invoke(invocation).await.unwrap_err();
        assert!(matches!(err, Error::NoCandidates { .. }));
    }
}
