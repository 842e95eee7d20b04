//! Retry failed calls on other endpoints.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::config::RETRIES_KEY;
use crate::error::Error;
use crate::invocation::Invocation;
use crate::invoker::Response;

use super::{ClusterCore, ClusterInvoker, CLUSTER_ATTACHMENT_KEY};

/// Retries a failed call on endpoints not yet tried, up to the configured
/// retry count. Business errors are never retried: the remote method ran
/// and rejected the call, so a retry would re-execute it.
pub struct Failover {
    core: Arc<ClusterCore>,
}

impl Failover {
    pub fn new(core: Arc<ClusterCore>) -> Self {
        Self { core }
    }
}

#[async_trait]
impl ClusterInvoker for Failover {
    fn name(&self) -> &'static str {
        "failover"
    }

    async fn invoke(&self, invocation: Arc<Invocation>) -> Result<Response, Error> {
        self.core.check_destroyed()?;
        invocation.set_attachment(CLUSTER_ATTACHMENT_KEY, self.name());

        let mut invokers = self.core.list(&invocation);
        self.core.check_candidates(&invokers, &invocation)?;

        let method = invocation.method();
        let retries = invokers[0]
            .param(method, RETRIES_KEY, self.core.config().retries as i64)
            .max(0) as u32;

        let mut last_error: Option<Error> = None;
        for attempt in 0..=retries {
            // the candidate set may have changed while we were failing;
            // re-list so a retry can reach endpoints that just joined
            if attempt > 0 {
                self.core.check_destroyed()?;
                invokers = self.core.list(&invocation);
                self.core.check_candidates(&invokers, &invocation)?;
            }

            let selected = invocation.invoked();
            let invoker = match self.core.select(&invocation, &invokers, &selected) {
                Some(invoker) => invoker,
                None => break,
            };

            match self.core.invoke_with_stats(&invoker, &invocation).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_business() => return Err(err),
                Err(err) => {
                    warn!(
                        endpoint = %invoker.address(),
                        method,
                        attempt,
                        retries,
                        error = %err,
                        "attempt failed, failing over"
                    );
                    last_error = Some(err);
                }
            }
        }

        let tried: Vec<String> = invocation
            .invoked()
            .iter()
            .map(|i| i.address().to_string())
            .collect();
        let attempts = tried.len();
        let last = last_error.unwrap_or(Error::NoCandidates {
            method: method.to_string(),
        });
        warn!(
            method,
            attempts,
            last_failed = last.address().unwrap_or("none"),
            "all attempts failed"
        );
        Err(Error::RetriesExhausted {
            method: method.to_string(),
            attempts,
            tried,
            last: Box::new(last),
        })
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

    fn failover(invokers: Vec<Arc<dyn Invoker>>, config: ClusterConfig) -> Failover {
        let directory = Arc::new(StaticDirectory::new(invokers));
        let stats = Arc::new(StatsRegistry::new());
        let lb = loadbalance::build(config.load_balance, stats.clone(), &config.tuning);
        Failover::new(Arc::new(ClusterCore::new(directory, lb, stats, config)))
    }

    #[tokio::test]
    async fn test_retries_move_to_distinct_endpoints() {
        let bad1 = Arc::new(MockInvoker::new("bad1:1").with_behavior(MockBehavior::Transport));
        let bad2 = Arc::new(MockInvoker::new("bad2:2").with_behavior(MockBehavior::Transport));
        let good = Arc::new(MockInvoker::new("good:3"));
        let cluster = failover(
            vec![bad1.clone(), bad2.clone(), good.clone()],
            ClusterConfig::default(),
        );

        let invocation = Arc::new(Invocation::new("echo", vec![]));
        let response = cluster.invoke(invocation.clone()).await.unwrap();
        assert_eq!(response.value(), Some(&b"good:3"[..]));
        // each failing endpoint tried at most once
        assert!(bad1.calls() <= 1);
        assert!(bad2.calls() <= 1);
        assert_eq!(good.calls(), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_every_endpoint_tried() {
        let invokers: Vec<Arc<MockInvoker>> = (1..=3)
            .map(|i| {
                Arc::new(
                    MockInvoker::new(format!("bad{i}:{i}"))
                        .with_behavior(MockBehavior::Transport),
                )
            })
            .collect();
        let cluster = failover(
            invokers.iter().map(|i| i.clone() as Arc<dyn Invoker>).collect(),
            ClusterConfig::default(),
        );

        let invocation = Arc::new(Invocation::new("echo", vec![]));
        let err = cluster.invoke(invocation).await.unwrap_err();
        match err {
            Error::RetriesExhausted { attempts, tried, last, .. } => {
                // retries=2 means exactly three attempts, all distinct
                assert_eq!(attempts, 3);
                let mut unique = tried.clone();
                unique.sort();
                unique.dedup();
                assert_eq!(unique.len(), 3);
                assert!(last.is_retryable());
            }
            other => panic!("expected RetriesExhausted, got {other}"),
        }
        for invoker in &invokers {
            assert_eq!(invoker.calls(), 1, "{} not tried exactly once", invoker.address());
        }
    }

    #[tokio::test]
    async fn test_business_error_is_not_retried() {
        let biz = Arc::new(MockInvoker::new("biz:1").with_behavior(MockBehavior::Business));
        let good = Arc::new(MockInvoker::new("good:2"));
        let config = ClusterConfig {
            retries: 5,
            ..ClusterConfig::default()
        };
        let cluster = failover(vec![biz.clone(), good.clone()], config);

        // pin selection to the business-failing endpoint
        good.set_available(false);
        let invocation = Arc::new(Invocation::new("echo", vec![]));
        let err = cluster.invoke(invocation).await.unwrap_err();
        assert!(err.is_business());
        assert_eq!(biz.calls(), 1);
        assert_eq!(good.calls(), 0);
    }

    #[tokio::test]
    async fn test_retries_param_overrides_config() {
        let bad = Arc::new(
            MockInvoker::new("bad:1")
                .with_behavior(MockBehavior::Transport)
                .with_param(RETRIES_KEY, 4),
        );
        let cluster = failover(vec![bad.clone()], ClusterConfig::default());

        let invocation = Arc::new(Invocation::new("echo", vec![]));
        let err = cluster.invoke(invocation).await.unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { .. }));
        assert_eq!(bad.calls(), 5);
    }

    #[tokio::test]
    async fn test_transient_failure_recovers_within_budget() {
        let flaky = Arc::new(MockInvoker::new("flaky:1").with_behavior(MockBehavior::FailTimes(2)));
        let cluster = failover(vec![flaky.clone()], ClusterConfig::default());

        let invocation = Arc::new(Invocation::new("echo", vec![]));
        let response = cluster.invoke(invocation).await.unwrap();
        assert_eq!(response.value(), Some(&b"flaky:1"[..]));
        assert_eq!(flaky.calls(), 3);
    }

    #[tokio::test]
    async fn test_empty_directory_fails_fast() {
        let cluster = failover(vec![], ClusterConfig::default());
        let invocation = Arc::new(Invocation::new("echo", vec![]));
        let err = cluster.invoke(invocation).await.unwrap_err();
        assert!(matches!(err, Error::NoCandidates { .. }));
    }

    #[tokio::test]
    async fn test_destroyed_cluster_rejects_calls() {
        let cluster = failover(
            vec![Arc::new(MockInvoker::new("a:1"))],
            ClusterConfig::default(),
        );
        cluster.destroy();
        let invocation = Arc::new(Invocation::new("echo", vec![]));
        let err = cluster.invoke(invocation).await.unwrap_err();
        assert!(matches!(err, Error::Destroyed));
    }
}
