//! Acknowledge failures immediately, retry in the background.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::time::DelayQueue;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::invocation::Invocation;
use crate::invoker::{Invoker, Response};

use super::{ClusterCore, ClusterInvoker, CLUSTER_ATTACHMENT_KEY};

/// A failed call scheduled for background retry.
struct RetryTask {
    invocation: Arc<Invocation>,
    /// Endpoint that failed last, excluded from the next selection.
    last: Arc<dyn Invoker>,
    remaining: u32,
}

/// Returns an empty response on failure and keeps retrying in the
/// background until the budget runs out. Business errors still propagate:
/// the call was executed and rejected, so replaying it cannot help.
pub struct Failback {
    core: Arc<ClusterCore>,
    /// Lazily created on the first failure so clusters that never fail
    /// never spawn the worker.
    sender: Mutex<Option<mpsc::UnboundedSender<RetryTask>>>,
    shutdown: watch::Sender<bool>,
}

impl Failback {
    pub fn new(core: Arc<ClusterCore>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            core,
            sender: Mutex::new(None),
            shutdown,
        }
    }

    fn enqueue(&self, invocation: Arc<Invocation>, last: Arc<dyn Invoker>) {
        let task = RetryTask {
            invocation,
            last,
            remaining: self.core.config().failback_budget(),
        };

        let mut sender = self.sender.lock().unwrap();
        let tx = sender.get_or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let core = self.core.clone();
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(retry_worker(core, rx, shutdown));
            debug!("failback retry worker started");
            tx
        });
        // the worker only stops at destroy; a send error then is moot
        let _ = tx.send(task);
    }
}

#[async_trait]
impl ClusterInvoker for Failback {
    fn name(&self) -> &'static str {
        "failback"
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

        match self.core.invoke_with_stats(&invoker, &invocation).await {
            Ok(response) => Ok(response),
            Err(err) if err.is_business() => Err(err),
            Err(err) => {
                warn!(
                    endpoint = %invoker.address(),
                    method = invocation.method(),
                    error = %err,
                    "invocation failed, scheduling background retry"
                );
                self.enqueue(invocation, invoker);
                Ok(Response::empty())
            }
        }
    }

    fn is_available(&self) -> bool {
        self.core.is_available()
    }

    fn destroy(&self) {
        let _ = self.shutdown.send(true);
        self.core.destroy();
    }
}

/// Drains scheduled retries. Owns the delay queue; new tasks arrive over
/// the channel and failed retries are requeued until their budget is
/// spent.
async fn retry_worker(
    core: Arc<ClusterCore>,
    mut rx: mpsc::UnboundedReceiver<RetryTask>,
    mut shutdown: watch::Receiver<bool>,
) {
    let delay = core.config().failback_delay;
    let mut queue: DelayQueue<RetryTask> = DelayQueue::new();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                debug!(pending = queue.len(), "failback retry worker stopping");
                break;
            }

            task = rx.recv() => match task {
                Some(task) => {
                    queue.insert(task, delay);
                }
                None => break,
            },

            expired = futures::future::poll_fn(|cx| queue.poll_expired(cx)),
                if !queue.is_empty() =>
            {
                if let Some(expired) = expired {
                    let task = expired.into_inner();
                    if let Some(task) = retry_once(&core, task).await {
                        queue.insert(task, delay);
                    }
                }
            }
        }
    }
}

/// One retry attempt. Returns the task again if it should be rescheduled.
async fn retry_once(core: &Arc<ClusterCore>, mut task: RetryTask) -> Option<RetryTask> {
    let invocation = &task.invocation;
    let method = invocation.method();

    let invokers = core.list(invocation);
    // exclude only the endpoint that failed last; earlier attempts may
    // have recovered since
    let selected = [task.last.clone()];
    let invoker = match core.select(invocation, &invokers, &selected) {
        Some(invoker) => invoker,
        None => {
            warn!(method, "no candidates for background retry");
            task.remaining = task.remaining.saturating_sub(1);
            return (task.remaining > 0).then_some(task);
        }
    };

    match core.invoke_with_stats(&invoker, invocation).await {
        Ok(_) => {
            info!(endpoint = %invoker.address(), method, "background retry succeeded");
            None
        }
        Err(err) => {
            task.remaining = task.remaining.saturating_sub(1);
            if task.remaining == 0 {
                error!(
                    endpoint = %invoker.address(),
                    method,
                    error = %err,
                    "background retry budget exhausted, abandoning call"
                );
                None
            } else {
                warn!(
                    endpoint = %invoker.address(),
                    method,
                    remaining = task.remaining,
                    error = %err,
                    "background retry failed, rescheduling"
                );
                task.last = invoker;
                Some(task)
            }
        }
    }
}
