//! Bounded polling for pod readiness

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use dpu_sim_common::{Error, Result};

use crate::client::ClusterApi;

/// Time between pod listings
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Waits until every pod matching a selector reports `Ready=True`
pub struct ReadinessWaiter {
    api: Arc<dyn ClusterApi>,
    poll_interval: Duration,
}

impl ReadinessWaiter {
    /// Waiter polling every [`DEFAULT_POLL_INTERVAL`]
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self {
            api,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Poll every `interval` instead
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Wait for the pods in `namespace` matching `selector` (empty for all).
    ///
    /// At least one pod must match. Listing errors are logged and retried on
    /// the next poll. The last poll happens at the deadline, so a timeout
    /// shorter than the poll interval still gets one listing. Returns
    /// [`Error::ReadinessTimeout`] once `timeout` has elapsed.
    pub async fn wait_ready(&self, namespace: &str, selector: &str, timeout: Duration) -> Result<()> {
        info!(namespace = %namespace, selector = %selector, "Waiting for pods to be ready");
        let deadline = Instant::now() + timeout;

        loop {
            let next_poll = (Instant::now() + self.poll_interval).min(deadline);
            sleep_until(next_poll).await;

            if self.poll(namespace, selector).await {
                return Ok(());
            }
            if next_poll >= deadline {
                return Err(Error::readiness_timeout(namespace, selector, timeout));
            }
        }
    }

    async fn poll(&self, namespace: &str, selector: &str) -> bool {
        let pods = match self.api.list_pods(namespace, selector).await {
            Ok(pods) => pods,
            Err(e) => {
                warn!(namespace = %namespace, selector = %selector, error = %e, "Failed to list pods");
                return false;
            }
        };
        if pods.is_empty() {
            debug!(namespace = %namespace, selector = %selector, "No pods yet");
            return false;
        }

        let ready = pods.iter().filter(|p| p.ready).count();
        debug!(namespace = %namespace, ready, total = pods.len(), "Pod readiness");
        if ready == pods.len() {
            info!(namespace = %namespace, pods = ready, "Pods are ready");
            return true;
        }
        false
    }
}
