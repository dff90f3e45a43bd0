//! Readiness probing for the gateway
//!
//! The gateway counts as ready as soon as any candidate path answers with any
//! HTTP status. This is a liveness check, not an application health check.

use crate::pool::{GatewayClient, ProbeOutcome};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Outcome of one pass over the candidate paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sweep {
    /// This path answered
    Ready(String),
    /// No path answered; the first non-refused error, if any
    NotReady(Option<String>),
}

pub struct HealthProbe {
    client: Arc<GatewayClient>,
    paths: Vec<String>,
    interval: Duration,
    probe_timeout: Duration,
}

impl HealthProbe {
    pub fn new(
        client: Arc<GatewayClient>,
        paths: Vec<String>,
        interval: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            client,
            paths,
            interval,
            probe_timeout,
        }
    }

    /// Probe each path in order, stopping at the first that answers
    pub async fn sweep(&self, probe_timeout: Duration) -> Sweep {
        let mut first_error = None;

        for path in &self.paths {
            match self.client.probe(path, probe_timeout).await {
                ProbeOutcome::Responded(status) => {
                    debug!(path, %status, "Gateway answered probe");
                    return Sweep::Ready(path.clone());
                }
                ProbeOutcome::Refused => {}
                ProbeOutcome::Failed(e) => {
                    first_error.get_or_insert(format!("{}: {}", path, e));
                }
            }
        }

        Sweep::NotReady(first_error)
    }

    /// Sweep until the gateway answers or `budget` runs out.
    ///
    /// Returns `false` on timeout; retrying is the caller's decision.
    pub async fn wait_for_ready(&self, budget: Duration) -> bool {
        let start = Instant::now();

        while start.elapsed() < budget {
            let remaining = budget.saturating_sub(start.elapsed());
            match self.sweep(self.probe_timeout.min(remaining)).await {
                Sweep::Ready(path) => {
                    info!(
                        path,
                        waited_ms = start.elapsed().as_millis() as u64,
                        "Gateway is ready"
                    );
                    return true;
                }
                Sweep::NotReady(Some(e)) => {
                    warn!(error = %e, "Gateway health check error");
                }
                Sweep::NotReady(None) => {}
            }

            let remaining = budget.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(self.interval.min(remaining)).await;
        }

        error!(budget_secs = budget.as_secs(), "Gateway failed to become ready in time");
        false
    }
}
