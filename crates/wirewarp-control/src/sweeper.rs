//! Periodic staleness sweep

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::locks::LockTable;
use crate::registry::AgentRegistry;
use crate::telemetry::Telemetry;

/// Background task running `MarkStale` on a fixed interval
pub struct StaleSweeper {
    registry: Arc<AgentRegistry>,
    telemetry: Arc<Telemetry>,
    locks: Arc<LockTable>,
    interval: Duration,
}

impl StaleSweeper {
    pub fn new(
        registry: Arc<AgentRegistry>,
        telemetry: Arc<Telemetry>,
        locks: Arc<LockTable>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            telemetry,
            locks,
            interval,
        }
    }

    /// One sweep: mark lapsed agents, prune old metrics and drop idle lock
    /// entries
    pub async fn sweep_once(&self) -> usize {
        let swept = match self.registry.mark_stale().await {
            Ok(ids) => ids.len(),
            Err(e) => {
                error!("Staleness sweep failed: {}", e);
                0
            }
        };
        match self.telemetry.prune().await {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "Pruned expired metric samples"),
            Err(e) => error!("Metrics pruning failed: {}", e),
        }
        self.locks.prune();
        swept
    }

    /// Run until `shutdown` is cancelled
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = self.interval.as_secs(), "Staleness sweeper started");

            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let swept = self.sweep_once().await;
                        if swept > 0 {
                            info!(count = swept, "Marked stale agents disconnected");
                        } else {
                            debug!("Staleness sweep found nothing");
                        }
                    }
                }
            }

            info!("Staleness sweeper stopped");
        })
    }
}
