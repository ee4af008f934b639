//! Control-plane tuning knobs

use std::time::Duration;

/// Runtime configuration for the control plane
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Lifetime of a freshly issued registration token
    pub token_ttl: Duration,
    /// Connected agents silent for longer than this are marked disconnected
    pub liveness_threshold: Duration,
    /// Period of the staleness sweep
    pub sweep_interval: Duration,
    /// Per-observer queue bound; overflowing it disconnects the observer
    pub observer_queue_capacity: usize,
    /// Lifetime of agent credentials
    pub credential_validity: Duration,
    /// Metric samples older than this are pruned by the sweeper
    pub metrics_retention: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            token_ttl: Duration::from_secs(24 * 3600),
            // three missed 30 s heartbeats
            liveness_threshold: Duration::from_secs(90),
            sweep_interval: Duration::from_secs(30),
            observer_queue_capacity: 256,
            credential_validity: Duration::from_secs(3650 * 24 * 3600),
            metrics_retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// std -> chrono, saturating on absurd values
pub(crate) fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365 * 1000))
}
