//! Metric handles for both components.
//!
//! Handles are bound once at construction and updated from inside the
//! facades; recorder installation is the embedding application's business.

use metrics::{counter, gauge, Counter, Gauge};

/// Metrics for the transaction request scheduler.
pub(crate) struct SchedulerMetrics {
    /// Number of announcements currently tracked, across all peers.
    pub(crate) tracked_announcements: Gauge,
    /// Number of requests currently in flight, across all peers.
    pub(crate) inflight_requests: Gauge,
    /// Total number of in-flight requests that hit their expiry.
    pub(crate) expired_requests: Counter,
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self {
            tracked_announcements: gauge!("txrelay_scheduler_tracked_announcements"),
            inflight_requests: gauge!("txrelay_scheduler_inflight_requests"),
            expired_requests: counter!("txrelay_scheduler_expired_requests"),
        }
    }
}

/// Metrics for the reconciliation tracker.
pub(crate) struct ReconciliationMetrics {
    /// Number of peers currently registered for reconciliation.
    pub(crate) registered_peers: Gauge,
    /// Total number of reconciliation rounds we initiated.
    pub(crate) initiated_rounds: Counter,
    /// Total number of sketches sent in response to peer-initiated rounds.
    pub(crate) sketches_sent: Counter,
}

impl Default for ReconciliationMetrics {
    fn default() -> Self {
        Self {
            registered_peers: gauge!("txrelay_recon_registered_peers"),
            initiated_rounds: counter!("txrelay_recon_initiated_rounds"),
            sketches_sent: counter!("txrelay_recon_sketches_sent"),
        }
    }
}
