//! Operational counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Operational metrics for monitoring hub activity.
///
/// All counters are monotonically increasing (reset only on restart).
/// Thread-safe via `AtomicU64`, no locks needed for incrementing.
#[derive(Debug, Default)]
pub struct HubMetrics {
    /// Device control connections established.
    pub connections_total: AtomicU64,
    /// Commands written to devices.
    pub commands_sent: AtomicU64,
    /// Commands that got no reply within the budget.
    pub commands_timed_out: AtomicU64,
    /// Commands answered with an error reply.
    pub commands_rejected: AtomicU64,
    /// Events received from devices.
    pub events_received: AtomicU64,
    /// Events dropped because the event sink was full.
    pub events_dropped: AtomicU64,
    /// Transfers that were received and unpacked.
    pub transfers_completed: AtomicU64,
    /// Transfers that failed.
    pub transfers_failed: AtomicU64,
    /// Archive bytes received by the transfer receiver.
    pub bytes_received: AtomicU64,
}

/// Point-in-time copy of [`HubMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// See [`HubMetrics::connections_total`].
    pub connections_total: u64,
    /// See [`HubMetrics::commands_sent`].
    pub commands_sent: u64,
    /// See [`HubMetrics::commands_timed_out`].
    pub commands_timed_out: u64,
    /// See [`HubMetrics::commands_rejected`].
    pub commands_rejected: u64,
    /// See [`HubMetrics::events_received`].
    pub events_received: u64,
    /// See [`HubMetrics::events_dropped`].
    pub events_dropped: u64,
    /// See [`HubMetrics::transfers_completed`].
    pub transfers_completed: u64,
    /// See [`HubMetrics::transfers_failed`].
    pub transfers_failed: u64,
    /// See [`HubMetrics::bytes_received`].
    pub bytes_received: u64,
}

impl HubMetrics {
    /// Increment a counter by one.
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            commands_timed_out: self.commands_timed_out.load(Ordering::Relaxed),
            commands_rejected: self.commands_rejected.load(Ordering::Relaxed),
            events_received: self.events_received.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            transfers_completed: self.transfers_completed.load(Ordering::Relaxed),
            transfers_failed: self.transfers_failed.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let m = HubMetrics::default();
        HubMetrics::incr(&m.commands_sent);
        HubMetrics::incr(&m.commands_sent);
        m.bytes_received.fetch_add(1024, Ordering::Relaxed);

        let snap = m.snapshot();
        assert_eq!(snap.commands_sent, 2);
        assert_eq!(snap.bytes_received, 1024);
        assert_eq!(snap.transfers_failed, 0);
    }
}
