//! Connection manager metrics

use metrics::{Counter, Gauge};

use crate::trim::TrimSkipReason;

/// Connection manager metrics
#[derive(Clone, Debug)]
pub(crate) struct ConnManagerMetrics {
    /// Live connection counter mirror
    connections: Gauge,
    /// Number of trims that ran
    trims_total: Counter,
    /// Trims skipped because another trim was in progress
    trims_in_progress_total: Counter,
    /// Trims skipped because of the silence period
    trims_silenced_total: Counter,
    /// Number of close requests issued by trims
    connections_closed_total: Counter,
    /// Number of provisional records dropped by trims
    provisional_pruned_total: Counter,
    /// Number of duplicate or stale connection notifications ignored
    stale_notifications_total: Counter,
}

impl Default for ConnManagerMetrics {
    fn default() -> Self {
        Self {
            connections: metrics::gauge!("connmgr.connections"),
            trims_total: metrics::counter!("connmgr.trims_total"),
            trims_in_progress_total: metrics::counter!(
                "connmgr.trims_skipped_total",
                "reason" => TrimSkipReason::InProgress.as_str()
            ),
            trims_silenced_total: metrics::counter!(
                "connmgr.trims_skipped_total",
                "reason" => TrimSkipReason::Silenced.as_str()
            ),
            connections_closed_total: metrics::counter!("connmgr.connections_closed_total"),
            provisional_pruned_total: metrics::counter!("connmgr.provisional_pruned_total"),
            stale_notifications_total: metrics::counter!("connmgr.stale_notifications_total"),
        }
    }
}

impl ConnManagerMetrics {
    pub(crate) fn set_connections(&self, count: usize) {
        self.connections.set(count as f64);
    }

    pub(crate) fn inc_trims(&self) {
        self.trims_total.increment(1);
    }

    pub(crate) fn inc_skipped(&self, reason: TrimSkipReason) {
        match reason {
            TrimSkipReason::InProgress => self.trims_in_progress_total.increment(1),
            TrimSkipReason::Silenced => self.trims_silenced_total.increment(1),
        }
    }

    pub(crate) fn record_trim(&self, closed: usize, pruned: usize) {
        self.connections_closed_total.increment(closed as u64);
        self.provisional_pruned_total.increment(pruned as u64);
    }

    pub(crate) fn inc_stale_notifications(&self) {
        self.stale_notifications_total.increment(1);
    }
}
