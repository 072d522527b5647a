//! RPC layer metrics collection.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
/// Snapshot of RPC metrics at a point in time.
pub struct MetricsSnapshot {
    /// Requests handed to the fabric.
    pub requests_sent: u64,
    /// Requests served through the local execution path.
    pub requests_local: u64,
    /// Replies accepted by a waiting exchange.
    pub replies_received: u64,
    /// Replies sent by a service.
    pub replies_sent: u64,
    /// Exchanges ended by cancellation.
    pub cancelled: u64,
    /// Exchanges ended by a reply deadline.
    pub timeouts: u64,
    /// Replies that did not fit the reply buffer.
    pub truncated_replies: u64,
    /// Sends whose completion reported a fabric error.
    pub send_failures: u64,
    /// Events ignored because their exchange or token was already retired.
    pub stale_events: u64,
    /// Bulk payload bytes acknowledged by a sink.
    pub bulk_bytes_sent: u64,
    /// Bulk payload bytes deposited into a sink.
    pub bulk_bytes_received: u64,
    /// Bulk sources that never saw an acknowledgement.
    pub bulk_unacknowledged: u64,
    /// Requests landed in a service ring.
    pub ring_arrivals: u64,
    /// Ring slots retired because they ran low on space.
    pub ring_retirements: u64,
    /// Ring slots re-posted after draining.
    pub ring_relinks: u64,
    /// Times the ring head advanced onto an already unlinked slot.
    pub ring_saturations: u64,
}

/// Thread-safe RPC metrics collector.
#[derive(Default)]
pub struct RpcMetrics {
    requests_sent: AtomicU64,
    requests_local: AtomicU64,
    replies_received: AtomicU64,
    replies_sent: AtomicU64,
    cancelled: AtomicU64,
    timeouts: AtomicU64,
    truncated_replies: AtomicU64,
    send_failures: AtomicU64,
    stale_events: AtomicU64,
    bulk_bytes_sent: AtomicU64,
    bulk_bytes_received: AtomicU64,
    bulk_unacknowledged: AtomicU64,
    ring_arrivals: AtomicU64,
    ring_retirements: AtomicU64,
    ring_relinks: AtomicU64,
    ring_saturations: AtomicU64,
}

impl std::fmt::Debug for RpcMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl RpcMetrics {
    /// Creates a collector with every counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inc_requests_sent(&self) {
        bump(&self.requests_sent);
    }

    pub(crate) fn inc_requests_local(&self) {
        bump(&self.requests_local);
    }

    pub(crate) fn inc_replies_received(&self) {
        bump(&self.replies_received);
    }

    pub(crate) fn inc_replies_sent(&self) {
        bump(&self.replies_sent);
    }

    pub(crate) fn inc_cancelled(&self) {
        bump(&self.cancelled);
    }

    pub(crate) fn inc_timeouts(&self) {
        bump(&self.timeouts);
    }

    pub(crate) fn inc_truncated_replies(&self) {
        bump(&self.truncated_replies);
    }

    pub(crate) fn inc_send_failures(&self) {
        bump(&self.send_failures);
    }

    pub(crate) fn inc_stale_events(&self) {
        bump(&self.stale_events);
    }

    pub(crate) fn add_bulk_bytes_sent(&self, bytes: usize) {
        self.bulk_bytes_sent
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_bulk_bytes_received(&self, bytes: usize) {
        self.bulk_bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn inc_bulk_unacknowledged(&self) {
        bump(&self.bulk_unacknowledged);
    }

    pub(crate) fn inc_ring_arrivals(&self) {
        bump(&self.ring_arrivals);
    }

    pub(crate) fn inc_ring_retirements(&self) {
        bump(&self.ring_retirements);
    }

    pub(crate) fn inc_ring_relinks(&self) {
        bump(&self.ring_relinks);
    }

    pub(crate) fn inc_ring_saturations(&self) {
        bump(&self.ring_saturations);
    }

    /// Takes a snapshot of all current metric values.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            requests_local: self.requests_local.load(Ordering::Relaxed),
            replies_received: self.replies_received.load(Ordering::Relaxed),
            replies_sent: self.replies_sent.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            truncated_replies: self.truncated_replies.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            stale_events: self.stale_events.load(Ordering::Relaxed),
            bulk_bytes_sent: self.bulk_bytes_sent.load(Ordering::Relaxed),
            bulk_bytes_received: self.bulk_bytes_received.load(Ordering::Relaxed),
            bulk_unacknowledged: self.bulk_unacknowledged.load(Ordering::Relaxed),
            ring_arrivals: self.ring_arrivals.load(Ordering::Relaxed),
            ring_retirements: self.ring_retirements.load(Ordering::Relaxed),
            ring_relinks: self.ring_relinks.load(Ordering::Relaxed),
            ring_saturations: self.ring_saturations.load(Ordering::Relaxed),
        }
    }
}
