//! Completion dispatcher.
//!
//! Every descriptor is registered under a context token in the table of its queue
//! role. The event pump hands each [`CompletionEvent`] to [`Dispatcher::dispatch`],
//! which looks the token up and runs the typed handler for that role. Handlers
//! never block: they update shared state and wake whoever waits on it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::bulk::{BulkProgress, BulkState};
use crate::error::{Result, RpcError};
use crate::fabric::{CompletionEvent, EventKind, Region};
use crate::metrics::RpcMetrics;
use crate::request::{Exchange, ExchangeState, Failure};
use crate::ring::ServiceRing;

/// Role of the queue a descriptor reports its events on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueKind {
    /// Outgoing requests and service replies.
    RequestSent,
    /// Client reply buffers.
    ReplyReceived,
    /// Outgoing bulk payloads.
    BulkSource,
    /// Incoming bulk payloads.
    BulkSink,
    /// Service receive ring.
    ServerArrival,
}

/// An outgoing packet whose buffer is held until the fabric reports it sent.
#[derive(Debug)]
pub(crate) struct SendRecord {
    pub(crate) region: Region,
    pub(crate) exchange: Option<Arc<Exchange>>,
}

/// Token tables for every queue role.
pub struct Dispatcher {
    next_token: AtomicU64,
    sends: DashMap<u64, SendRecord>,
    replies: DashMap<u64, Arc<Exchange>>,
    bulk_sources: DashMap<u64, Arc<BulkState>>,
    bulk_sinks: DashMap<u64, Arc<BulkState>>,
    arrivals: DashMap<u64, (Arc<ServiceRing>, usize)>,
    metrics: Arc<RpcMetrics>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("sends", &self.sends.len())
            .field("replies", &self.replies.len())
            .field("bulk_sources", &self.bulk_sources.len())
            .field("bulk_sinks", &self.bulk_sinks.len())
            .field("arrivals", &self.arrivals.len())
            .finish()
    }
}

impl Dispatcher {
    /// Creates empty tables reporting into `metrics`.
    pub fn new(metrics: Arc<RpcMetrics>) -> Self {
        Self {
            next_token: AtomicU64::new(1),
            sends: DashMap::new(),
            replies: DashMap::new(),
            bulk_sources: DashMap::new(),
            bulk_sinks: DashMap::new(),
            arrivals: DashMap::new(),
            metrics,
        }
    }

    pub(crate) fn next_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of tokens registered across all queues.
    pub fn outstanding(&self) -> usize {
        self.sends.len()
            + self.replies.len()
            + self.bulk_sources.len()
            + self.bulk_sinks.len()
            + self.arrivals.len()
    }

    pub(crate) fn track_send(&self, region: Region, exchange: Option<Arc<Exchange>>) -> u64 {
        let token = self.next_token();
        self.sends.insert(token, SendRecord { region, exchange });
        token
    }

    pub(crate) fn retire_send(&self, token: u64) -> Option<SendRecord> {
        self.sends.remove(&token).map(|(_, record)| record)
    }

    pub(crate) fn track_reply(&self, exchange: Arc<Exchange>) -> u64 {
        let token = self.next_token();
        self.replies.insert(token, exchange);
        token
    }

    pub(crate) fn retire_reply(&self, token: u64) {
        self.replies.remove(&token);
    }

    pub(crate) fn track_bulk_source(&self, state: Arc<BulkState>) -> u64 {
        let token = self.next_token();
        self.bulk_sources.insert(token, state);
        token
    }

    pub(crate) fn retire_bulk_source(&self, token: u64) {
        self.bulk_sources.remove(&token);
    }

    pub(crate) fn track_bulk_sink(&self, state: Arc<BulkState>) -> u64 {
        let token = self.next_token();
        self.bulk_sinks.insert(token, state);
        token
    }

    pub(crate) fn retire_bulk_sink(&self, token: u64) {
        self.bulk_sinks.remove(&token);
    }

    /// Binds a token obtained from [`Dispatcher::next_token`] to a ring slot.
    pub(crate) fn track_arrival(&self, token: u64, ring: Arc<ServiceRing>, slot: usize) {
        self.arrivals.insert(token, (ring, slot));
    }

    pub(crate) fn retire_arrival(&self, token: u64) {
        self.arrivals.remove(&token);
    }

    /// Routes one completion event to the handler of its queue.
    ///
    /// An `Err` means the fabric broke its contract; the caller must not continue.
    pub fn dispatch(&self, event: &CompletionEvent) -> Result<()> {
        trace!(queue = ?event.queue, kind = ?event.kind, md = %event.md, token = event.token, "dispatching event");
        match event.queue {
            QueueKind::RequestSent => self.sent_packet(event),
            QueueKind::ReplyReceived => self.reply_received(event),
            QueueKind::BulkSource => self.bulk_source(event),
            QueueKind::BulkSink => self.bulk_sink(event),
            QueueKind::ServerArrival => self.server_arrival(event),
        }
    }

    fn stale(&self, event: &CompletionEvent) {
        self.metrics.inc_stale_events();
        warn!(
            queue = ?event.queue,
            kind = ?event.kind,
            md = %event.md,
            token = event.token,
            "ignoring event for a retired descriptor"
        );
    }

    fn sent_packet(&self, event: &CompletionEvent) -> Result<()> {
        expect_kind(event, &[EventKind::Sent])?;
        let Some(record) = self.retire_send(event.token) else {
            self.stale(event);
            return Ok(());
        };
        if event.status != 0 {
            self.metrics.inc_send_failures();
            warn!(md = %event.md, status = event.status, match_bits = event.match_bits, "send failed");
            if let Some(exchange) = &record.exchange {
                exchange.finish(ExchangeState::Failed(Failure::Transport {
                    op: "send",
                    code: event.status,
                }));
            }
        } else {
            debug!(md = %event.md, len = record.region.len(), "packet sent");
        }
        Ok(())
    }

    fn reply_received(&self, event: &CompletionEvent) -> Result<()> {
        expect_kind(event, &[EventKind::Put])?;
        let Some((_, exchange)) = self.replies.remove(&event.token) else {
            self.stale(event);
            return Ok(());
        };
        let next = if event.status != 0 {
            ExchangeState::Failed(Failure::Transport {
                op: "reply",
                code: event.status,
            })
        } else if event.is_truncated() {
            self.metrics.inc_truncated_replies();
            warn!(
                xid = exchange.xid(),
                received = event.mlength,
                sent = event.rlength,
                "reply does not fit the reply buffer"
            );
            ExchangeState::Failed(Failure::Truncated {
                received: event.mlength,
                sent: event.rlength,
            })
        } else {
            ExchangeState::Replied {
                offset: event.offset,
                len: event.mlength,
            }
        };
        if !exchange.finish(next) {
            self.stale(event);
            return Ok(());
        }
        if matches!(next, ExchangeState::Replied { .. }) {
            self.metrics.inc_replies_received();
        }
        debug!(xid = exchange.xid(), state = ?next, "reply recorded");
        Ok(())
    }

    fn bulk_source(&self, event: &CompletionEvent) -> Result<()> {
        expect_kind(event, &[EventKind::Sent, EventKind::Ack])?;
        let Some(state) = self.bulk_sources.get(&event.token).map(|s| Arc::clone(s.value())) else {
            self.stale(event);
            return Ok(());
        };
        if state.record_source(event.kind, event.status, event.mlength) {
            debug!(xid = state.xid(), role = ?state.role(), kind = ?event.kind, progress = ?state.progress(), "bulk progress");
        } else {
            self.stale(event);
        }
        Ok(())
    }

    fn bulk_sink(&self, event: &CompletionEvent) -> Result<()> {
        expect_kind(event, &[EventKind::Put])?;
        let Some((_, state)) = self.bulk_sinks.remove(&event.token) else {
            self.stale(event);
            return Ok(());
        };
        let next = if event.status != 0 {
            BulkProgress::Failed { code: event.status }
        } else {
            if event.is_truncated() {
                warn!(
                    xid = state.xid(),
                    received = event.mlength,
                    sent = event.rlength,
                    "bulk payload larger than its sink"
                );
            }
            BulkProgress::Delivered {
                len: event.mlength,
                sent: event.rlength,
            }
        };
        if state.advance(next) {
            debug!(xid = state.xid(), progress = ?next, "bulk progress");
        } else {
            self.stale(event);
        }
        Ok(())
    }

    fn server_arrival(&self, event: &CompletionEvent) -> Result<()> {
        expect_kind(event, &[EventKind::Put])?;
        let Some((ring, slot)) = self
            .arrivals
            .get(&event.token)
            .map(|entry| (Arc::clone(&entry.0), entry.1))
        else {
            self.stale(event);
            return Ok(());
        };
        ring.on_arrival(slot, event);
        Ok(())
    }
}

fn expect_kind(event: &CompletionEvent, allowed: &[EventKind]) -> Result<()> {
    if allowed.contains(&event.kind) {
        Ok(())
    } else {
        Err(RpcError::UnexpectedEvent {
            queue: event.queue,
            kind: event.kind,
        })
    }
}
