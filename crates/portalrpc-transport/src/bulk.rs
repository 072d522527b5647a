//! Bulk payload side channel.
//!
//! A bulk transfer moves a payload too large for the control exchange. It is
//! correlated with its request by transaction id, which travels as match bits on
//! the bulk portal. The source blocks until the sink acknowledged delivery; the
//! sink completes on a single deposit.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::deadline::{self, Deadline};
use crate::dispatch::QueueKind;
use crate::error::{Result, RpcError};
use crate::fabric::{EventKind, InsertPosition, MdHandle, Nid, Portal, RecvSpec, Region, SendSpec, Threshold};
use crate::transport::Transport;

/// Which side of a bulk transfer this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkRole {
    /// Pushes the payload.
    Source,
    /// Receives the payload.
    Sink,
}

/// Progress of a bulk transfer as seen by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkProgress {
    /// Descriptor posted, nothing observed yet.
    Posted,
    /// Source side: the payload left the node.
    Sent,
    /// Source side: the sink acknowledged the payload.
    Acked {
        /// Bytes the sink accepted.
        len: usize,
    },
    /// Sink side: the payload landed.
    Delivered {
        /// Bytes deposited.
        len: usize,
        /// Bytes the source pushed.
        sent: usize,
    },
    /// The fabric reported an error.
    Failed {
        /// Fabric error code.
        code: i32,
    },
    /// The waiter gave up.
    Aborted,
}

impl BulkProgress {
    fn is_terminal(&self) -> bool {
        !matches!(self, BulkProgress::Posted | BulkProgress::Sent)
    }
}

#[derive(Debug)]
pub(crate) struct BulkState {
    xid: u64,
    role: BulkRole,
    progress: watch::Sender<BulkProgress>,
    // Source side: an Ack that arrived before its Sent, held until the Sent lands.
    early_ack: Mutex<Option<usize>>,
}

impl BulkState {
    pub(crate) fn new(xid: u64, role: BulkRole) -> Arc<Self> {
        let (progress, _) = watch::channel(BulkProgress::Posted);
        Arc::new(Self {
            xid,
            role,
            progress,
            early_ack: Mutex::new(None),
        })
    }

    pub(crate) fn xid(&self) -> u64 {
        self.xid
    }

    pub(crate) fn role(&self) -> BulkRole {
        self.role
    }

    pub(crate) fn progress(&self) -> BulkProgress {
        *self.progress.borrow()
    }

    /// Records a source-side event. The source completes only once both its Sent
    /// and its Ack were seen, in either order. Returns whether anything changed.
    pub(crate) fn record_source(&self, kind: EventKind, status: i32, len: usize) -> bool {
        if status != 0 {
            return self.advance(BulkProgress::Failed { code: status });
        }
        let mut early_ack = self
            .early_ack
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match (kind, self.progress()) {
            (EventKind::Sent, BulkProgress::Posted) => match early_ack.take() {
                Some(len) => self.advance(BulkProgress::Acked { len }),
                None => self.advance(BulkProgress::Sent),
            },
            (EventKind::Ack, BulkProgress::Sent) => self.advance(BulkProgress::Acked { len }),
            (EventKind::Ack, BulkProgress::Posted) if early_ack.is_none() => {
                *early_ack = Some(len);
                true
            }
            _ => false,
        }
    }

    /// Applies `next` unless the transfer already finished. Returns whether it changed.
    pub(crate) fn advance(&self, next: BulkProgress) -> bool {
        self.progress.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                return false;
            }
            *current = next;
            true
        })
    }
}

/// One bulk transfer bound to a request.
#[derive(Debug)]
pub struct BulkTransfer {
    role: BulkRole,
    xid: u64,
    region: Region,
    md: Option<MdHandle>,
    token: Option<u64>,
    state: Arc<BulkState>,
}

impl BulkTransfer {
    /// Allocates a sink buffer of `len` bytes; nothing is posted yet.
    pub fn sink(xid: u64, len: usize) -> Result<Self> {
        Ok(Self {
            role: BulkRole::Sink,
            xid,
            region: Region::allocate(len, "bulk sink buffer")?,
            md: None,
            token: None,
            state: BulkState::new(xid, BulkRole::Sink),
        })
    }

    /// Role of this transfer.
    pub fn role(&self) -> BulkRole {
        self.role
    }

    /// Transaction id the transfer is correlated with.
    pub fn xid(&self) -> u64 {
        self.xid
    }

    /// Size of the backing buffer.
    pub fn len(&self) -> usize {
        self.region.len()
    }

    /// True for an empty buffer.
    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    /// Current progress.
    pub fn progress(&self) -> BulkProgress {
        self.state.progress()
    }

    /// Descriptor currently linked for this transfer.
    pub fn descriptor(&self) -> Option<MdHandle> {
        self.md
    }

    /// Posts the sink descriptor on `portal`, matching this transfer's xid.
    pub(crate) fn post(&mut self, transport: &Transport, portal: Portal) -> Result<()> {
        if self.md.is_some() {
            return Err(RpcError::invalid("bulk sink already posted"));
        }
        let token = transport.dispatcher().track_bulk_sink(Arc::clone(&self.state));
        let spec = RecvSpec {
            portal,
            match_bits: self.xid,
            ignore_bits: 0,
            region: self.region.clone(),
            threshold: Threshold::Count(1),
            queue: QueueKind::BulkSink,
            token,
            position: InsertPosition::Back,
            manage_offset: false,
        };
        match transport.fabric().post_receive(spec) {
            Ok(md) => {
                debug!(xid = self.xid, %md, portal, "bulk sink posted");
                self.md = Some(md);
                self.token = Some(token);
                Ok(())
            }
            Err(e) => {
                transport.dispatcher().retire_bulk_sink(token);
                Err(e)
            }
        }
    }

    /// Unlinks the sink descriptor if it is still linked. Idempotent.
    pub(crate) fn abort(&mut self, transport: &Transport) {
        self.state.advance(BulkProgress::Aborted);
        if let Some(md) = self.md.take() {
            if let Err(e) = transport.fabric().unlink(md) {
                debug!(xid = self.xid, %md, error = %e, "bulk sink already unlinked");
            }
        }
        if let Some(token) = self.token.take() {
            transport.dispatcher().retire_bulk_sink(token);
        }
    }

    /// Waits for the single deposit into this sink and returns the payload.
    pub async fn receive_as_sink(
        &mut self,
        transport: &Transport,
        cancel: &CancelToken,
    ) -> Result<Bytes> {
        self.receive_within(transport, cancel, None).await
    }

    /// Like [`BulkTransfer::receive_as_sink`], but gives up with
    /// [`RpcError::BulkTimeout`] once `deadline` passes. The sink is unlinked on
    /// every outcome other than delivery.
    pub async fn receive_within(
        &mut self,
        transport: &Transport,
        cancel: &CancelToken,
        deadline: Option<Deadline>,
    ) -> Result<Bytes> {
        let mut rx = self.state.progress.subscribe();
        let outcome = tokio::select! {
            biased;
            res = rx.wait_for(|p| p.is_terminal()) => res.map(|p| *p).map_err(|_| RpcError::Shutdown),
            reason = cancel.cancelled() => Err(RpcError::Cancelled(reason)),
            _ = deadline::expire(deadline) => Err(RpcError::BulkTimeout {
                xid: self.xid,
                timeout_ms: deadline.map(|d| d.timeout_ms()).unwrap_or_default(),
            }),
        };
        match outcome {
            Ok(BulkProgress::Delivered { len, sent }) => {
                self.md = None;
                if let Some(token) = self.token.take() {
                    transport.dispatcher().retire_bulk_sink(token);
                }
                if len < sent {
                    return Err(RpcError::TruncatedReply {
                        xid: self.xid,
                        received: len,
                        sent,
                    });
                }
                let data = self.region.read_at(0, len).ok_or(RpcError::Unpack {
                    what: "bulk payload",
                    reason: format!("{len} bytes do not fit a {} byte sink", self.len()),
                })?;
                transport.metrics().add_bulk_bytes_received(len);
                Ok(Bytes::from(data))
            }
            Ok(BulkProgress::Failed { code }) => {
                self.abort(transport);
                Err(RpcError::Transport {
                    op: "bulk receive",
                    code,
                })
            }
            Ok(BulkProgress::Aborted) => {
                self.abort(transport);
                Err(RpcError::invalid(format!(
                    "bulk transfer for xid {} was aborted",
                    self.xid
                )))
            }
            Ok(other) => {
                self.abort(transport);
                Err(RpcError::invalid(format!("bulk sink ended as {other:?}")))
            }
            Err(e) => {
                self.abort(transport);
                match &e {
                    RpcError::Cancelled(_) => transport.metrics().inc_cancelled(),
                    RpcError::BulkTimeout { timeout_ms, .. } => {
                        warn!(xid = self.xid, timeout_ms, "no bulk payload before the deadline");
                        transport.metrics().inc_timeouts();
                    }
                    _ => {}
                }
                Err(e)
            }
        }
    }

    pub(crate) fn deposit_local(&self, payload: &[u8]) -> Result<usize> {
        if payload.len() > self.region.len() {
            self.state.advance(BulkProgress::Delivered {
                len: self.region.len(),
                sent: payload.len(),
            });
            return Err(RpcError::TruncatedReply {
                xid: self.xid,
                received: self.region.len(),
                sent: payload.len(),
            });
        }
        self.region.write_at(0, payload);
        self.state.advance(BulkProgress::Delivered {
            len: payload.len(),
            sent: payload.len(),
        });
        Ok(payload.len())
    }
}

impl Drop for BulkTransfer {
    fn drop(&mut self) {
        if self.md.is_some() {
            warn!(xid = self.xid, role = ?self.role, "bulk transfer dropped while its descriptor is linked");
        }
    }
}

/// Where a bulk source pushes its payload.
#[derive(Debug)]
pub enum BulkEndpoint<'a> {
    /// A sink in the same execution context: the payload is copied directly.
    Local(&'a BulkTransfer),
    /// A sink on another node.
    Remote {
        /// Node holding the sink.
        nid: Nid,
        /// Bulk portal on that node.
        portal: Portal,
    },
}

impl Transport {
    /// Pushes `payload` to the sink for `xid` and waits for its acknowledgement.
    ///
    /// Returns the number of bytes the sink accepted. A payload that left the node
    /// but was never acknowledged before `ack_timeout` yields
    /// [`RpcError::UnacknowledgedBulk`].
    pub async fn send_as_source(
        &self,
        xid: u64,
        to: BulkEndpoint<'_>,
        payload: Vec<u8>,
        cancel: &CancelToken,
        ack_timeout: Duration,
    ) -> Result<usize> {
        let (nid, portal) = match to {
            BulkEndpoint::Local(sink) => {
                if sink.role() != BulkRole::Sink || sink.xid() != xid {
                    return Err(RpcError::invalid(format!(
                        "local bulk endpoint is not the sink of xid {xid}"
                    )));
                }
                let len = sink.deposit_local(&payload)?;
                self.metrics().add_bulk_bytes_sent(len);
                debug!(xid, len, "bulk payload copied locally");
                return Ok(len);
            }
            BulkEndpoint::Remote { nid, portal } => (nid, portal),
        };

        self.ensure_running()?;
        let len = payload.len();
        let state = BulkState::new(xid, BulkRole::Source);
        let mut rx = state.progress.subscribe();
        let token = self.dispatcher().track_bulk_source(Arc::clone(&state));
        let spec = SendSpec {
            region: Region::from_vec(payload),
            dest: nid,
            portal,
            match_bits: xid,
            ack: true,
            queue: QueueKind::BulkSource,
            token,
        };
        let md = match self.fabric().send(spec) {
            Ok(md) => md,
            Err(e) => {
                self.dispatcher().retire_bulk_source(token);
                return Err(e);
            }
        };
        debug!(xid, %md, len, dest = nid, portal, "bulk source posted");

        let deadline = Deadline::after(ack_timeout);
        let outcome = tokio::select! {
            biased;
            res = rx.wait_for(|p| p.is_terminal()) => res.map(|p| *p).map_err(|_| RpcError::Shutdown),
            reason = cancel.cancelled() => Err(RpcError::Cancelled(reason)),
            _ = deadline::expire(Some(deadline)) => Err(RpcError::UnacknowledgedBulk {
                xid,
                sent: state.progress() == BulkProgress::Sent,
            }),
        };

        let result = match outcome {
            Ok(BulkProgress::Acked { len }) => {
                self.metrics().add_bulk_bytes_sent(len);
                Ok(len)
            }
            Ok(BulkProgress::Failed { code }) => Err(RpcError::Transport {
                op: "bulk send",
                code,
            }),
            Ok(other) => Err(RpcError::invalid(format!("bulk source ended as {other:?}"))),
            Err(e) => {
                state.advance(BulkProgress::Aborted);
                // The descriptor may still be waiting for an ack that will never come.
                if let Err(unlink_err) = self.fabric().unlink(md) {
                    debug!(xid, %md, error = %unlink_err, "bulk source already unlinked");
                }
                match &e {
                    RpcError::UnacknowledgedBulk { .. } => {
                        warn!(xid, len, "bulk payload was never acknowledged");
                        self.metrics().inc_bulk_unacknowledged();
                    }
                    RpcError::Cancelled(_) => self.metrics().inc_cancelled(),
                    _ => {}
                }
                Err(e)
            }
        };
        self.dispatcher().retire_bulk_source(token);
        result
    }

    /// Posts a sink for `xid` on `portal`.
    pub fn post_sink(&self, xid: u64, portal: Portal, len: usize) -> Result<BulkTransfer> {
        self.ensure_running()?;
        let mut sink = BulkTransfer::sink(xid, len)?;
        sink.post(self, portal)?;
        Ok(sink)
    }

    /// Posts a sink for `xid` and waits for the payload.
    pub async fn receive_as_sink(
        &self,
        xid: u64,
        portal: Portal,
        len: usize,
        cancel: &CancelToken,
    ) -> Result<Bytes> {
        let mut sink = self.post_sink(xid, portal, len)?;
        sink.receive_as_sink(self, cancel).await
    }
}
