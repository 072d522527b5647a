//! One client-initiated RPC exchange and its completion state.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use crate::bulk::BulkTransfer;
use crate::error::RpcError;
use crate::fabric::{MdHandle, Region};
use crate::transport::Transport;

/// Why an exchange failed inside the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// The fabric reported an error for one of the exchange's descriptors.
    Transport {
        /// Operation that failed.
        op: &'static str,
        /// Fabric error code.
        code: i32,
    },
    /// The reply did not fit the reply buffer.
    Truncated {
        /// Bytes that fit.
        received: usize,
        /// Bytes the responder sent.
        sent: usize,
    },
}

impl Failure {
    pub(crate) fn into_error(self, xid: u64) -> RpcError {
        match self {
            Failure::Transport { op, code } => RpcError::Transport { op, code },
            Failure::Truncated { received, sent } => RpcError::TruncatedReply {
                xid,
                received,
                sent,
            },
        }
    }
}

/// Completion state of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// Created or in flight.
    Pending,
    /// The reply landed in the reply buffer.
    Replied {
        /// Offset of the reply in the reply buffer.
        offset: usize,
        /// Reply length.
        len: usize,
    },
    /// The dispatcher recorded a failure.
    Failed(Failure),
    /// The initiator gave up on the exchange.
    Aborted,
}

impl ExchangeState {
    /// Terminal states never change again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExchangeState::Pending)
    }
}

/// Completion state shared between the waiting initiator and the dispatcher.
///
/// The dispatcher is the only writer while the exchange is in flight; the waiter
/// only reads. A state leaves `Pending` at most once.
#[derive(Debug)]
pub(crate) struct Exchange {
    xid: u64,
    state: watch::Sender<ExchangeState>,
}

impl Exchange {
    pub(crate) fn new(xid: u64) -> Arc<Self> {
        let (state, _) = watch::channel(ExchangeState::Pending);
        Arc::new(Self { xid, state })
    }

    pub(crate) fn xid(&self) -> u64 {
        self.xid
    }

    pub(crate) fn state(&self) -> ExchangeState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ExchangeState> {
        self.state.subscribe()
    }

    /// Moves a pending exchange to `next` and wakes the waiter.
    /// Returns `false` without any effect if the exchange already finished.
    pub(crate) fn finish(&self, next: ExchangeState) -> bool {
        self.state.send_if_modified(|current| {
            if current.is_terminal() {
                return false;
            }
            *current = next;
            true
        })
    }
}

/// A request prepared by [`crate::client::RpcClient::create`].
///
/// The request owns its reply buffer and, once dispatched, everything dispatch
/// posted for it. Dropping an in-flight request unlinks its descriptors and
/// retires its dispatcher entries, so a `wait` future dropped by `select!` or
/// `tokio::time::timeout` leaks nothing.
#[derive(Debug)]
pub struct Request {
    pub(crate) xid: u64,
    pub(crate) opcode: u32,
    pub(crate) payload: Vec<u8>,
    pub(crate) request_len: usize,
    pub(crate) reply_capacity: usize,
    pub(crate) reply_region: Option<Region>,
    pub(crate) reply_md: Option<MdHandle>,
    pub(crate) reply_token: Option<u64>,
    pub(crate) bulk_sink: Option<BulkTransfer>,
    pub(crate) send_token: Option<u64>,
    pub(crate) exchange: Arc<Exchange>,
    pub(crate) dispatched: bool,
    pub(crate) transport: Option<Arc<Transport>>,
}

impl Request {
    pub(crate) fn new(xid: u64, opcode: u32, payload: Vec<u8>, reply_capacity: usize) -> Self {
        Self {
            xid,
            opcode,
            request_len: payload.len(),
            payload,
            reply_capacity,
            reply_region: None,
            reply_md: None,
            reply_token: None,
            bulk_sink: None,
            send_token: None,
            exchange: Exchange::new(xid),
            dispatched: false,
            transport: None,
        }
    }

    /// Transaction id.
    pub fn xid(&self) -> u64 {
        self.xid
    }

    /// Operation code.
    pub fn opcode(&self) -> u32 {
        self.opcode
    }

    /// Length of the packed request.
    pub fn request_len(&self) -> usize {
        self.request_len
    }

    /// Size of the reply buffer, fixed at creation.
    pub fn reply_capacity(&self) -> usize {
        self.reply_capacity
    }

    /// Current completion state.
    pub fn state(&self) -> ExchangeState {
        self.exchange.state()
    }

    /// True once the request has been handed to a destination.
    pub fn is_dispatched(&self) -> bool {
        self.dispatched
    }

    /// Descriptor of the posted reply buffer, if one is linked.
    pub fn reply_descriptor(&self) -> Option<MdHandle> {
        self.reply_md
    }

    /// The reply buffer, while the request still holds it.
    pub fn reply_buffer(&self) -> Option<&Region> {
        self.reply_region.as_ref()
    }

    /// The bulk sink attached to this request, if any.
    pub fn bulk_sink(&self) -> Option<&BulkTransfer> {
        self.bulk_sink.as_ref()
    }

    /// Attaches a bulk sink of `len` bytes. It is posted by dispatch, before the
    /// request itself is sent.
    pub fn attach_bulk_sink(&mut self, len: usize) -> crate::error::Result<()> {
        if self.dispatched {
            return Err(RpcError::invalid("bulk sink must be attached before dispatch"));
        }
        if self.bulk_sink.is_some() {
            return Err(RpcError::invalid("request already carries a bulk sink"));
        }
        self.bulk_sink = Some(BulkTransfer::sink(self.xid, len)?);
        Ok(())
    }
}

impl Request {
    /// Aborts the exchange, unlinks the reply and bulk descriptors and retires
    /// every dispatcher entry the request still owns. Idempotent.
    pub(crate) fn teardown(&mut self) {
        self.exchange.finish(ExchangeState::Aborted);
        self.reply_region = None;
        let Some(transport) = self.transport.clone() else {
            return;
        };
        if let Some(md) = self.reply_md.take() {
            match transport.fabric().unlink(md) {
                Ok(()) => debug!(xid = self.xid, %md, "reply descriptor unlinked"),
                Err(e) => debug!(xid = self.xid, %md, error = %e, "reply descriptor already gone"),
            }
        }
        if let Some(token) = self.reply_token.take() {
            transport.dispatcher().retire_reply(token);
        }
        // The send descriptor unlinks itself once sent; only its entry is ours.
        if let Some(token) = self.send_token.take() {
            transport.dispatcher().retire_send(token);
        }
        if let Some(sink) = self.bulk_sink.as_mut() {
            sink.abort(&transport);
        }
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if self.reply_md.is_some() || self.reply_token.is_some() {
            debug!(xid = self.xid, "request dropped in flight");
        }
        self.teardown();
    }
}
