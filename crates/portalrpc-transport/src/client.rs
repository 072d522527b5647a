//! Client side of the request lifecycle.
//!
//! [`RpcClient::create`] packs a request, [`RpcClient::dispatch`] posts its reply
//! buffer (and bulk sink, if any) and then sends it, [`RpcClient::wait`] suspends
//! until the dispatcher records an outcome. [`RpcClient::abort`] tears down what
//! dispatch posted and may be called at any point.

use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::cancel::{CancelReason, CancelToken};
use crate::config::{ClientConfig, PeerChannels};
use crate::deadline::{self, Deadline};
use crate::dispatch::QueueKind;
use crate::error::{Result, RpcError};
use crate::fabric::{InsertPosition, RecvSpec, Region, SendSpec, Threshold};
use crate::message::{BincodeMarshal, Marshal, MessageHeader, Reply};
use crate::request::{ExchangeState, Failure, Request};
use crate::transport::Transport;

/// Serves requests addressed to the local node without touching the fabric.
pub trait LocalHandler: Send + Sync {
    /// Handles one packed request and returns the packed reply.
    fn handle(&self, header: &MessageHeader, request: &[u8]) -> Result<Vec<u8>>;

    /// Produces the bulk payload for a request that carries a bulk sink. It is
    /// copied straight into the sink. `None` means the operation moves no bulk
    /// data, and the sink is aborted.
    fn handle_bulk(&self, header: &MessageHeader, request: &[u8]) -> Result<Option<Vec<u8>>> {
        let _ = (header, request);
        Ok(None)
    }
}

/// Where a request is executed.
#[derive(Clone)]
pub enum Destination {
    /// Same execution context: the handler is called directly.
    Local(Arc<dyn LocalHandler>),
    /// Another node, reached through the fabric.
    Remote(PeerChannels),
}

impl std::fmt::Debug for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::Local(_) => f.write_str("Local"),
            Destination::Remote(peer) => f.debug_tuple("Remote").field(peer).finish(),
        }
    }
}

enum Outcome {
    Done(ExchangeState),
    Cancelled(CancelReason),
    TimedOut,
}

/// Issues requests over a [`Transport`].
pub struct RpcClient<M: Marshal = BincodeMarshal> {
    transport: Arc<Transport>,
    marshal: M,
    config: ClientConfig,
}

impl<M: Marshal> std::fmt::Debug for RpcClient<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("transport", &self.transport)
            .field("config", &self.config)
            .finish()
    }
}

impl RpcClient<BincodeMarshal> {
    /// Creates a client using the bincode marshal.
    pub fn new(transport: Arc<Transport>, config: ClientConfig) -> Self {
        Self::with_marshal(transport, config, BincodeMarshal)
    }
}

impl<M: Marshal> RpcClient<M> {
    /// Creates a client with a custom marshal.
    pub fn with_marshal(transport: Arc<Transport>, config: ClientConfig, marshal: M) -> Self {
        Self {
            transport,
            marshal,
            config,
        }
    }

    /// The transport this client runs on.
    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// The marshal requests are packed with.
    pub fn marshal(&self) -> &M {
        &self.marshal
    }

    /// Assigns a transaction id and packs `body` behind a request header.
    pub fn create<T: Serialize>(
        &self,
        opcode: u32,
        body: &T,
        reply_capacity: usize,
    ) -> Result<Request> {
        if reply_capacity == 0 {
            return Err(RpcError::invalid("reply capacity must be non-zero"));
        }
        let xid = self.transport.next_xid();
        let payload = self
            .marshal
            .pack(&MessageHeader::request(opcode, xid), body)?;
        debug!(xid, opcode, len = payload.len(), reply_capacity, "request created");
        Ok(Request::new(xid, opcode, payload, reply_capacity))
    }

    /// Hands `request` to `to`.
    ///
    /// A remote destination gets the reply buffer posted first, then the bulk sink,
    /// and only then the request itself. If any step fails, everything already
    /// posted is torn down before the error is returned.
    pub fn dispatch(&self, request: &mut Request, to: &Destination) -> Result<()> {
        if request.dispatched {
            return Err(RpcError::invalid(format!(
                "request {} already dispatched",
                request.xid
            )));
        }
        request.dispatched = true;
        request.transport = Some(Arc::clone(&self.transport));
        match to {
            Destination::Local(handler) => self.dispatch_local(request, handler.as_ref()),
            Destination::Remote(peer) => self.dispatch_remote(request, peer),
        }
    }

    fn dispatch_local(&self, request: &mut Request, handler: &dyn LocalHandler) -> Result<()> {
        let header = self.marshal.peek_header(&request.payload)?;
        let reply = match handler.handle(&header, &request.payload) {
            Ok(reply) => reply,
            Err(e) => {
                request.exchange.finish(ExchangeState::Aborted);
                return Err(e);
            }
        };
        self.transport.metrics().inc_requests_local();

        if request.bulk_sink.is_some() {
            let bulk = match handler.handle_bulk(&header, &request.payload) {
                Ok(bulk) => bulk,
                Err(e) => {
                    request.teardown();
                    return Err(e);
                }
            };
            let xid = request.xid;
            if let Some(sink) = request.bulk_sink.as_mut() {
                match bulk {
                    Some(payload) => match sink.deposit_local(&payload) {
                        Ok(len) => {
                            self.transport.metrics().add_bulk_bytes_sent(len);
                            debug!(xid, len, "bulk payload copied locally");
                        }
                        // The sink recorded the overflow; receive_bulk reports it.
                        Err(e) => debug!(xid, error = %e, "local bulk payload truncated"),
                    },
                    None => {
                        debug!(xid, "local handler moved no bulk data");
                        sink.abort(&self.transport);
                    }
                }
            }
        }

        if reply.len() > request.reply_capacity {
            self.transport.metrics().inc_truncated_replies();
            request
                .exchange
                .finish(ExchangeState::Failed(Failure::Truncated {
                    received: request.reply_capacity,
                    sent: reply.len(),
                }));
            return Ok(());
        }
        let region = match Region::allocate(request.reply_capacity, "reply buffer") {
            Ok(region) => region,
            Err(e) => {
                request.teardown();
                return Err(e);
            }
        };
        region.write_at(0, &reply);
        request.reply_region = Some(region);
        request.exchange.finish(ExchangeState::Replied {
            offset: 0,
            len: reply.len(),
        });
        debug!(xid = request.xid, len = reply.len(), "request served locally");
        Ok(())
    }

    fn dispatch_remote(&self, request: &mut Request, peer: &PeerChannels) -> Result<()> {
        self.transport.ensure_running()?;
        let xid = request.xid;
        let fabric = self.transport.fabric();
        let dispatcher = self.transport.dispatcher();

        let region = Region::allocate(request.reply_capacity, "reply buffer")?;
        let token = dispatcher.track_reply(Arc::clone(&request.exchange));
        request.reply_token = Some(token);
        request.reply_region = Some(region.clone());
        let posted = fabric.post_receive(RecvSpec {
            portal: peer.reply_portal,
            match_bits: xid,
            ignore_bits: 0,
            region,
            threshold: Threshold::Count(1),
            queue: QueueKind::ReplyReceived,
            token,
            position: InsertPosition::Back,
            manage_offset: false,
        });
        match posted {
            Ok(md) => request.reply_md = Some(md),
            Err(e) => {
                self.abort(request);
                return Err(e);
            }
        }

        if let Some(sink) = request.bulk_sink.as_mut() {
            if let Err(e) = sink.post(&self.transport, peer.bulk_portal) {
                self.abort(request);
                return Err(e);
            }
        }

        let payload = Region::from_vec(std::mem::take(&mut request.payload));
        let send_token = dispatcher.track_send(payload.clone(), Some(Arc::clone(&request.exchange)));
        request.send_token = Some(send_token);
        let sent = fabric.send(SendSpec {
            region: payload,
            dest: peer.nid,
            portal: peer.request_portal,
            match_bits: xid,
            ack: false,
            queue: QueueKind::RequestSent,
            token: send_token,
        });
        match sent {
            Ok(md) => {
                self.transport.metrics().inc_requests_sent();
                debug!(xid, %md, dest = peer.nid, portal = peer.request_portal, "request sent");
                Ok(())
            }
            Err(e) => {
                self.abort(request);
                Err(e)
            }
        }
    }

    /// Suspends until the reply lands, the exchange fails, `cancel` fires or the
    /// configured reply deadline passes. Exactly one of these ends the wait.
    pub async fn wait<R: DeserializeOwned>(
        &self,
        request: &mut Request,
        cancel: &CancelToken,
    ) -> Result<Reply<R>> {
        if !request.dispatched {
            return Err(RpcError::invalid(format!(
                "request {} was never dispatched",
                request.xid
            )));
        }
        let xid = request.xid;
        let mut rx = request.exchange.subscribe();
        let deadline = Deadline::from_millis(self.config.reply_timeout_ms);
        let outcome = tokio::select! {
            biased;
            state = rx.wait_for(|s| s.is_terminal()) => match state {
                Ok(state) => Outcome::Done(*state),
                Err(_) => Outcome::Done(ExchangeState::Aborted),
            },
            reason = cancel.cancelled() => Outcome::Cancelled(reason),
            _ = deadline::expire(deadline) => Outcome::TimedOut,
        };

        match outcome {
            Outcome::Done(ExchangeState::Replied { offset, len }) => {
                // The reply descriptor unlinked itself on delivery.
                request.reply_md = None;
                if let Some(token) = request.reply_token.take() {
                    self.transport.dispatcher().retire_reply(token);
                }
                let region = request
                    .reply_region
                    .take()
                    .ok_or_else(|| RpcError::invalid(format!("request {xid} lost its reply buffer")))?;
                let bytes = region.read_at(offset, len).ok_or(RpcError::Unpack {
                    what: "reply",
                    reason: format!("{len} bytes at offset {offset} exceed the reply buffer"),
                })?;
                let (header, body) = self.marshal.unpack::<R>(&bytes)?;
                if header.xid != xid {
                    return Err(RpcError::Unpack {
                        what: "reply",
                        reason: format!("reply for xid {} matched request {xid}", header.xid),
                    });
                }
                debug!(xid, len, status = header.status, "reply received");
                Ok(Reply { header, body })
            }
            Outcome::Done(ExchangeState::Failed(failure)) => {
                self.abort(request);
                Err(failure.into_error(xid))
            }
            Outcome::Done(_) => Err(RpcError::invalid(format!("request {xid} was aborted"))),
            Outcome::Cancelled(reason) => {
                self.abort(request);
                self.transport.metrics().inc_cancelled();
                debug!(xid, %reason, "wait cancelled");
                Err(RpcError::Cancelled(reason))
            }
            Outcome::TimedOut => {
                self.abort(request);
                self.transport.metrics().inc_timeouts();
                let timeout_ms = deadline.map(|d| d.timeout_ms()).unwrap_or_default();
                warn!(xid, timeout_ms, "no reply before the deadline");
                Err(RpcError::RequestTimeout { xid, timeout_ms })
            }
        }
    }

    /// Unlinks the reply and bulk descriptors of `request` and releases its reply
    /// buffer. Safe to call repeatedly and after a failed dispatch. Dropping the
    /// request does the same.
    pub fn abort(&self, request: &mut Request) {
        request.teardown();
    }

    /// Waits for the payload of the bulk sink attached to `request`, at most for
    /// the configured bulk deadline.
    pub async fn receive_bulk(&self, request: &mut Request, cancel: &CancelToken) -> Result<Bytes> {
        let sink = request.bulk_sink.as_mut().ok_or_else(|| {
            RpcError::invalid(format!("request {} carries no bulk sink", request.xid))
        })?;
        let deadline = Deadline::from_millis(self.config.bulk_timeout_ms);
        sink.receive_within(&self.transport, cancel, deadline).await
    }

    /// Creates, dispatches and waits for one request.
    pub async fn call<T: Serialize, R: DeserializeOwned>(
        &self,
        opcode: u32,
        body: &T,
        reply_capacity: usize,
        to: &Destination,
        cancel: &CancelToken,
    ) -> Result<Reply<R>> {
        let mut request = self.create(opcode, body, reply_capacity)?;
        self.dispatch(&mut request, to)?;
        self.wait(&mut request, cancel).await
    }
}
