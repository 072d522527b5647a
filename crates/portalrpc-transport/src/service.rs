//! Service side: receive ring, worker handoff and replies.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::bulk::BulkEndpoint;
use crate::cancel::CancelToken;
use crate::config::ServiceConfig;
use crate::dispatch::QueueKind;
use crate::error::{Result, RpcError};
use crate::fabric::{Nid, Region, SendSpec};
use crate::message::{BincodeMarshal, Marshal, MessageHeader};
use crate::ring::{ArrivalNote, ServiceRing};
use crate::transport::Transport;

/// A request taken off the worker queue.
///
/// The request occupies its ring slot until the guard is released or dropped.
pub struct Arrival {
    ring: Arc<ServiceRing>,
    note: ArrivalNote,
    payload: Vec<u8>,
    released: bool,
}

impl std::fmt::Debug for Arrival {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arrival")
            .field("note", &self.note)
            .field("released", &self.released)
            .finish()
    }
}

impl Arrival {
    /// Packed request as deposited in the ring.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Transaction id the initiator tagged the request with.
    pub fn xid(&self) -> u64 {
        self.note.match_bits
    }

    /// Node that sent the request.
    pub fn initiator(&self) -> Nid {
        self.note.initiator
    }

    /// Ring slot holding the request.
    pub fn slot(&self) -> usize {
        self.note.slot
    }

    /// True when the request did not fit in its slot.
    pub fn is_truncated(&self) -> bool {
        self.note.is_truncated()
    }

    /// Gives the slot space back to the ring.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.ring.on_consumed(self.note.slot)
    }
}

impl Drop for Arrival {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.ring.on_consumed(self.note.slot) {
            warn!(slot = self.note.slot, error = %e, "cannot release ring slot");
        }
    }
}

/// A registered service. Dropping it unregisters the ring.
pub struct Service<M: Marshal = BincodeMarshal> {
    transport: Arc<Transport>,
    ring: Arc<ServiceRing>,
    config: ServiceConfig,
    marshal: M,
    arrivals: Mutex<mpsc::UnboundedReceiver<ArrivalNote>>,
    unregistered: AtomicBool,
}

impl<M: Marshal> std::fmt::Debug for Service<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.config.name)
            .field("ring", &self.ring)
            .finish()
    }
}

impl Service<BincodeMarshal> {
    /// Registers a service with the bincode marshal.
    pub fn register(transport: Arc<Transport>, config: ServiceConfig) -> Result<Self> {
        Self::with_marshal(transport, config, BincodeMarshal)
    }
}

impl<M: Marshal> Service<M> {
    /// Registers a service, posting its whole receive ring.
    pub fn with_marshal(transport: Arc<Transport>, config: ServiceConfig, marshal: M) -> Result<Self> {
        let (ring, arrivals) = ServiceRing::register(&transport, &config)?;
        Ok(Self {
            transport,
            ring,
            config,
            marshal,
            arrivals: Mutex::new(arrivals),
            unregistered: AtomicBool::new(false),
        })
    }

    /// The receive ring.
    pub fn ring(&self) -> &Arc<ServiceRing> {
        &self.ring
    }

    /// The transport the service runs on.
    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// The service layout.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Next request for a worker. `None` once the service is unregistered.
    pub async fn next_arrival(&self) -> Option<Arrival> {
        let note = self.arrivals.lock().await.recv().await?;
        let payload = self.ring.read(&note).unwrap_or_else(|| {
            warn!(service = %self.config.name, slot = note.slot, "arrival outside its ring slot");
            Vec::new()
        });
        Some(Arrival {
            ring: Arc::clone(&self.ring),
            note,
            payload,
            released: false,
        })
    }

    /// Decodes the request carried by `arrival`.
    pub fn unpack_request<T: DeserializeOwned>(&self, arrival: &Arrival) -> Result<(MessageHeader, T)> {
        if arrival.is_truncated() {
            return Err(RpcError::Unpack {
                what: "request",
                reason: format!(
                    "only {} of {} bytes fit the ring slot",
                    arrival.note.len, arrival.note.sent
                ),
            });
        }
        self.marshal.unpack(arrival.payload())
    }

    /// Sends a reply to the initiator of `arrival`.
    ///
    /// The send buffer stays with the dispatcher until the fabric reports it sent.
    pub fn reply<T: Serialize>(&self, arrival: &Arrival, header: &MessageHeader, body: &T) -> Result<()> {
        self.transport.ensure_running()?;
        if header.xid != arrival.xid() {
            return Err(RpcError::invalid(format!(
                "reply header xid {} does not match request {}",
                header.xid,
                arrival.xid()
            )));
        }
        let region = Region::from_vec(self.marshal.pack(header, body)?);
        let len = region.len();
        let dispatcher = self.transport.dispatcher();
        let token = dispatcher.track_send(region.clone(), None);
        let sent = self.transport.fabric().send(SendSpec {
            region,
            dest: arrival.initiator(),
            portal: self.config.reply_portal,
            match_bits: arrival.xid(),
            ack: false,
            queue: QueueKind::RequestSent,
            token,
        });
        match sent {
            Ok(md) => {
                self.transport.metrics().inc_replies_sent();
                debug!(service = %self.config.name, xid = arrival.xid(), %md, len, status = header.status, "reply sent");
                Ok(())
            }
            Err(e) => {
                dispatcher.retire_send(token);
                Err(e)
            }
        }
    }

    /// Pushes a bulk payload to the sink the initiator of `arrival` posted.
    pub async fn send_bulk(&self, arrival: &Arrival, payload: Vec<u8>, cancel: &CancelToken) -> Result<usize> {
        self.transport
            .send_as_source(
                arrival.xid(),
                BulkEndpoint::Remote {
                    nid: arrival.initiator(),
                    portal: self.config.bulk_portal,
                },
                payload,
                cancel,
                Duration::from_millis(self.config.bulk_ack_timeout_ms),
            )
            .await
    }

    /// Unlinks the ring. Pending arrivals can still be released afterwards.
    /// Idempotent.
    pub fn unregister(&self) {
        if self.unregistered.swap(true, Ordering::AcqRel) {
            return;
        }
        self.ring.unregister(self.transport.dispatcher());
        info!(service = %self.config.name, "service unregistered");
    }
}

impl<M: Marshal> Drop for Service<M> {
    fn drop(&mut self) {
        self.unregister();
    }
}
