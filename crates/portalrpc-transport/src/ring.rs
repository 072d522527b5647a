//! Service receive ring.
//!
//! A ring is a fixed arena of receive buffers, all posted on the service's request
//! portal at registration. Requests land back to back in the buffer at the head of
//! the match list. Once a buffer has less free space than the safety margin its
//! descriptor is unlinked and the next buffer takes over. The retired buffer is
//! re-posted behind the current tail as soon as every request it holds has been
//! consumed.
//!
//! Each slot is guarded by its own mutex and no code path holds two slot locks at
//! once. A slot's descriptor is posted with its lock held, so an arrival racing the
//! post waits for the slot bookkeeping instead of finding a stale descriptor.
//! Relinks and unregistration are serialized by a ring-level mutex, always taken
//! before any slot lock. The active head and the tail are plain atomics.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::ServiceConfig;
use crate::dispatch::{Dispatcher, QueueKind};
use crate::error::{Result, RpcError};
use crate::fabric::{
    CompletionEvent, Fabric, InsertPosition, MdHandle, Nid, Portal, RecvSpec, Region, Threshold,
};
use crate::metrics::RpcMetrics;
use crate::transport::Transport;

/// Lifecycle of a ring slot: `Posted -> Filling -> NearFull -> Drained -> Posted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Linked and empty.
    Posted,
    /// Linked and holding at least one request.
    Filling,
    /// Unlinked for lack of space, requests still pending.
    NearFull,
    /// Unlinked and fully consumed, about to be re-posted.
    Drained,
}

/// A request deposited into a ring slot, as handed to the worker queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrivalNote {
    /// Slot the request landed in.
    pub slot: usize,
    /// Offset of the request inside the slot buffer.
    pub offset: usize,
    /// Bytes deposited.
    pub len: usize,
    /// Bytes the initiator sent.
    pub sent: usize,
    /// Node that sent the request.
    pub initiator: Nid,
    /// Match bits carried by the request.
    pub match_bits: u64,
}

impl ArrivalNote {
    /// True when the request did not fit in the slot.
    pub fn is_truncated(&self) -> bool {
        self.len < self.sent
    }
}

#[derive(Debug)]
struct SlotInner {
    md: Option<MdHandle>,
    pending: usize,
    state: SlotState,
    fill: usize,
}

#[derive(Debug)]
struct RingSlot {
    region: Region,
    token: u64,
    inner: Mutex<SlotInner>,
}

impl RingSlot {
    fn lock(&self) -> MutexGuard<'_, SlotInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Receive ring of one service.
pub struct ServiceRing {
    name: String,
    portal: Portal,
    buffer_size: usize,
    safety_margin: usize,
    fabric: Arc<dyn Fabric>,
    metrics: Arc<RpcMetrics>,
    slots: Vec<RingSlot>,
    active: AtomicUsize,
    tail: AtomicUsize,
    closed: AtomicBool,
    relink: Mutex<()>,
    notes: Mutex<Option<mpsc::UnboundedSender<ArrivalNote>>>,
}

impl std::fmt::Debug for ServiceRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRing")
            .field("name", &self.name)
            .field("portal", &self.portal)
            .field("slots", &self.slots.len())
            .field("active", &self.active())
            .field("tail", &self.tail())
            .finish()
    }
}

impl ServiceRing {
    /// Allocates and posts every slot of a ring laid out by `config`.
    ///
    /// Returns the ring and the queue its arrivals are handed to. On failure every
    /// buffer allocated so far is released and every posted descriptor unlinked.
    pub fn register(
        transport: &Transport,
        config: &ServiceConfig,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<ArrivalNote>)> {
        config.validate()?;
        transport.ensure_running()?;

        let mut regions = Vec::new();
        regions
            .try_reserve_exact(config.ring_length)
            .map_err(|_| RpcError::Allocation {
                what: "ring slot table",
                size: config.ring_length,
            })?;
        for _ in 0..config.ring_length {
            regions.push(Region::allocate(config.buffer_size, "ring buffer")?);
        }

        let dispatcher = transport.dispatcher();
        let slots = regions
            .into_iter()
            .map(|region| RingSlot {
                region,
                token: dispatcher.next_token(),
                inner: Mutex::new(SlotInner {
                    md: None,
                    pending: 0,
                    state: SlotState::Drained,
                    fill: 0,
                }),
            })
            .collect::<Vec<_>>();

        let (tx, rx) = mpsc::unbounded_channel();
        let ring = Arc::new(Self {
            name: config.name.clone(),
            portal: config.request_portal,
            buffer_size: config.buffer_size,
            safety_margin: config.safety_margin,
            fabric: Arc::clone(transport.fabric()),
            metrics: Arc::clone(transport.metrics()),
            active: AtomicUsize::new(0),
            tail: AtomicUsize::new(slots.len() - 1),
            slots,
            closed: AtomicBool::new(false),
            relink: Mutex::new(()),
            notes: Mutex::new(Some(tx)),
        });
        for (idx, slot) in ring.slots.iter().enumerate() {
            dispatcher.track_arrival(slot.token, Arc::clone(&ring), idx);
        }

        let mut prev = None;
        for idx in 0..ring.slots.len() {
            let position = prev.map_or(InsertPosition::Back, InsertPosition::After);
            let mut inner = ring.slots[idx].lock();
            match ring.post_slot(idx, position) {
                Ok(md) => {
                    inner.md = Some(md);
                    inner.state = SlotState::Posted;
                    prev = Some(md);
                }
                Err(e) => {
                    drop(inner);
                    error!(service = %ring.name, slot = idx, error = %e, "cannot post ring buffer");
                    ring.unregister(dispatcher);
                    return Err(e);
                }
            }
        }

        info!(
            service = %ring.name,
            portal = ring.portal,
            slots = ring.slots.len(),
            buffer_size = ring.buffer_size,
            "receive ring registered"
        );
        Ok((ring, rx))
    }

    fn post_slot(&self, idx: usize, position: InsertPosition) -> Result<MdHandle> {
        let slot = &self.slots[idx];
        self.fabric.post_receive(RecvSpec {
            portal: self.portal,
            match_bits: 0,
            ignore_bits: !0,
            region: slot.region.clone(),
            threshold: Threshold::Infinite,
            queue: QueueKind::ServerArrival,
            token: slot.token,
            position,
            manage_offset: true,
        })
    }

    /// Records a request deposited into `slot`. Runs on the event pump.
    pub(crate) fn on_arrival(&self, slot: usize, event: &CompletionEvent) {
        let Some(ring_slot) = self.slots.get(slot) else {
            warn!(service = %self.name, slot, "arrival for an unknown ring slot");
            return;
        };
        let mut inner = ring_slot.lock();
        if inner.md != Some(event.md) {
            self.metrics.inc_stale_events();
            warn!(service = %self.name, slot, md = %event.md, "arrival for a retired ring descriptor");
            return;
        }
        inner.pending += 1;
        inner.state = SlotState::Filling;
        inner.fill = event.offset + event.mlength;
        self.metrics.inc_ring_arrivals();

        if event.is_truncated() {
            warn!(
                service = %self.name,
                slot,
                received = event.mlength,
                sent = event.rlength,
                initiator = event.initiator,
                "possibly truncated rpc"
            );
        }

        let remaining = self.buffer_size.saturating_sub(inner.fill);
        let retired = remaining < self.safety_margin;
        if retired {
            if let Some(md) = inner.md.take() {
                if let Err(e) = self.fabric.unlink(md) {
                    debug!(service = %self.name, slot, %md, error = %e, "ring descriptor already unlinked");
                }
            }
            inner.state = SlotState::NearFull;
            self.metrics.inc_ring_retirements();
            debug!(service = %self.name, slot, remaining, pending = inner.pending, "ring slot retired");
        }
        drop(inner);

        if retired {
            let next = (slot + 1) % self.slots.len();
            self.active.store(next, Ordering::Release);
            if self.slots[next].lock().md.is_none() {
                self.metrics.inc_ring_saturations();
                error!(service = %self.name, slot = next, "all ring buffers unlinked");
            }
        }

        let note = ArrivalNote {
            slot,
            offset: event.offset,
            len: event.mlength,
            sent: event.rlength,
            initiator: event.initiator,
            match_bits: event.match_bits,
        };
        let sent = match self.notes.lock() {
            Ok(notes) => notes.as_ref().is_some_and(|tx| tx.send(note).is_ok()),
            Err(_) => false,
        };
        if !sent {
            warn!(service = %self.name, slot, "no worker queue, arrival left in the ring");
        }
    }

    /// Releases one request held by `slot`, re-posting the slot once it is
    /// unlinked and empty.
    pub fn on_consumed(&self, slot: usize) -> Result<()> {
        let ring_slot = self
            .slots
            .get(slot)
            .ok_or_else(|| RpcError::invalid(format!("ring slot {slot} does not exist")))?;
        {
            let mut inner = ring_slot.lock();
            if inner.pending == 0 {
                return Err(RpcError::invalid(format!(
                    "ring slot {slot} has no pending arrivals"
                )));
            }
            inner.pending -= 1;
            if inner.pending > 0 || inner.md.is_some() {
                return Ok(());
            }
            inner.state = SlotState::Drained;
        }
        let _relink = self.relink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }

        let tail = self.tail.load(Ordering::Acquire);
        let after = if tail == slot {
            None
        } else {
            self.slots[tail].lock().md
        };
        let mut inner = ring_slot.lock();
        let md = match self.post_slot(slot, after.map_or(InsertPosition::Back, InsertPosition::After)) {
            Ok(md) => md,
            Err(e) if after.is_some() => {
                debug!(service = %self.name, slot, error = %e, "tail unlinked, appending instead");
                self.post_slot(slot, InsertPosition::Back)?
            }
            Err(e) => {
                error!(service = %self.name, slot, error = %e, "cannot re-post ring buffer");
                return Err(e);
            }
        };
        inner.md = Some(md);
        inner.state = SlotState::Posted;
        inner.fill = 0;
        drop(inner);
        self.tail.store(slot, Ordering::Release);
        self.metrics.inc_ring_relinks();
        debug!(service = %self.name, slot, %md, "ring slot re-posted");
        Ok(())
    }

    /// Unlinks every slot and retires its token. Buffers are freed with the last
    /// reference to the ring.
    pub(crate) fn unregister(&self, dispatcher: &Dispatcher) {
        let _relink = self.relink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.closed.store(true, Ordering::Release);
        for (idx, slot) in self.slots.iter().enumerate() {
            let mut inner = slot.lock();
            if inner.pending > 0 {
                warn!(service = %self.name, slot = idx, pending = inner.pending, "unregistering a ring slot with pending arrivals");
            }
            if let Some(md) = inner.md.take() {
                if let Err(e) = self.fabric.unlink(md) {
                    debug!(service = %self.name, slot = idx, %md, error = %e, "ring descriptor already unlinked");
                }
            }
            dispatcher.retire_arrival(slot.token);
        }
        if let Ok(mut notes) = self.notes.lock() {
            notes.take();
        }
        info!(service = %self.name, "receive ring unregistered");
    }

    /// Copies a request out of a slot buffer.
    pub(crate) fn read(&self, note: &ArrivalNote) -> Option<Vec<u8>> {
        self.slots
            .get(note.slot)?
            .region
            .read_at(note.offset, note.len)
    }

    /// Service name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Always false; a ring has at least one slot.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot currently at the head of the ring.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Slot most recently re-posted.
    pub fn tail(&self) -> usize {
        self.tail.load(Ordering::Acquire)
    }

    /// State of `slot`.
    pub fn slot_state(&self, slot: usize) -> Option<SlotState> {
        self.slots.get(slot).map(|s| s.lock().state)
    }

    /// Requests held by `slot` that have not been consumed.
    pub fn pending(&self, slot: usize) -> Option<usize> {
        self.slots.get(slot).map(|s| s.lock().pending)
    }

    /// Descriptor currently linked for `slot`.
    pub fn descriptor(&self, slot: usize) -> Option<MdHandle> {
        self.slots.get(slot).and_then(|s| s.lock().md)
    }

    /// True while `slot` accepts requests.
    pub fn is_linked(&self, slot: usize) -> bool {
        self.descriptor(slot).is_some()
    }

    /// Bytes used in `slot` since it was last posted.
    pub fn fill(&self, slot: usize) -> Option<usize> {
        self.slots.get(slot).map(|s| s.lock().fill)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::fabric::SendSpec;
    use crate::sim::{SimNetwork, SimNic};

    fn config(ring_length: usize, buffer_size: usize) -> ServiceConfig {
        ServiceConfig {
            name: String::from("test"),
            ring_length,
            buffer_size,
            safety_margin: 1024,
            ..ServiceConfig::default()
        }
    }

    struct Fixture {
        net: Arc<SimNetwork>,
        transport: Arc<Transport>,
        peer: Arc<SimNic>,
    }

    fn fixture() -> Fixture {
        let net = SimNetwork::new();
        let (nic, events) = net.attach(1);
        let (peer, _peer_events) = net.attach(2);
        Fixture {
            transport: Transport::start(nic, events),
            net,
            peer,
        }
    }

    fn push(peer: &SimNic, len: usize) {
        peer.send(SendSpec {
            region: Region::from_vec(vec![0xab; len]),
            dest: 1,
            portal: 6,
            match_bits: 1,
            ack: false,
            queue: QueueKind::RequestSent,
            token: 0,
        })
        .unwrap();
    }

    #[tokio::test]
    async fn test_register_posts_every_slot_in_order() {
        let f = fixture();
        let (ring, _rx) = ServiceRing::register(&f.transport, &config(4, 4096)).unwrap();
        let list = f.net.match_list(1, 6);
        assert_eq!(list.len(), 4);
        for (idx, md) in list.iter().enumerate() {
            assert_eq!(ring.descriptor(idx), Some(*md));
            assert_eq!(ring.slot_state(idx), Some(SlotState::Posted));
        }
        assert_eq!(ring.active(), 0);
        assert_eq!(ring.tail(), 3);
    }

    #[tokio::test]
    async fn test_register_failure_unlinks_posted_slots() {
        let f = fixture();
        f.net.fail_post_after(2);
        let err = ServiceRing::register(&f.transport, &config(4, 4096)).unwrap_err();
        assert!(matches!(err, RpcError::Transport { op: "post_receive", .. }));
        assert!(f.net.match_list(1, 6).is_empty());
        assert_eq!(f.transport.dispatcher().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_register_allocation_failure() {
        let f = fixture();
        let mut cfg = config(2, usize::MAX);
        cfg.safety_margin = 16;
        let err = ServiceRing::register(&f.transport, &cfg).unwrap_err();
        assert!(matches!(err, RpcError::Allocation { .. }));
        assert_eq!(f.net.stats().posts, 0);
    }

    #[tokio::test]
    async fn test_arrivals_fill_then_retire_slot() {
        let f = fixture();
        let (ring, mut rx) = ServiceRing::register(&f.transport, &config(4, 4096)).unwrap();

        for expected_offset in [0, 1000, 2000] {
            push(&f.peer, 1000);
            let note = rx.recv().await.unwrap();
            assert_eq!(note.slot, 0);
            assert_eq!(note.offset, expected_offset);
            assert_eq!(ring.slot_state(0), Some(SlotState::Filling));
        }

        push(&f.peer, 1000);
        let note = rx.recv().await.unwrap();
        assert_eq!((note.slot, note.offset), (0, 3000));
        assert_eq!(ring.slot_state(0), Some(SlotState::NearFull));
        assert!(!ring.is_linked(0));
        assert_eq!(ring.active(), 1);

        push(&f.peer, 1000);
        let note = rx.recv().await.unwrap();
        assert_eq!((note.slot, note.offset), (1, 0));
        assert!(!note.is_truncated());
        assert_eq!(f.transport.metrics().snapshot().ring_retirements, 1);
    }

    #[tokio::test]
    async fn test_drained_slot_is_reposted_after_tail() {
        let f = fixture();
        let (ring, mut rx) = ServiceRing::register(&f.transport, &config(2, 2048)).unwrap();

        push(&f.peer, 1500);
        let note = rx.recv().await.unwrap();
        assert_eq!(ring.slot_state(note.slot), Some(SlotState::NearFull));
        assert_eq!(ring.pending(0), Some(1));

        ring.on_consumed(0).unwrap();
        assert_eq!(ring.slot_state(0), Some(SlotState::Posted));
        assert_eq!(ring.tail(), 0);
        assert_eq!(ring.fill(0), Some(0));
        let list = f.net.match_list(1, 6);
        assert_eq!(list, vec![ring.descriptor(1).unwrap(), ring.descriptor(0).unwrap()]);
        assert_eq!(f.transport.metrics().snapshot().ring_relinks, 1);
    }

    #[tokio::test]
    async fn test_consumed_linked_slot_stays_posted() {
        let f = fixture();
        let (ring, mut rx) = ServiceRing::register(&f.transport, &config(2, 4096)).unwrap();
        push(&f.peer, 100);
        rx.recv().await.unwrap();
        ring.on_consumed(0).unwrap();
        assert_eq!(ring.slot_state(0), Some(SlotState::Filling));
        assert!(ring.is_linked(0));
        assert!(ring.on_consumed(0).is_err());
    }

    #[tokio::test]
    async fn test_saturation_is_not_fatal() {
        let f = fixture();
        let (ring, mut rx) = ServiceRing::register(&f.transport, &config(2, 2048)).unwrap();
        push(&f.peer, 1500);
        rx.recv().await.unwrap();
        push(&f.peer, 1500);
        rx.recv().await.unwrap();
        assert!(!ring.is_linked(0));
        assert!(!ring.is_linked(1));
        assert_eq!(f.transport.metrics().snapshot().ring_saturations, 1);

        push(&f.peer, 100);
        assert_eq!(f.net.stats().dropped, 1);

        ring.on_consumed(1).unwrap();
        assert!(ring.is_linked(1));
        assert_eq!(f.net.match_list(1, 6), vec![ring.descriptor(1).unwrap()]);
    }

    #[tokio::test]
    async fn test_truncated_arrival_is_flagged() {
        let f = fixture();
        let (_ring, mut rx) = ServiceRing::register(&f.transport, &config(1, 2048)).unwrap();
        push(&f.peer, 3000);
        let note = rx.recv().await.unwrap();
        assert!(note.is_truncated());
        assert_eq!(note.len, 2048);
    }

    #[tokio::test]
    async fn test_unregister_unlinks_everything() {
        let f = fixture();
        let (ring, mut rx) = ServiceRing::register(&f.transport, &config(3, 4096)).unwrap();
        push(&f.peer, 10);
        rx.recv().await.unwrap();
        ring.unregister(f.transport.dispatcher());
        assert!(f.net.match_list(1, 6).is_empty());
        assert_eq!(f.transport.dispatcher().outstanding(), 0);
        assert!(rx.recv().await.is_none());
        // A late consume on a closed ring does not re-post.
        ring.on_consumed(0).unwrap();
        assert!(f.net.match_list(1, 6).is_empty());
    }

    /// Pushes a request from inside `post_receive` once armed, then stalls so the
    /// event pump gets to the arrival while the post is still in progress.
    struct PushDuringPost {
        inner: Arc<SimNic>,
        peer: Arc<SimNic>,
        armed: AtomicBool,
    }

    impl Fabric for PushDuringPost {
        fn local_nid(&self) -> Nid {
            self.inner.local_nid()
        }

        fn post_receive(&self, spec: RecvSpec) -> Result<MdHandle> {
            let md = self.inner.post_receive(spec)?;
            if self.armed.swap(false, Ordering::SeqCst) {
                push(&self.peer, 100);
                std::thread::sleep(Duration::from_millis(50));
            }
            Ok(md)
        }

        fn send(&self, spec: SendSpec) -> Result<MdHandle> {
            self.inner.send(spec)
        }

        fn unlink(&self, md: MdHandle) -> Result<()> {
            self.inner.unlink(md)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_arrival_during_relink_reaches_worker() {
        let net = SimNetwork::new();
        let (nic, events) = net.attach(1);
        let (peer, _peer_events) = net.attach(2);
        let fabric = Arc::new(PushDuringPost {
            inner: nic,
            peer: Arc::clone(&peer),
            armed: AtomicBool::new(false),
        });
        let transport = Transport::start(Arc::clone(&fabric) as Arc<dyn Fabric>, events);
        let (ring, mut rx) = ServiceRing::register(&transport, &config(2, 2048)).unwrap();

        push(&peer, 1500);
        rx.recv().await.unwrap();
        push(&peer, 1500);
        rx.recv().await.unwrap();
        assert!(!ring.is_linked(0) && !ring.is_linked(1));

        fabric.armed.store(true, Ordering::SeqCst);
        ring.on_consumed(0).unwrap();

        let note = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!((note.slot, note.offset, note.len), (0, 0, 100));
        assert_eq!(ring.fill(0), Some(100));
        assert_eq!(ring.pending(0), Some(1));
        assert_eq!(transport.metrics().snapshot().stale_events, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_relinks_keep_tail_last() {
        let f = fixture();
        let (ring, mut rx) = ServiceRing::register(&f.transport, &config(3, 2048)).unwrap();
        push(&f.peer, 1500);
        rx.recv().await.unwrap();
        push(&f.peer, 1500);
        rx.recv().await.unwrap();
        assert_eq!(ring.active(), 2);

        std::thread::scope(|scope| {
            for slot in [0, 1] {
                let ring = &ring;
                scope.spawn(move || ring.on_consumed(slot).unwrap());
            }
        });

        let list = f.net.match_list(1, 6);
        assert_eq!(list.len(), 3);
        assert_eq!(list[0], ring.descriptor(2).unwrap());
        assert_eq!(list.last().copied(), ring.descriptor(ring.tail()));
        assert_eq!(f.transport.metrics().snapshot().ring_relinks, 2);
    }

    #[tokio::test]
    async fn test_unregister_blocks_later_relink() {
        let f = fixture();
        let (ring, mut rx) = ServiceRing::register(&f.transport, &config(2, 2048)).unwrap();
        push(&f.peer, 1500);
        rx.recv().await.unwrap();
        ring.unregister(f.transport.dispatcher());
        ring.on_consumed(0).unwrap();
        assert!(f.net.match_list(1, 6).is_empty());
        assert_eq!(ring.descriptor(0), None);
        assert_eq!(f.transport.metrics().snapshot().ring_relinks, 0);
    }
}
