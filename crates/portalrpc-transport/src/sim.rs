//! In-memory fabric simulation for testing without a real network.
//!
//! A [`SimNetwork`] holds any number of nodes. Each node keeps an ordered match list
//! per portal; a message lands in the first linked descriptor whose match bits
//! agree, exactly like a hardware portal table. Completion events are pushed onto
//! the owning node's unbounded channel so that delivery stays asynchronous with
//! respect to the poster.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::dispatch::QueueKind;
use crate::error::{Result, RpcError};
use crate::fabric::{
    CompletionEvent, EventKind, Fabric, InsertPosition, MatchBits, MdHandle, Nid, Portal,
    RecvSpec, Region, SendSpec, Threshold,
};

/// No such descriptor.
pub const ENOENT: i32 = -2;
/// Out of descriptor memory.
pub const ENOMEM: i32 = -12;
/// Node not attached to the network.
pub const EHOSTUNREACH: i32 = -113;

/// Fabric operation counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricStats {
    /// Receive descriptors posted.
    pub posts: u64,
    /// Sends issued.
    pub sends: u64,
    /// Explicit unlinks that removed a descriptor.
    pub unlinks: u64,
    /// Descriptors removed because their threshold was exhausted.
    pub auto_unlinks: u64,
    /// Messages that matched a descriptor.
    pub deliveries: u64,
    /// Messages that matched nothing and were dropped.
    pub dropped: u64,
    /// Deliveries cut short by a full descriptor.
    pub truncated: u64,
    /// Acknowledgements generated.
    pub acks: u64,
    /// Bytes deposited into receive descriptors.
    pub bytes_delivered: u64,
}

/// Faults the simulation can inject.
#[derive(Debug, Clone, Default)]
struct FaultPlan {
    drop_acks: bool,
    hold_deliveries: bool,
    fail_post_after: Option<usize>,
    fail_next_send: Option<i32>,
    fail_next_completion: Option<i32>,
}

#[derive(Debug)]
struct MatchEntry {
    md: MdHandle,
    match_bits: MatchBits,
    ignore_bits: MatchBits,
    region: Region,
    threshold: Threshold,
    offset: usize,
    manage_offset: bool,
    queue: QueueKind,
    token: u64,
}

impl MatchEntry {
    fn matches(&self, bits: MatchBits) -> bool {
        (self.match_bits ^ bits) & !self.ignore_bits == 0
    }
}

#[derive(Debug)]
struct PendingPut {
    src: Nid,
    md: MdHandle,
    spec: SendSpec,
}

struct NodeState {
    events: mpsc::UnboundedSender<CompletionEvent>,
    portals: HashMap<Portal, Vec<MatchEntry>>,
    send_mds: HashSet<MdHandle>,
}

struct NetState {
    nodes: HashMap<Nid, NodeState>,
    held: VecDeque<PendingPut>,
    faults: FaultPlan,
    stats: FabricStats,
}

/// A simulated network connecting any number of [`SimNic`] endpoints.
pub struct SimNetwork {
    state: Mutex<NetState>,
    next_md: AtomicU64,
}

impl SimNetwork {
    /// Creates an empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(NetState {
                nodes: HashMap::new(),
                held: VecDeque::new(),
                faults: FaultPlan::default(),
                stats: FabricStats::default(),
            }),
            next_md: AtomicU64::new(1),
        })
    }

    fn lock(&self) -> MutexGuard<'_, NetState> {
        // A panic while holding the lock leaves plain bookkeeping behind, keep going.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attaches a node and returns its endpoint plus the stream of its completion events.
    pub fn attach(
        self: &Arc<Self>,
        nid: Nid,
    ) -> (Arc<SimNic>, mpsc::UnboundedReceiver<CompletionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().nodes.insert(
            nid,
            NodeState {
                events: tx,
                portals: HashMap::new(),
                send_mds: HashSet::new(),
            },
        );
        debug!(nid, "node attached to simulated fabric");
        (
            Arc::new(SimNic {
                nid,
                net: Arc::clone(self),
            }),
            rx,
        )
    }

    /// Snapshot of the operation counters.
    pub fn stats(&self) -> FabricStats {
        self.lock().stats.clone()
    }

    /// Suppress acknowledgements for every subsequent send.
    pub fn set_drop_acks(&self, drop: bool) {
        self.lock().faults.drop_acks = drop;
    }

    /// Queue sends instead of delivering them until [`SimNetwork::release_held`].
    pub fn set_hold_deliveries(&self, hold: bool) {
        self.lock().faults.hold_deliveries = hold;
    }

    /// Let `n` more receive posts succeed, then fail the next one with `ENOMEM`.
    pub fn fail_post_after(&self, n: usize) {
        self.lock().faults.fail_post_after = Some(n);
    }

    /// Make the next [`Fabric::send`] call fail synchronously with `code`.
    pub fn fail_next_send(&self, code: i32) {
        self.lock().faults.fail_next_send = Some(code);
    }

    /// Make the next send complete with a failed `Sent` event carrying `code`.
    pub fn fail_next_completion(&self, code: i32) {
        self.lock().faults.fail_next_completion = Some(code);
    }

    /// Number of sends waiting for [`SimNetwork::release_held`].
    pub fn held_count(&self) -> usize {
        self.lock().held.len()
    }

    /// Delivers every held send in order. Returns how many were released.
    pub fn release_held(&self) -> usize {
        let mut state = self.lock();
        state.faults.hold_deliveries = false;
        let held: Vec<PendingPut> = state.held.drain(..).collect();
        let count = held.len();
        for put in held {
            deliver(&mut state, put);
        }
        count
    }

    /// True while the descriptor is linked anywhere on the node.
    pub fn is_linked(&self, nid: Nid, md: MdHandle) -> bool {
        let state = self.lock();
        state.nodes.get(&nid).is_some_and(|node| {
            node.send_mds.contains(&md)
                || node
                    .portals
                    .values()
                    .any(|list| list.iter().any(|e| e.md == md))
        })
    }

    /// Descriptors attached to a portal, in match order.
    pub fn match_list(&self, nid: Nid, portal: Portal) -> Vec<MdHandle> {
        let state = self.lock();
        state
            .nodes
            .get(&nid)
            .and_then(|node| node.portals.get(&portal))
            .map(|list| list.iter().map(|e| e.md).collect())
            .unwrap_or_default()
    }

    fn allocate_md(&self) -> MdHandle {
        MdHandle(self.next_md.fetch_add(1, Ordering::Relaxed))
    }
}

fn emit(state: &NetState, nid: Nid, event: CompletionEvent) {
    if let Some(node) = state.nodes.get(&nid) {
        trace!(nid, kind = ?event.kind, md = %event.md, "completion event");
        // A closed receiver means the node's transport already shut down.
        let _ = node.events.send(event);
    }
}

fn deliver(state: &mut NetState, put: PendingPut) {
    let PendingPut { src, md, spec } = put;
    let rlength = spec.region.len();
    let status = state.faults.fail_next_completion.take().unwrap_or(0);

    let mut delivered: Option<usize> = None;
    if status == 0 {
        let mut put_event = None;
        let mut exhausted = false;
        if let Some(list) = state
            .nodes
            .get_mut(&spec.dest)
            .and_then(|node| node.portals.get_mut(&spec.portal))
        {
            if let Some(idx) = list.iter().position(|e| e.matches(spec.match_bits)) {
                let entry = &mut list[idx];
                let offset = if entry.manage_offset { entry.offset } else { 0 };
                let room = entry.region.len().saturating_sub(offset);
                let mlength = room.min(rlength);
                let data = spec.region.read_at(0, mlength).unwrap_or_default();
                entry.region.write_at(offset, &data);
                if entry.manage_offset {
                    entry.offset += mlength;
                }
                if let Threshold::Count(n) = &mut entry.threshold {
                    *n = n.saturating_sub(1);
                    exhausted = *n == 0;
                }
                put_event = Some(CompletionEvent {
                    kind: EventKind::Put,
                    queue: entry.queue,
                    md: entry.md,
                    token: entry.token,
                    offset,
                    mlength,
                    rlength,
                    initiator: src,
                    match_bits: spec.match_bits,
                    status: 0,
                });
                if exhausted {
                    list.remove(idx);
                }
                delivered = Some(mlength);
            }
        }
        match put_event {
            Some(event) => {
                state.stats.deliveries += 1;
                state.stats.bytes_delivered += event.mlength as u64;
                if event.is_truncated() {
                    state.stats.truncated += 1;
                }
                if exhausted {
                    state.stats.auto_unlinks += 1;
                }
                emit(state, spec.dest, event);
            }
            None => {
                state.stats.dropped += 1;
                debug!(
                    dest = spec.dest,
                    portal = spec.portal,
                    match_bits = spec.match_bits,
                    "no descriptor matched, message dropped"
                );
            }
        }
    }

    let still_linked = state
        .nodes
        .get(&src)
        .is_some_and(|node| node.send_mds.contains(&md));
    if !still_linked {
        return;
    }

    let sent = CompletionEvent {
        kind: EventKind::Sent,
        queue: spec.queue,
        md,
        token: spec.token,
        offset: 0,
        mlength: rlength,
        rlength,
        initiator: src,
        match_bits: spec.match_bits,
        status,
    };
    emit(state, src, sent);

    let ack_pending = spec.ack && !state.faults.drop_acks;
    if let (Some(mlength), true) = (delivered, ack_pending) {
        state.stats.acks += 1;
        emit(
            state,
            src,
            CompletionEvent {
                kind: EventKind::Ack,
                queue: spec.queue,
                md,
                token: spec.token,
                offset: 0,
                mlength,
                rlength,
                initiator: spec.dest,
                match_bits: spec.match_bits,
                status: 0,
            },
        );
    }

    // A send descriptor stays linked only while it still expects an ack.
    let keep = spec.ack && delivered.is_some() && !ack_pending && status == 0;
    if !keep {
        if let Some(node) = state.nodes.get_mut(&src) {
            node.send_mds.remove(&md);
        }
    }
}

/// One node's endpoint on a [`SimNetwork`].
pub struct SimNic {
    nid: Nid,
    net: Arc<SimNetwork>,
}

impl SimNic {
    /// The network this endpoint is attached to.
    pub fn network(&self) -> &Arc<SimNetwork> {
        &self.net
    }
}

impl Fabric for SimNic {
    fn local_nid(&self) -> Nid {
        self.nid
    }

    fn post_receive(&self, spec: RecvSpec) -> Result<MdHandle> {
        let md = self.net.allocate_md();
        let mut state = self.net.lock();
        if let Some(remaining) = state.faults.fail_post_after.as_mut() {
            if *remaining == 0 {
                state.faults.fail_post_after = None;
                return Err(RpcError::Transport {
                    op: "post_receive",
                    code: ENOMEM,
                });
            }
            *remaining -= 1;
        }
        let node = state.nodes.get_mut(&self.nid).ok_or(RpcError::Transport {
            op: "post_receive",
            code: EHOSTUNREACH,
        })?;
        let list = node.portals.entry(spec.portal).or_default();
        let idx = match spec.position {
            InsertPosition::Back => list.len(),
            InsertPosition::After(prev) => {
                list.iter()
                    .position(|e| e.md == prev)
                    .ok_or(RpcError::Transport {
                        op: "post_receive",
                        code: ENOENT,
                    })?
                    + 1
            }
        };
        list.insert(
            idx,
            MatchEntry {
                md,
                match_bits: spec.match_bits,
                ignore_bits: spec.ignore_bits,
                region: spec.region,
                threshold: spec.threshold,
                offset: 0,
                manage_offset: spec.manage_offset,
                queue: spec.queue,
                token: spec.token,
            },
        );
        state.stats.posts += 1;
        trace!(nid = self.nid, portal = spec.portal, %md, "receive descriptor posted");
        Ok(md)
    }

    fn send(&self, spec: SendSpec) -> Result<MdHandle> {
        let md = self.net.allocate_md();
        let mut state = self.net.lock();
        if let Some(code) = state.faults.fail_next_send.take() {
            return Err(RpcError::Transport { op: "send", code });
        }
        let node = state.nodes.get_mut(&self.nid).ok_or(RpcError::Transport {
            op: "send",
            code: EHOSTUNREACH,
        })?;
        node.send_mds.insert(md);
        state.stats.sends += 1;
        let put = PendingPut {
            src: self.nid,
            md,
            spec,
        };
        if state.faults.hold_deliveries {
            state.held.push_back(put);
        } else {
            deliver(&mut state, put);
        }
        Ok(md)
    }

    fn unlink(&self, md: MdHandle) -> Result<()> {
        let mut state = self.net.lock();
        let node = state.nodes.get_mut(&self.nid).ok_or(RpcError::Transport {
            op: "unlink",
            code: EHOSTUNREACH,
        })?;
        let mut removed = node.send_mds.remove(&md);
        if !removed {
            for list in node.portals.values_mut() {
                if let Some(idx) = list.iter().position(|e| e.md == md) {
                    list.remove(idx);
                    removed = true;
                    break;
                }
            }
        }
        if !removed {
            return Err(RpcError::Transport {
                op: "unlink",
                code: ENOENT,
            });
        }
        state.stats.unlinks += 1;
        trace!(nid = self.nid, %md, "descriptor unlinked");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recv_spec(portal: Portal, bits: MatchBits, region: &Region) -> RecvSpec {
        RecvSpec {
            portal,
            match_bits: bits,
            ignore_bits: 0,
            region: region.clone(),
            threshold: Threshold::Count(1),
            queue: QueueKind::ReplyReceived,
            token: 42,
            position: InsertPosition::Back,
            manage_offset: false,
        }
    }

    fn send_spec(dest: Nid, portal: Portal, bits: MatchBits, data: &[u8], ack: bool) -> SendSpec {
        SendSpec {
            region: Region::from_vec(data.to_vec()),
            dest,
            portal,
            match_bits: bits,
            ack,
            queue: QueueKind::RequestSent,
            token: 7,
        }
    }

    #[test]
    fn test_put_matches_descriptor_and_emits_events() {
        let net = SimNetwork::new();
        let (a, mut a_rx) = net.attach(1);
        let (b, mut b_rx) = net.attach(2);

        let region = Region::from_vec(vec![0u8; 16]);
        let md = b.post_receive(recv_spec(5, 99, &region)).unwrap();
        a.send(send_spec(2, 5, 99, b"hello", false)).unwrap();

        let put = b_rx.try_recv().unwrap();
        assert_eq!(put.kind, EventKind::Put);
        assert_eq!(put.md, md);
        assert_eq!(put.token, 42);
        assert_eq!(put.mlength, 5);
        assert_eq!(put.initiator, 1);
        assert_eq!(region.read_at(0, 5).unwrap(), b"hello");

        let sent = a_rx.try_recv().unwrap();
        assert_eq!(sent.kind, EventKind::Sent);
        assert!(a_rx.try_recv().is_err());

        // Threshold of one: the descriptor unlinked itself.
        assert!(!net.is_linked(2, md));
        assert_eq!(net.stats().auto_unlinks, 1);
    }

    #[test]
    fn test_unmatched_message_is_dropped() {
        let net = SimNetwork::new();
        let (a, mut a_rx) = net.attach(1);
        let (_b, mut b_rx) = net.attach(2);

        a.send(send_spec(2, 5, 1, b"lost", true)).unwrap();
        assert!(b_rx.try_recv().is_err());
        assert_eq!(a_rx.try_recv().unwrap().kind, EventKind::Sent);
        assert!(a_rx.try_recv().is_err());
        assert_eq!(net.stats().dropped, 1);
    }

    #[test]
    fn test_ack_follows_sent() {
        let net = SimNetwork::new();
        let (a, mut a_rx) = net.attach(1);
        let (b, _b_rx) = net.attach(2);
        let region = Region::from_vec(vec![0u8; 8]);
        b.post_receive(recv_spec(6, 3, &region)).unwrap();

        let md = a.send(send_spec(2, 6, 3, b"bulk", true)).unwrap();
        assert_eq!(a_rx.try_recv().unwrap().kind, EventKind::Sent);
        assert_eq!(a_rx.try_recv().unwrap().kind, EventKind::Ack);
        assert!(!net.is_linked(1, md));
    }

    #[test]
    fn test_dropped_ack_keeps_send_descriptor() {
        let net = SimNetwork::new();
        let (a, mut a_rx) = net.attach(1);
        let (b, _b_rx) = net.attach(2);
        let region = Region::from_vec(vec![0u8; 8]);
        b.post_receive(recv_spec(6, 3, &region)).unwrap();
        net.set_drop_acks(true);

        let md = a.send(send_spec(2, 6, 3, b"bulk", true)).unwrap();
        assert_eq!(a_rx.try_recv().unwrap().kind, EventKind::Sent);
        assert!(a_rx.try_recv().is_err());
        assert!(net.is_linked(1, md));
        a.unlink(md).unwrap();
        assert!(!net.is_linked(1, md));
    }

    #[test]
    fn test_managed_offset_appends_and_truncates() {
        let net = SimNetwork::new();
        let (a, _a_rx) = net.attach(1);
        let (b, mut b_rx) = net.attach(2);
        let region = Region::from_vec(vec![0u8; 10]);
        let mut spec = recv_spec(4, 0, &region);
        spec.ignore_bits = !0;
        spec.threshold = Threshold::Infinite;
        spec.manage_offset = true;
        b.post_receive(spec).unwrap();

        a.send(send_spec(2, 4, 11, b"abcdef", false)).unwrap();
        a.send(send_spec(2, 4, 12, b"ghijkl", false)).unwrap();

        let first = b_rx.try_recv().unwrap();
        assert_eq!((first.offset, first.mlength), (0, 6));
        let second = b_rx.try_recv().unwrap();
        assert_eq!((second.offset, second.mlength, second.rlength), (6, 4, 6));
        assert!(second.is_truncated());
        assert_eq!(region.to_vec(), b"abcdefghij");
        assert_eq!(net.stats().truncated, 1);
    }

    #[test]
    fn test_insert_after_orders_match_list() {
        let net = SimNetwork::new();
        let (b, _rx) = net.attach(2);
        let region = Region::from_vec(vec![0u8; 4]);
        let first = b.post_receive(recv_spec(4, 0, &region)).unwrap();
        let third = b.post_receive(recv_spec(4, 0, &region)).unwrap();
        let mut spec = recv_spec(4, 0, &region);
        spec.position = InsertPosition::After(first);
        let second = b.post_receive(spec).unwrap();
        assert_eq!(net.match_list(2, 4), vec![first, second, third]);
    }

    #[test]
    fn test_unlink_unknown_descriptor() {
        let net = SimNetwork::new();
        let (a, _rx) = net.attach(1);
        let err = a.unlink(MdHandle(12345)).unwrap_err();
        assert!(matches!(err, RpcError::Transport { code: ENOENT, .. }));
    }

    #[test]
    fn test_held_deliveries_wait_for_release() {
        let net = SimNetwork::new();
        let (a, mut a_rx) = net.attach(1);
        let (b, mut b_rx) = net.attach(2);
        let region = Region::from_vec(vec![0u8; 8]);
        b.post_receive(recv_spec(4, 9, &region)).unwrap();
        net.set_hold_deliveries(true);

        a.send(send_spec(2, 4, 9, b"late", false)).unwrap();
        assert_eq!(net.held_count(), 1);
        assert!(a_rx.try_recv().is_err());
        assert!(b_rx.try_recv().is_err());

        assert_eq!(net.release_held(), 1);
        assert_eq!(b_rx.try_recv().unwrap().kind, EventKind::Put);
        assert_eq!(a_rx.try_recv().unwrap().kind, EventKind::Sent);
    }

    #[test]
    fn test_unlinked_descriptor_gets_no_delivery() {
        let net = SimNetwork::new();
        let (a, _a_rx) = net.attach(1);
        let (b, mut b_rx) = net.attach(2);
        let region = Region::from_vec(vec![0u8; 8]);
        let md = b.post_receive(recv_spec(4, 9, &region)).unwrap();
        net.set_hold_deliveries(true);
        a.send(send_spec(2, 4, 9, b"late", false)).unwrap();
        b.unlink(md).unwrap();
        net.release_held();
        assert!(b_rx.try_recv().is_err());
        assert_eq!(region.to_vec(), vec![0u8; 8]);
    }

    #[test]
    fn test_fault_injection() {
        let net = SimNetwork::new();
        let (a, mut a_rx) = net.attach(1);
        let region = Region::from_vec(vec![0u8; 8]);

        net.fail_post_after(1);
        assert!(a.post_receive(recv_spec(4, 0, &region)).is_ok());
        assert!(matches!(
            a.post_receive(recv_spec(4, 0, &region)),
            Err(RpcError::Transport { code: ENOMEM, .. })
        ));
        assert!(a.post_receive(recv_spec(4, 0, &region)).is_ok());

        net.fail_next_send(-5);
        assert!(matches!(
            a.send(send_spec(2, 4, 0, b"x", false)),
            Err(RpcError::Transport { op: "send", code: -5 })
        ));

        net.fail_next_completion(-110);
        a.send(send_spec(2, 4, 0, b"x", false)).unwrap();
        let sent = a_rx.try_recv().unwrap();
        assert_eq!(sent.kind, EventKind::Sent);
        assert_eq!(sent.status, -110);
    }
}
