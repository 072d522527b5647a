//! Fabric primitives the RPC core is built on.
//!
//! A fabric exposes three non-blocking operations: attach a receive descriptor to a
//! portal, push a buffer to a remote portal, and unlink a descriptor. Completions are
//! never returned synchronously; they arrive later as [`CompletionEvent`]s on the
//! channel handed to [`crate::transport::Transport::start`].

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::dispatch::QueueKind;
use crate::error::{Result, RpcError};

/// Fabric node identifier.
pub type Nid = u32;

/// Numbered channel a descriptor is attached to.
pub type Portal = u32;

/// Tag carried by every message and compared against receive descriptors.
pub type MatchBits = u64;

/// Handle to a descriptor registered with the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MdHandle(pub u64);

impl std::fmt::Display for MdHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "md#{}", self.0)
    }
}

/// Kind of completion reported by the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// An outgoing buffer has left the node.
    Sent,
    /// The remote side acknowledged an outgoing buffer.
    Ack,
    /// Data was deposited into a receive descriptor.
    Put,
}

/// A completion record delivered by the fabric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionEvent {
    /// What happened.
    pub kind: EventKind,
    /// Queue role the descriptor was bound to.
    pub queue: QueueKind,
    /// Descriptor the event belongs to.
    pub md: MdHandle,
    /// Caller-supplied context token of the descriptor.
    pub token: u64,
    /// Offset into the descriptor's buffer where data landed.
    pub offset: usize,
    /// Bytes actually deposited (or sent).
    pub mlength: usize,
    /// Bytes the initiator asked to move.
    pub rlength: usize,
    /// Node that initiated the transfer.
    pub initiator: Nid,
    /// Match bits carried by the message.
    pub match_bits: MatchBits,
    /// Zero on success, negative fabric error code otherwise.
    pub status: i32,
}

impl CompletionEvent {
    /// True when fewer bytes were deposited than the initiator sent.
    pub fn is_truncated(&self) -> bool {
        self.mlength < self.rlength
    }
}

/// A shared byte buffer registered with the fabric.
///
/// The region is reference counted: the descriptor holds one reference and the
/// owner another, so the memory stays valid until the last holder lets go even if
/// a delivery races with an unlink.
#[derive(Debug, Clone)]
pub struct Region {
    buf: Arc<Mutex<Vec<u8>>>,
    len: usize,
}

impl Region {
    /// Allocates a zeroed region, reporting allocation failure instead of aborting.
    pub fn allocate(len: usize, what: &'static str) -> Result<Self> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|_| RpcError::Allocation { what, size: len })?;
        buf.resize(len, 0);
        Ok(Self::from_vec(buf))
    }

    /// Wraps an existing buffer.
    pub fn from_vec(buf: Vec<u8>) -> Self {
        let len = buf.len();
        Self {
            buf: Arc::new(Mutex::new(buf)),
            len,
        }
    }

    /// Capacity of the region in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for a zero-length region.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies `len` bytes starting at `offset` out of the region.
    pub fn read_at(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        let buf = self.buf.lock().ok()?;
        let end = offset.checked_add(len)?;
        if end > buf.len() {
            return None;
        }
        Some(buf[offset..end].to_vec())
    }

    /// Writes `data` at `offset`; fails if it would run past the end.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> bool {
        let mut buf = match self.buf.lock() {
            Ok(b) => b,
            Err(_) => return false,
        };
        let end = match offset.checked_add(data.len()) {
            Some(end) if end <= buf.len() => end,
            _ => return false,
        };
        buf[offset..end].copy_from_slice(data);
        true
    }

    /// Copies the whole region.
    pub fn to_vec(&self) -> Vec<u8> {
        self.read_at(0, self.len).unwrap_or_default()
    }

    /// Number of live references to the underlying memory.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.buf)
    }

    /// True if both handles refer to the same memory.
    pub fn same_memory(&self, other: &Region) -> bool {
        Arc::ptr_eq(&self.buf, &other.buf)
    }
}

/// How many deliveries a receive descriptor accepts before it unlinks itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Threshold {
    /// Unlink after this many operations.
    Count(u32),
    /// Stay linked until explicitly unlinked.
    Infinite,
}

/// Where a new receive descriptor is placed in its portal's match list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPosition {
    /// Append to the end of the list.
    Back,
    /// Insert directly after an existing descriptor.
    After(MdHandle),
}

/// Parameters for [`Fabric::post_receive`].
#[derive(Debug, Clone)]
pub struct RecvSpec {
    /// Portal to attach to.
    pub portal: Portal,
    /// Bits an incoming message must carry.
    pub match_bits: MatchBits,
    /// Bits excluded from matching.
    pub ignore_bits: MatchBits,
    /// Buffer that receives the data.
    pub region: Region,
    /// Operation budget of the descriptor.
    pub threshold: Threshold,
    /// Queue role events are reported on.
    pub queue: QueueKind,
    /// Context token echoed in every event.
    pub token: u64,
    /// Placement in the match list.
    pub position: InsertPosition,
    /// Successive deliveries append instead of overwriting offset zero.
    pub manage_offset: bool,
}

/// Parameters for [`Fabric::send`].
#[derive(Debug, Clone)]
pub struct SendSpec {
    /// Data to push.
    pub region: Region,
    /// Destination node.
    pub dest: Nid,
    /// Destination portal.
    pub portal: Portal,
    /// Match bits carried by the message.
    pub match_bits: MatchBits,
    /// Ask the target to acknowledge the delivery.
    pub ack: bool,
    /// Queue role events are reported on.
    pub queue: QueueKind,
    /// Context token echoed in every event.
    pub token: u64,
}

/// Transport primitives supplied by the underlying network.
///
/// Every operation returns immediately; results arrive as completion events.
pub trait Fabric: Send + Sync + 'static {
    /// Node id of this endpoint.
    fn local_nid(&self) -> Nid;

    /// Attaches a receive descriptor.
    fn post_receive(&self, spec: RecvSpec) -> Result<MdHandle>;

    /// Pushes a buffer to a remote portal.
    fn send(&self, spec: SendSpec) -> Result<MdHandle>;

    /// Unlinks a descriptor. Once this returns `Ok`, no further delivery lands in it.
    fn unlink(&self, md: MdHandle) -> Result<()>;
}
