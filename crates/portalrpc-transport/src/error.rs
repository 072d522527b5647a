use thiserror::Error;

use crate::cancel::CancelReason;
use crate::fabric::EventKind;
use crate::dispatch::QueueKind;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("allocation of {size} bytes failed for {what}")]
    Allocation { what: &'static str, size: usize },

    #[error("cannot pack {what}: {reason}")]
    Pack { what: &'static str, reason: String },

    #[error("cannot unpack {what}: {reason}")]
    Unpack { what: &'static str, reason: String },

    #[error("fabric {op} failed with code {code}")]
    Transport { op: &'static str, code: i32 },

    #[error("reply for xid {xid} truncated: {received} of {sent} bytes fit")]
    TruncatedReply { xid: u64, received: usize, sent: usize },

    #[error("bulk transfer for xid {xid} not acknowledged (sent: {sent})")]
    UnacknowledgedBulk { xid: u64, sent: bool },

    #[error("operation cancelled: {0}")]
    Cancelled(CancelReason),

    #[error("request {xid} timed out after {timeout_ms}ms")]
    RequestTimeout { xid: u64, timeout_ms: u64 },

    #[error("bulk payload for xid {xid} did not arrive within {timeout_ms}ms")]
    BulkTimeout { xid: u64, timeout_ms: u64 },

    #[error("unexpected {kind:?} event on {queue:?} queue")]
    UnexpectedEvent { queue: QueueKind, kind: EventKind },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("configuration error: {reason}")]
    Config { reason: String },

    #[error("transport has been shut down")]
    Shutdown,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RpcError {
    /// Cancellation is a normal way for an exchange to end, not a fault.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, RpcError::Cancelled(_))
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        RpcError::InvalidRequest {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
