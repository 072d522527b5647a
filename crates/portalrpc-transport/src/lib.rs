#![warn(missing_docs)]

//! portalrpc transport: request/reply exchanges, bulk transfers and service receive
//! rings over a portal-addressed, event-driven fabric.

pub mod bulk;
pub mod cancel;
pub mod client;
pub mod config;
pub mod deadline;
pub mod dispatch;
pub mod error;
pub mod fabric;
pub mod message;
pub mod metrics;
pub mod request;
pub mod ring;
pub mod service;
pub mod sim;
pub mod transport;

pub use bulk::{BulkEndpoint, BulkProgress, BulkRole, BulkTransfer};
pub use cancel::{new_cancel_pair, CancelHandle, CancelReason, CancelToken};
pub use client::{Destination, LocalHandler, RpcClient};
pub use config::{
    ClientConfig, PeerChannels, RpcConfig, ServiceConfig, DEFAULT_BULK_ACK_TIMEOUT_MS,
    DEFAULT_RING_BUFFER_SIZE, DEFAULT_RING_LENGTH, DEFAULT_SAFETY_MARGIN,
};
pub use deadline::Deadline;
pub use dispatch::{Dispatcher, QueueKind};
pub use error::{Result, RpcError};
pub use fabric::{
    CompletionEvent, EventKind, Fabric, InsertPosition, MatchBits, MdHandle, Nid, Portal,
    RecvSpec, Region, SendSpec, Threshold,
};
pub use message::{BincodeMarshal, Marshal, MessageHeader, Reply};
pub use metrics::{MetricsSnapshot, RpcMetrics};
pub use request::{ExchangeState, Failure, Request};
pub use ring::{ArrivalNote, ServiceRing, SlotState};
pub use service::{Arrival, Service};
pub use sim::{FabricStats, SimNetwork, SimNic};
pub use transport::Transport;
