//! Configuration for clients, services and the channels between them.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RpcError};
use crate::fabric::{Nid, Portal};

/// Default number of receive buffers in a service ring.
pub const DEFAULT_RING_LENGTH: usize = 32;
/// Default size of one ring buffer.
pub const DEFAULT_RING_BUFFER_SIZE: usize = 16 * 1024;
/// Free space below which a ring buffer stops accepting requests.
pub const DEFAULT_SAFETY_MARGIN: usize = 1024;
/// Default wait of a bulk source for its acknowledgement.
pub const DEFAULT_BULK_ACK_TIMEOUT_MS: u64 = 10_000;

/// Addressing of a peer: its node id and the portals of each sub-channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerChannels {
    /// Remote node id.
    pub nid: Nid,
    /// Portal requests are sent to.
    pub request_portal: Portal,
    /// Portal replies come back on.
    pub reply_portal: Portal,
    /// Portal bulk payloads travel on.
    pub bulk_portal: Portal,
}

impl Default for PeerChannels {
    fn default() -> Self {
        Self {
            nid: 0,
            request_portal: 6,
            reply_portal: 7,
            bulk_portal: 8,
        }
    }
}

impl PeerChannels {
    /// Default portals towards `nid`.
    pub fn to_node(nid: Nid) -> Self {
        Self {
            nid,
            ..Self::default()
        }
    }
}

/// Client-side tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Give up on a reply after this many milliseconds; `None` waits for cancellation only.
    pub reply_timeout_ms: Option<u64>,
    /// Give up on a bulk payload after this many milliseconds; `None` waits for cancellation only.
    pub bulk_timeout_ms: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reply_timeout_ms: Some(30_000),
            bulk_timeout_ms: Some(30_000),
        }
    }
}

/// Service-side receive ring layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Name used in logs.
    pub name: String,
    /// Number of receive buffers.
    pub ring_length: usize,
    /// Size of each receive buffer.
    pub buffer_size: usize,
    /// A buffer retires once less than this many bytes remain free.
    pub safety_margin: usize,
    /// Portal the ring listens on.
    pub request_portal: Portal,
    /// Portal replies are sent to on the initiator.
    pub reply_portal: Portal,
    /// Portal bulk payloads are sent to on the initiator.
    pub bulk_portal: Portal,
    /// How long a bulk source waits for its acknowledgement.
    pub bulk_ack_timeout_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let channels = PeerChannels::default();
        Self {
            name: String::from("ost"),
            ring_length: DEFAULT_RING_LENGTH,
            buffer_size: DEFAULT_RING_BUFFER_SIZE,
            safety_margin: DEFAULT_SAFETY_MARGIN,
            request_portal: channels.request_portal,
            reply_portal: channels.reply_portal,
            bulk_portal: channels.bulk_portal,
            bulk_ack_timeout_ms: DEFAULT_BULK_ACK_TIMEOUT_MS,
        }
    }
}

impl ServiceConfig {
    /// Checks the ring geometry.
    pub fn validate(&self) -> Result<()> {
        if self.ring_length == 0 {
            return Err(config_error("ring_length must be at least 1"));
        }
        if self.safety_margin >= self.buffer_size {
            return Err(config_error(format!(
                "safety_margin ({}) must be smaller than buffer_size ({})",
                self.safety_margin, self.buffer_size
            )));
        }
        Ok(())
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Client tunables.
    pub client: ClientConfig,
    /// Service ring layout.
    pub service: ServiceConfig,
    /// Peer the client talks to.
    pub channels: PeerChannels,
}

impl RpcConfig {
    /// Loads a `.toml` or `.json` configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: RpcConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| config_error(e.to_string()))?,
            "json" => {
                serde_json::from_str(&contents).map_err(|e| config_error(e.to_string()))?
            }
            _ => {
                return Err(config_error(format!(
                    "unsupported config file extension: {ext}"
                )))
            }
        };
        config.service.validate()?;
        Ok(config)
    }
}

fn config_error(reason: impl Into<String>) -> RpcError {
    RpcError::Config {
        reason: reason.into(),
    }
}
