//! Message header and the marshal capability.
//!
//! Every request and reply starts with a [`MessageHeader`]. The body layout belongs
//! to the caller; the core only needs something implementing [`Marshal`]. The
//! default [`BincodeMarshal`] encodes `(header, body)` with bincode.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RpcError};

/// Header preceding every request and reply body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Operation code chosen by the caller.
    pub opcode: u32,
    /// Transaction id of the exchange.
    pub xid: u64,
    /// Zero on requests and successful replies; responder-defined otherwise.
    pub status: i32,
}

impl MessageHeader {
    /// Header for an outgoing request.
    pub fn request(opcode: u32, xid: u64) -> Self {
        Self {
            opcode,
            xid,
            status: 0,
        }
    }

    /// Header answering `request` with `status`.
    pub fn reply_to(request: &MessageHeader, status: i32) -> Self {
        Self {
            opcode: request.opcode,
            xid: request.xid,
            status,
        }
    }
}

/// A decoded reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply<T> {
    /// Reply header as sent by the responder.
    pub header: MessageHeader,
    /// Decoded reply body.
    pub body: T,
}

/// Packs and unpacks message bodies.
pub trait Marshal: Send + Sync + 'static {
    /// Encodes a header and body into one buffer.
    fn pack<T: Serialize>(&self, header: &MessageHeader, body: &T) -> Result<Vec<u8>>;

    /// Decodes a buffer produced by [`Marshal::pack`].
    fn unpack<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<(MessageHeader, T)>;

    /// Reads only the header of a packed buffer.
    fn peek_header(&self, buf: &[u8]) -> Result<MessageHeader>;
}

/// Bincode-backed [`Marshal`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeMarshal;

impl Marshal for BincodeMarshal {
    fn pack<T: Serialize>(&self, header: &MessageHeader, body: &T) -> Result<Vec<u8>> {
        bincode::serialize(&(header, body)).map_err(|e| RpcError::Pack {
            what: "message",
            reason: e.to_string(),
        })
    }

    fn unpack<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<(MessageHeader, T)> {
        bincode::deserialize(buf).map_err(|e| RpcError::Unpack {
            what: "message",
            reason: e.to_string(),
        })
    }

    fn peek_header(&self, buf: &[u8]) -> Result<MessageHeader> {
        bincode::deserialize(buf).map_err(|e| RpcError::Unpack {
            what: "message header",
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct GetAttr {
        object_id: u64,
        valid: u32,
    }

    #[test]
    fn test_pack_unpack_roundtrip() {
        let marshal = BincodeMarshal;
        let header = MessageHeader::request(3, 17);
        let body = GetAttr {
            object_id: 0xdead_beef,
            valid: !0,
        };
        let buf = marshal.pack(&header, &body).unwrap();
        let (h, b): (MessageHeader, GetAttr) = marshal.unpack(&buf).unwrap();
        assert_eq!(h, header);
        assert_eq!(b, body);
    }

    #[test]
    fn test_peek_header() {
        let marshal = BincodeMarshal;
        let header = MessageHeader::request(9, 1234);
        let buf = marshal.pack(&header, &vec![1u8; 100]).unwrap();
        assert_eq!(marshal.peek_header(&buf).unwrap(), header);
    }

    #[test]
    fn test_unpack_garbage_fails() {
        let marshal = BincodeMarshal;
        let err = marshal.unpack::<GetAttr>(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, RpcError::Unpack { .. }));
    }

    #[test]
    fn test_reply_header_mirrors_request() {
        let request = MessageHeader::request(5, 77);
        let reply = MessageHeader::reply_to(&request, -2);
        assert_eq!(reply.opcode, 5);
        assert_eq!(reply.xid, 77);
        assert_eq!(reply.status, -2);
    }
}
