//! Property-based tests for message framing, regions and configuration.

use proptest::prelude::*;

use portalrpc_transport::{BincodeMarshal, Marshal, MessageHeader, Region, ServiceConfig};

use crate::harness::EchoBody;

fn header_strategy() -> impl Strategy<Value = MessageHeader> {
    (any::<u32>(), any::<u64>(), any::<i32>()).prop_map(|(opcode, xid, status)| MessageHeader {
        opcode,
        xid,
        status,
    })
}

fn body_strategy() -> impl Strategy<Value = EchoBody> {
    (prop::collection::vec(any::<u8>(), 0..2048), any::<u64>())
        .prop_map(|(data, bulk_len)| EchoBody { data, bulk_len })
}

proptest! {
    #[test]
    fn prop_unpack_recovers_packed_message(header in header_strategy(), body in body_strategy()) {
        let buf = BincodeMarshal.pack(&header, &body).unwrap();
        let (h, b): (MessageHeader, EchoBody) = BincodeMarshal.unpack(&buf).unwrap();
        prop_assert_eq!(h, header);
        prop_assert_eq!(b, body);
    }

    #[test]
    fn prop_peek_header_ignores_body(header in header_strategy(), body in body_strategy()) {
        let buf = BincodeMarshal.pack(&header, &body).unwrap();
        prop_assert_eq!(BincodeMarshal.peek_header(&buf).unwrap(), header);
    }

    #[test]
    fn prop_packed_size_tracks_payload(data in prop::collection::vec(any::<u8>(), 0..4096)) {
        let len = data.len();
        let buf = BincodeMarshal
            .pack(&MessageHeader::request(1, 1), &EchoBody::plain(data))
            .unwrap();
        prop_assert_eq!(buf.len(), 32 + len);
    }

    #[test]
    fn prop_truncated_buffer_never_unpacks(header in header_strategy(), body in body_strategy(), cut in any::<prop::sample::Index>()) {
        let buf = BincodeMarshal.pack(&header, &body).unwrap();
        let keep = cut.index(buf.len());
        let res: portalrpc_transport::Result<(MessageHeader, EchoBody)> =
            BincodeMarshal.unpack(&buf[..keep]);
        prop_assert!(res.is_err());
    }

    #[test]
    fn prop_region_write_stays_in_bounds(
        len in 1usize..4096,
        offset in 0usize..5000,
        data in prop::collection::vec(any::<u8>(), 0..1024),
    ) {
        let region = Region::allocate(len, "prop region").unwrap();
        let fits = offset + data.len() <= len;
        prop_assert_eq!(region.write_at(offset, &data), fits);
        if fits {
            prop_assert_eq!(region.read_at(offset, data.len()).unwrap(), data);
        } else {
            prop_assert!(region.to_vec().iter().all(|b| *b == 0));
        }
    }

    #[test]
    fn prop_clones_share_memory(len in 1usize..512, byte in any::<u8>()) {
        let region = Region::allocate(len, "prop region").unwrap();
        let other = region.clone();
        prop_assert!(other.same_memory(&region));
        prop_assert_eq!(region.holders(), 2);
        prop_assert!(other.write_at(len - 1, &[byte]));
        prop_assert_eq!(region.read_at(len - 1, 1).unwrap(), vec![byte]);
    }

    #[test]
    fn prop_margin_must_fit_in_buffer(buffer_size in 0usize..65536, margin in 0usize..65536, ring_length in 0usize..8) {
        let config = ServiceConfig {
            ring_length,
            buffer_size,
            safety_margin: margin,
            ..ServiceConfig::default()
        };
        prop_assert_eq!(config.validate().is_ok(), ring_length > 0 && margin < buffer_size);
    }
}
