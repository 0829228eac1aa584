//! Wire-level invariants: round-trip fidelity for every frame type, magic
//! rejection, boundary sizes.

use std::collections::BTreeMap;

use bytes::BytesMut;
use proptest::prelude::*;

use transwarp_wire::{
    Acknowledgement, CodecError, Frame, MessageType, Payload, WireCodec, MAGIC, NO_REPLY_FOR,
};

fn arb_headers() -> impl Strategy<Value = BTreeMap<u8, Vec<u8>>> {
    proptest::collection::btree_map(
        any::<u8>(),
        proptest::collection::vec(any::<u8>(), 0..255),
        0..4,
    )
}

fn arb_frame() -> impl Strategy<Value = Frame> {
    let hello = "[a-z0-9-]{1,32}".prop_map(|token| Frame::hello(&token));
    let ping = (0i32..1_000_000, prop_oneof![Just(NO_REPLY_FOR), 0i32..1_000_000])
        .prop_map(|(sequence, reply_for)| Frame::ping(sequence, reply_for));
    let ack = (any::<i32>(), any::<i32>())
        .prop_map(|(for_sequence, advertised)| Frame::ack(for_sequence, advertised));
    let probe = Just(Frame::probe());
    let payload = (
        0i32..1_000_000,
        "[a-z0-9-]{0,24}",
        any::<u32>(),
        any::<i32>(),
        arb_headers(),
        proptest::collection::vec(any::<u8>(), 0..512),
    )
        .prop_map(|(sequence, session_id, flags, inner, headers, data)| {
            Payload {
                session_id,
                flags,
                sequence: inner,
                headers,
                data,
            }
            .to_frame(sequence)
        });
    let acknowledgement = (
        0i32..1_000_000,
        "[a-z0-9-]{0,24}",
        any::<u32>(),
        proptest::collection::vec(any::<i32>(), 0..64),
    )
        .prop_map(|(sequence, session_id, flags, sequence_list)| {
            Acknowledgement {
                session_id,
                flags,
                sequence_list,
            }
            .to_frame(sequence)
        });
    prop_oneof![hello, ping, ack, probe, payload, acknowledgement]
}

proptest! {
    /// decode(encode(f)) == f for every frame of every type, headers and
    /// payload byte-identical.
    #[test]
    fn every_frame_type_round_trips(frame in arb_frame()) {
        let mut buf = BytesMut::new();
        WireCodec::encode_with_limit(&frame, &mut buf, usize::MAX)?;
        prop_assert_eq!(buf.len(), frame.wire_len());
        let got = WireCodec::decode(&buf)?;
        prop_assert_eq!(got, frame);
    }

    /// Any datagram whose first four bytes differ from the magic is
    /// rejected with the magic error.
    #[test]
    fn foreign_magic_rejected(head in proptest::array::uniform4(any::<u8>()), tail in proptest::collection::vec(any::<u8>(), 11..128)) {
        prop_assume!(head != MAGIC);
        let mut data = head.to_vec();
        data.extend_from_slice(&tail);
        prop_assert!(matches!(WireCodec::decode(&data), Err(CodecError::Magic)));
    }
}

#[test]
fn payload_unit_survives_the_wire_intact() {
    let mut headers = BTreeMap::new();
    headers.insert(3u8, vec![0xAA; 255]);
    let unit = Payload {
        session_id: "sess-0042".into(),
        flags: 7,
        sequence: 19,
        headers,
        data: vec![0x5C; 4096],
    };
    let mut buf = BytesMut::new();
    WireCodec::encode_with_limit(&unit.to_frame(2), &mut buf, usize::MAX).unwrap();
    let frame = WireCodec::decode(&buf).unwrap();
    assert_eq!(frame.message_type, MessageType::Payload);
    assert_eq!(Payload::from_frame(&frame).unwrap(), unit);
}

#[test]
fn off_by_one_magic_is_a_different_protocol() {
    let mut buf = BytesMut::new();
    WireCodec::encode(&Frame::ping(0, NO_REPLY_FOR), &mut buf).unwrap();
    let mut data = buf.to_vec();
    data[3] = 0x01; // 01 02 02 01
    assert!(matches!(WireCodec::decode(&data), Err(CodecError::Magic)));
}
