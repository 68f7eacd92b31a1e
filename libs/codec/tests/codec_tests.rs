//! # Lattice Codec Integration Tests
//!
//! Verifies the public encoding API end to end:
//! - Round-trip law for registered types, including nested messages
//! - Connection-local type ids primed by ADD_TYPE announcements
//! - UnknownType surfaces to the caller instead of being coerced

use bytes::BytesMut;
use lattice_codec::{
    decode_message, encode_message, message, CodecError, Deserializer, FrameHeader, Message,
    Result, Serializer, TypeLookupTable, TypeRegistry, WireType,
};
use lattice_types::{
    ActorAddr, ActorId, Atom, DownMsg, ExitReason, MessageId, NodeId, HOST_ID_SIZE,
};
use proptest::prelude::*;

#[derive(Debug, Clone, PartialEq, Default)]
struct Quote {
    symbol: String,
    bid: f64,
    size: u32,
}

impl WireType for Quote {
    fn serialize(&self, sink: &mut Serializer<'_>) -> Result<()> {
        sink.write_str(&self.symbol);
        sink.write_f64(self.bid);
        sink.write_u32(self.size);
        Ok(())
    }

    fn deserialize(source: &mut Deserializer<'_>) -> Result<Self> {
        Ok(Quote {
            symbol: source.read_string()?,
            bid: source.read_f64()?,
            size: source.read_u32()?,
        })
    }
}

fn registry_with_quote() -> TypeRegistry {
    let registry = TypeRegistry::new();
    registry.announce::<Quote>("Quote").unwrap();
    registry
}

fn node(pid: u32) -> NodeId {
    NodeId::new(pid, [pid as u8; HOST_ID_SIZE])
}

#[test]
fn test_system_messages_roundtrip() {
    let registry = TypeRegistry::new();
    let source = ActorAddr::new(ActorId::from_raw(9), node(3));
    let msg = message![
        DownMsg {
            source,
            reason: ExitReason::new(42)
        },
        source,
        node(4),
        ExitReason::USER_SHUTDOWN,
        MessageId::request(5),
        (),
    ];

    let bytes = encode_message(&registry, &msg).unwrap();
    assert_eq!(decode_message(&registry, &bytes).unwrap(), msg);
}

#[test]
fn test_nested_message_with_user_type() {
    let registry = registry_with_quote();
    let quote = Quote {
        symbol: "XYZ".into(),
        bid: 10.25,
        size: 300,
    };
    let inner = message![Atom::from("quote"), quote];
    let outer = message![Atom::from("batch"), inner, vec![1u8, 2, 3], true];

    let bytes = encode_message(&registry, &outer).unwrap();
    let decoded = decode_message(&registry, &bytes).unwrap();
    assert_eq!(decoded, outer);

    let nested = decoded.get::<Message>(1).unwrap();
    assert_eq!(nested.get::<Quote>(1).unwrap().size, 300);
}

#[test]
fn test_address_wire_format_is_28_bytes() {
    let registry = TypeRegistry::new();
    let addr = ActorAddr::new(ActorId::from_raw(0x01020304), node(7));
    let mut buf = BytesMut::new();
    Serializer::new(&mut buf, &registry).write_addr(&addr);
    assert_eq!(buf.len(), ActorAddr::WIRE_SIZE);
    assert_eq!(&buf[..4], &[1, 2, 3, 4]);
    assert_eq!(&buf[4..8], &7u32.to_be_bytes());
}

#[test]
fn test_unknown_type_is_reported() {
    let sender_side = registry_with_quote();
    let receiver_side = TypeRegistry::new();
    let msg = message![Quote::default()];

    let bytes = encode_message(&sender_side, &msg).unwrap();
    let err = decode_message(&receiver_side, &bytes).unwrap_err();
    assert!(err.is_unknown_type(), "unexpected error: {err}");

    let err = encode_message(&receiver_side, &msg).unwrap_err();
    assert!(matches!(err, CodecError::UnknownType { .. }));
}

#[test]
fn test_type_ids_after_announcements() {
    let registry = TypeRegistry::new();
    let mut outgoing = TypeLookupTable::new();
    let header = FrameHeader::new(
        ActorAddr::new(ActorId::from_raw(1), node(1)),
        ActorAddr::new(ActorId::from_raw(2), node(2)),
        MessageId::ASYNC,
    );
    let msg = message![Atom::from("ping"), 1i32];

    let mut first = BytesMut::new();
    {
        let mut sink = Serializer::new(&mut first, &registry).with_type_table(&mut outgoing);
        header.write_to(&mut sink).unwrap();
        sink.write_message(&msg).unwrap();
    }
    let announcements = outgoing.take_announcements();
    assert_eq!(announcements.len(), 2);

    // Without the announcements, the receiver cannot resolve the ids.
    let mut incoming = TypeLookupTable::new();
    let err = FrameHeader::read_from(
        &mut Deserializer::new(&first, &registry).with_type_table(&incoming),
    )
    .unwrap_err();
    assert!(matches!(err, CodecError::UnknownTypeId { .. }));

    for (id, name) in announcements {
        incoming
            .register_incoming(id, registry.lookup(&name).unwrap())
            .unwrap();
    }
    let mut source = Deserializer::new(&first, &registry).with_type_table(&incoming);
    assert_eq!(FrameHeader::read_from(&mut source).unwrap(), header);
    assert_eq!(source.read_message().unwrap(), msg);
    assert!(source.is_exhausted());

    // A second frame reuses the ids and announces nothing new.
    let mut second = BytesMut::new();
    {
        let mut sink = Serializer::new(&mut second, &registry).with_type_table(&mut outgoing);
        header.write_to(&mut sink).unwrap();
        sink.write_message(&msg).unwrap();
    }
    assert!(!outgoing.has_pending());
    assert_eq!(second.len(), first.len());
}

#[test]
fn test_truncated_input_fails_cleanly() {
    let registry = TypeRegistry::new();
    let bytes = encode_message(&registry, &message![String::from("hello"), 7u64]).unwrap();
    for cut in 0..bytes.len() {
        assert!(decode_message(&registry, &bytes[..cut]).is_err());
    }
}

fn leaf() -> impl Strategy<Value = Message> {
    (
        any::<i32>(),
        any::<u64>(),
        any::<bool>(),
        "[a-z]{0,12}",
        proptest::collection::vec(any::<u8>(), 0..16),
        any::<i16>(),
    )
        .prop_map(|(a, b, c, s, blob, d)| message![a, b, c, s, blob, d])
}

proptest! {
    #[test]
    fn prop_roundtrip_mixed_messages(
        inner in leaf(),
        symbol in "[A-Z]{1,6}",
        bid in -1.0e6f64..1.0e6,
        size in any::<u32>(),
        pid in 1u32..1000,
    ) {
        let registry = registry_with_quote();
        let quote = Quote { symbol, bid, size };
        let addr = ActorAddr::new(ActorId::from_raw(size), node(pid));
        let msg = message![Atom::from("mixed"), quote, inner, addr];

        let bytes = encode_message(&registry, &msg).unwrap();
        let decoded = decode_message(&registry, &bytes).unwrap();

        let info = registry.tuple_for(&msg).unwrap();
        prop_assert!(info.equals(&decoded, &msg));
        prop_assert_eq!(decoded, msg);
    }
}
