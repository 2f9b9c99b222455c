//! Property tests for the codec: signature grammar and message framing
//! round-trips over arbitrary inputs.

use bytes::Bytes;
use proptest::prelude::*;
use qibus_proto::{ByteReader, ByteWriter, Kind, Message, Type, Value, DEFAULT_MAX_PAYLOAD};

/// Strategy producing arbitrary signature type trees.
fn arb_type() -> impl Strategy<Value = Type> {
    let leaf = prop::sample::select(vec![
        Type::Bool,
        Type::Int8,
        Type::UInt8,
        Type::Int16,
        Type::UInt16,
        Type::Int32,
        Type::UInt32,
        Type::Int64,
        Type::UInt64,
        Type::Float32,
        Type::Float64,
        Type::String,
        Type::Value,
        Type::Void,
        Type::Object,
        Type::Unknown,
    ]);
    leaf.prop_recursive(4, 24, 4, |inner| {
        prop_oneof![
            inner.clone().prop_map(|t| Type::List(Box::new(t))),
            (inner.clone(), inner.clone())
                .prop_map(|(k, v)| Type::Map(Box::new(k), Box::new(v))),
            prop::collection::vec(inner.clone(), 0..4).prop_map(Type::Tuple),
            (
                "[A-Za-z][A-Za-z0-9_]{0,8}",
                prop::collection::vec(("[a-z][a-z0-9_]{0,8}".prop_map(String::from), inner), 1..4),
            )
                .prop_map(|(name, fields)| Type::Struct { name, fields }),
        ]
    })
}

proptest! {
    /// parse(print(T)) == T for every type the parser can produce.
    #[test]
    fn signature_print_parse_round_trip(ty in arb_type()) {
        let printed = ty.signature();
        let parsed = Type::parse(&printed).unwrap();
        prop_assert_eq!(parsed, ty);
    }

    /// Messages survive serialize/parse with arbitrary headers and payloads.
    #[test]
    fn message_round_trip(
        id in any::<u32>(),
        service in any::<u32>(),
        object in any::<u32>(),
        action in any::<u32>(),
        kind_raw in 1u8..=8,
        payload in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        let kind = Kind::from_u8(kind_raw).unwrap();
        let msg = Message::new(kind, id, service, object, action, Bytes::from(payload));
        let parsed = Message::from_bytes(&msg.to_bytes()).unwrap();
        prop_assert_eq!(parsed, msg);
    }

    /// Truncating a serialized message anywhere always errors, never panics.
    #[test]
    fn truncated_message_errors(
        payload in prop::collection::vec(any::<u8>(), 0..64),
        cut in any::<prop::sample::Index>(),
    ) {
        let msg = Message::new(Kind::Call, 1, 2, 3, 4, Bytes::from(payload));
        let bytes = msg.to_bytes();
        let cut = cut.index(bytes.len().max(1));
        if cut < bytes.len() {
            prop_assert!(Message::from_bytes(&bytes[..cut]).is_err());
        }
    }

    /// Scalar values round-trip through the dynamic value codec.
    #[test]
    fn value_round_trip(v in prop_oneof![
        any::<bool>().prop_map(Value::from_bool),
        any::<i32>().prop_map(Value::from_i32),
        any::<u32>().prop_map(Value::from_u32),
        any::<i64>().prop_map(Value::from_i64),
        any::<u64>().prop_map(Value::from_u64),
        "[ -~]{0,64}".prop_map(|s| Value::from_string(&s)),
    ]) {
        let mut w = ByteWriter::new();
        v.write(&mut w);
        let buf = w.into_vec();
        let mut r = ByteReader::new(&buf);
        let back = Value::read(&mut r).unwrap();
        prop_assert_eq!(back, v);
        prop_assert_eq!(r.remaining(), 0);
    }

    /// Arbitrary bytes fed to the value reader never panic.
    #[test]
    fn value_reader_handles_garbage(buf in prop::collection::vec(any::<u8>(), 0..128)) {
        let mut r = ByteReader::new(&buf);
        let _ = Value::read(&mut r);
    }
}

#[tokio::test]
async fn async_framing_matches_sync_parsing() {
    let msg = Message::new(Kind::Event, 9, 1, 1, 0x66, Bytes::from_static(b"\x0c\x00\x00\x00"));
    let mut buf = Vec::new();
    msg.write(&mut buf).await.unwrap();
    assert_eq!(Message::from_bytes(&buf).unwrap(), msg);

    let mut cursor = std::io::Cursor::new(buf);
    let read = Message::read(&mut cursor, DEFAULT_MAX_PAYLOAD).await.unwrap();
    assert_eq!(read, msg);
}
