//! Property tests for the wire codec
//!
//! Packets written back to back must come out of the incremental decoder
//! unchanged however the byte stream is chunked.

use bytes::{Bytes, BytesMut};
use mqtt_client_engine::protocol::properties::id;
use mqtt_client_engine::protocol::{
    decode_remaining_length, Ack, Codec, ConnAck, Connect, Decoder, Disconnect, LastWill, Packet,
    Properties, PropertyValue, ProtocolError, ProtocolVersion, Publish, QoS, SubAck, Subscribe,
    SubscribeFilter, SubscriptionOptions, UnsubAck, Unsubscribe,
};
use proptest::prelude::*;

const TOPIC: &str = "[a-z0-9]{1,8}(/[a-z0-9]{1,8}){0,3}";
const FILTER: &str = "[a-z0-9]{1,8}(/([a-z0-9]{1,8}|\\+)){0,2}(/#)?";

fn qos_strategy() -> impl Strategy<Value = QoS> {
    prop_oneof![
        Just(QoS::AtMostOnce),
        Just(QoS::AtLeastOnce),
        Just(QoS::ExactlyOnce)
    ]
}

fn packet_id() -> impl Strategy<Value = u16> {
    1u16..=u16::MAX
}

fn property_strategy() -> impl Strategy<Value = (u8, PropertyValue)> {
    prop_oneof![
        any::<u8>().prop_map(|v| (id::PAYLOAD_FORMAT_INDICATOR, PropertyValue::Byte(v))),
        any::<u16>().prop_map(|v| (id::TOPIC_ALIAS, PropertyValue::TwoByteInt(v))),
        any::<u32>().prop_map(|v| (id::MESSAGE_EXPIRY_INTERVAL, PropertyValue::FourByteInt(v))),
        (1u32..=268_435_455).prop_map(|v| (id::SUBSCRIPTION_IDENTIFIER, PropertyValue::VarInt(v))),
        "[a-z/]{0,12}".prop_map(|v| (id::CONTENT_TYPE, PropertyValue::Utf8(v))),
        proptest::collection::vec(any::<u8>(), 0..16)
            .prop_map(|v| (id::CORRELATION_DATA, PropertyValue::Binary(Bytes::from(v)))),
        ("[a-z]{1,6}", "[a-z0-9]{0,6}")
            .prop_map(|(k, v)| (id::USER_PROPERTY, PropertyValue::Utf8Pair(k, v))),
    ]
}

/// Properties only exist on the wire in MQTT 5
fn properties_strategy(version: ProtocolVersion) -> BoxedStrategy<Properties> {
    if version.is_v5() {
        proptest::collection::vec(property_strategy(), 0..4)
            .prop_map(|items| {
                items
                    .into_iter()
                    .fold(Properties::new(), |props, (id, value)| props.with(id, value))
            })
            .boxed()
    } else {
        Just(Properties::default()).boxed()
    }
}

fn will_strategy(version: ProtocolVersion) -> impl Strategy<Value = LastWill> {
    (
        TOPIC,
        proptest::collection::vec(any::<u8>(), 0..32),
        qos_strategy(),
        any::<bool>(),
        properties_strategy(version),
    )
        .prop_map(|(topic, payload, qos, retain, properties)| LastWill {
            topic,
            payload: Bytes::from(payload),
            qos,
            retain,
            properties,
        })
}

fn connect_strategy(version: ProtocolVersion) -> impl Strategy<Value = Packet> {
    (
        "[a-zA-Z0-9_-]{0,23}",
        any::<bool>(),
        any::<u16>(),
        proptest::option::of("[a-z]{1,8}"),
        proptest::option::of(proptest::collection::vec(any::<u8>(), 0..16)),
        proptest::option::of(will_strategy(version)),
        properties_strategy(version),
    )
        .prop_map(
            move |(client_id, clean_start, keep_alive, username, password, will, properties)| {
                // 3.1.1 only allows a password alongside a user name
                let password = match (&username, version.is_v5()) {
                    (None, false) => None,
                    _ => password.map(Bytes::from),
                };
                Packet::Connect(Connect {
                    protocol: version,
                    client_id,
                    clean_start,
                    keep_alive,
                    username,
                    password,
                    will,
                    properties,
                })
            },
        )
}

fn publish_strategy(version: ProtocolVersion) -> impl Strategy<Value = Packet> {
    (
        TOPIC,
        proptest::collection::vec(any::<u8>(), 0..512),
        qos_strategy(),
        any::<bool>(),
        any::<bool>(),
        packet_id(),
        properties_strategy(version),
    )
        .prop_map(|(topic, payload, qos, retain, dup, id, properties)| {
            let acknowledged = qos != QoS::AtMostOnce;
            Packet::Publish(Publish {
                dup: dup && acknowledged,
                qos,
                retain,
                topic,
                packet_id: acknowledged.then_some(id),
                payload: Bytes::from(payload),
                properties,
            })
        })
}

fn ack_strategy(version: ProtocolVersion) -> BoxedStrategy<Ack> {
    if version.is_v5() {
        (packet_id(), any::<u8>(), properties_strategy(version))
            .prop_map(|(packet_id, reason_code, properties)| Ack {
                packet_id,
                reason_code,
                properties,
            })
            .boxed()
    } else {
        packet_id().prop_map(Ack::new).boxed()
    }
}

fn subscribe_strategy(version: ProtocolVersion) -> impl Strategy<Value = Packet> {
    let filter = (FILTER, qos_strategy(), any::<bool>(), any::<bool>(), 0u8..=2).prop_map(
        move |(filter, qos, no_local, retain_as_published, retain_handling)| {
            let options = if version.is_v5() {
                SubscriptionOptions {
                    qos,
                    no_local,
                    retain_as_published,
                    retain_handling,
                }
            } else {
                SubscriptionOptions::with_qos(qos)
            };
            SubscribeFilter { filter, options }
        },
    );
    (
        packet_id(),
        proptest::collection::vec(filter, 1..4),
        properties_strategy(version),
    )
        .prop_map(|(packet_id, filters, properties)| {
            Packet::Subscribe(Subscribe {
                packet_id,
                filters,
                properties,
            })
        })
}

fn suback_strategy(version: ProtocolVersion) -> impl Strategy<Value = Packet> {
    let code = prop_oneof![0u8..=2, 0x80u8..=0xFF];
    (
        packet_id(),
        proptest::collection::vec(code, 1..4),
        properties_strategy(version),
    )
        .prop_map(|(packet_id, return_codes, properties)| {
            Packet::SubAck(SubAck {
                packet_id,
                return_codes,
                properties,
            })
        })
}

fn unsubscribe_strategy(version: ProtocolVersion) -> impl Strategy<Value = Packet> {
    (
        packet_id(),
        proptest::collection::vec(FILTER, 1..4),
        properties_strategy(version),
    )
        .prop_map(|(packet_id, filters, properties)| {
            Packet::Unsubscribe(Unsubscribe {
                packet_id,
                filters,
                properties,
            })
        })
}

fn unsuback_strategy(version: ProtocolVersion) -> BoxedStrategy<Packet> {
    if version.is_v5() {
        (
            packet_id(),
            proptest::collection::vec(any::<u8>(), 1..4),
            properties_strategy(version),
        )
            .prop_map(|(packet_id, reason_codes, properties)| {
                Packet::UnsubAck(UnsubAck {
                    packet_id,
                    reason_codes,
                    properties,
                })
            })
            .boxed()
    } else {
        packet_id()
            .prop_map(|packet_id| {
                Packet::UnsubAck(UnsubAck {
                    packet_id,
                    reason_codes: Vec::new(),
                    properties: Properties::default(),
                })
            })
            .boxed()
    }
}

fn disconnect_strategy(version: ProtocolVersion) -> BoxedStrategy<Packet> {
    if version.is_v5() {
        (any::<u8>(), properties_strategy(version))
            .prop_map(|(reason_code, properties)| {
                Packet::Disconnect(Disconnect {
                    reason_code,
                    properties,
                })
            })
            .boxed()
    } else {
        Just(Packet::Disconnect(Disconnect::default())).boxed()
    }
}

fn packet_strategy(version: ProtocolVersion) -> BoxedStrategy<Packet> {
    prop_oneof![
        connect_strategy(version),
        (any::<bool>(), any::<u8>(), properties_strategy(version)).prop_map(
            |(session_present, code, properties)| Packet::ConnAck(ConnAck {
                session_present,
                code,
                properties,
            })
        ),
        publish_strategy(version),
        ack_strategy(version).prop_map(Packet::PubAck),
        ack_strategy(version).prop_map(Packet::PubRec),
        ack_strategy(version).prop_map(Packet::PubRel),
        ack_strategy(version).prop_map(Packet::PubComp),
        subscribe_strategy(version),
        suback_strategy(version),
        unsubscribe_strategy(version),
        unsuback_strategy(version),
        Just(Packet::PingReq),
        Just(Packet::PingResp),
        disconnect_strategy(version),
    ]
    .boxed()
}

fn version_strategy() -> impl Strategy<Value = ProtocolVersion> {
    prop_oneof![Just(ProtocolVersion::V311), Just(ProtocolVersion::V5)]
}

/// A protocol version together with packets valid for it
fn versioned_packets(max: usize) -> impl Strategy<Value = (ProtocolVersion, Vec<Packet>)> {
    version_strategy().prop_flat_map(move |version| {
        (
            Just(version),
            proptest::collection::vec(packet_strategy(version), 1..max),
        )
    })
}

proptest! {
    #[test]
    fn every_packet_decodes_to_what_was_encoded((version, packets) in versioned_packets(2)) {
        let codec = Codec::new(version);
        let packet = &packets[0];
        let bytes = codec.encode_to_bytes(packet).unwrap();

        let (decoded, consumed) = codec.decode(&bytes).unwrap().unwrap();
        prop_assert_eq!(&decoded, packet);
        prop_assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn chunked_stream_decodes_to_the_same_packets(
        (version, packets) in versioned_packets(12),
        chunk in 1usize..64,
    ) {
        let codec = Codec::new(version);
        let mut wire = BytesMut::new();
        for packet in &packets {
            codec.encode(packet, &mut wire).unwrap();
        }

        let mut decoder = Decoder::new(codec);
        let mut decoded = Vec::new();
        for piece in wire.chunks(chunk) {
            decoder.feed(piece);
            while let Some(packet) = decoder.decode_next().unwrap() {
                decoded.push(packet);
            }
        }

        prop_assert_eq!(decoded, packets);
        prop_assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn truncated_frames_never_decode(
        (version, packets) in versioned_packets(2),
        cut in 1usize..16,
    ) {
        let codec = Codec::new(version);
        let bytes = codec.encode_to_bytes(&packets[0]).unwrap();
        let keep = bytes.len().saturating_sub(cut);

        let result = codec.decode(&bytes[..keep]);
        prop_assert!(matches!(result, Ok(None)));
    }

    #[test]
    fn garbage_input_errors_or_waits_but_never_panics(
        bytes in proptest::collection::vec(any::<u8>(), 0..64),
        version in version_strategy(),
    ) {
        let codec = Codec::new(version);
        let _ = codec.decode(&bytes);
    }
}

#[test]
fn test_remaining_length_of_five_bytes_is_rejected() {
    let result = decode_remaining_length(&[0x80, 0x80, 0x80, 0x80, 0x01]);
    assert!(matches!(result, Err(ProtocolError::InvalidRemainingLength)));
}

#[test]
fn test_decoder_enforces_max_packet_size() {
    let codec = Codec::new(ProtocolVersion::V311).with_max_packet_size(16);
    let big = Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtMostOnce,
        retain: false,
        topic: "t".to_string(),
        packet_id: None,
        payload: Bytes::from(vec![0u8; 64]),
        properties: Properties::default(),
    });
    let bytes = Codec::new(ProtocolVersion::V311).encode_to_bytes(&big).unwrap();

    let mut decoder = Decoder::new(codec);
    decoder.feed(&bytes[..2]);
    assert!(matches!(
        decoder.decode_next(),
        Err(ProtocolError::PacketTooLarge { .. })
    ));
}
