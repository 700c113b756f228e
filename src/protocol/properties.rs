//! MQTT 5 properties
//!
//! Properties are carried generically: an ordered list of typed values keyed by
//! the property identifier. The wire type of each identifier is fixed by the
//! protocol and checked in both directions.

use super::codec::{put_binary, put_string, put_varint, Reader};
use super::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};

/// Property identifiers defined by MQTT 5.
pub mod id {
    pub const PAYLOAD_FORMAT_INDICATOR: u8 = 0x01;
    pub const MESSAGE_EXPIRY_INTERVAL: u8 = 0x02;
    pub const CONTENT_TYPE: u8 = 0x03;
    pub const RESPONSE_TOPIC: u8 = 0x08;
    pub const CORRELATION_DATA: u8 = 0x09;
    pub const SUBSCRIPTION_IDENTIFIER: u8 = 0x0B;
    pub const SESSION_EXPIRY_INTERVAL: u8 = 0x11;
    pub const ASSIGNED_CLIENT_IDENTIFIER: u8 = 0x12;
    pub const SERVER_KEEP_ALIVE: u8 = 0x13;
    pub const AUTHENTICATION_METHOD: u8 = 0x15;
    pub const AUTHENTICATION_DATA: u8 = 0x16;
    pub const REQUEST_PROBLEM_INFORMATION: u8 = 0x17;
    pub const WILL_DELAY_INTERVAL: u8 = 0x18;
    pub const REQUEST_RESPONSE_INFORMATION: u8 = 0x19;
    pub const RESPONSE_INFORMATION: u8 = 0x1A;
    pub const SERVER_REFERENCE: u8 = 0x1C;
    pub const REASON_STRING: u8 = 0x1F;
    pub const RECEIVE_MAXIMUM: u8 = 0x21;
    pub const TOPIC_ALIAS_MAXIMUM: u8 = 0x22;
    pub const TOPIC_ALIAS: u8 = 0x23;
    pub const MAXIMUM_QOS: u8 = 0x24;
    pub const RETAIN_AVAILABLE: u8 = 0x25;
    pub const USER_PROPERTY: u8 = 0x26;
    pub const MAXIMUM_PACKET_SIZE: u8 = 0x27;
    pub const WILDCARD_SUBSCRIPTION_AVAILABLE: u8 = 0x28;
    pub const SUBSCRIPTION_IDENTIFIER_AVAILABLE: u8 = 0x29;
    pub const SHARED_SUBSCRIPTION_AVAILABLE: u8 = 0x2A;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireType {
    Byte,
    TwoByte,
    FourByte,
    VarInt,
    Utf8,
    Binary,
    Utf8Pair,
}

fn wire_type(property: u8) -> Option<WireType> {
    use id::*;
    let kind = match property {
        PAYLOAD_FORMAT_INDICATOR
        | REQUEST_PROBLEM_INFORMATION
        | REQUEST_RESPONSE_INFORMATION
        | MAXIMUM_QOS
        | RETAIN_AVAILABLE
        | WILDCARD_SUBSCRIPTION_AVAILABLE
        | SUBSCRIPTION_IDENTIFIER_AVAILABLE
        | SHARED_SUBSCRIPTION_AVAILABLE => WireType::Byte,
        SERVER_KEEP_ALIVE | RECEIVE_MAXIMUM | TOPIC_ALIAS_MAXIMUM | TOPIC_ALIAS => {
            WireType::TwoByte
        }
        MESSAGE_EXPIRY_INTERVAL
        | SESSION_EXPIRY_INTERVAL
        | WILL_DELAY_INTERVAL
        | MAXIMUM_PACKET_SIZE => WireType::FourByte,
        SUBSCRIPTION_IDENTIFIER => WireType::VarInt,
        CONTENT_TYPE
        | RESPONSE_TOPIC
        | ASSIGNED_CLIENT_IDENTIFIER
        | AUTHENTICATION_METHOD
        | RESPONSE_INFORMATION
        | SERVER_REFERENCE
        | REASON_STRING => WireType::Utf8,
        CORRELATION_DATA | AUTHENTICATION_DATA => WireType::Binary,
        USER_PROPERTY => WireType::Utf8Pair,
        _ => return None,
    };
    Some(kind)
}

/// Typed value of a single property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Byte(u8),
    TwoByteInt(u16),
    FourByteInt(u32),
    VarInt(u32),
    Utf8(String),
    Binary(Bytes),
    Utf8Pair(String, String),
}

impl PropertyValue {
    fn wire_type(&self) -> WireType {
        match self {
            PropertyValue::Byte(_) => WireType::Byte,
            PropertyValue::TwoByteInt(_) => WireType::TwoByte,
            PropertyValue::FourByteInt(_) => WireType::FourByte,
            PropertyValue::VarInt(_) => WireType::VarInt,
            PropertyValue::Utf8(_) => WireType::Utf8,
            PropertyValue::Binary(_) => WireType::Binary,
            PropertyValue::Utf8Pair(_, _) => WireType::Utf8Pair,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub id: u8,
    pub value: PropertyValue,
}

/// Ordered property list attached to a v5 packet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Properties {
    items: Vec<Property>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style append
    pub fn with(mut self, id: u8, value: PropertyValue) -> Self {
        self.push(id, value);
        self
    }

    pub fn push(&mut self, id: u8, value: PropertyValue) {
        self.items.push(Property { id, value });
    }

    /// First value stored under `id`
    pub fn get(&self, id: u8) -> Option<&PropertyValue> {
        self.items.iter().find(|p| p.id == id).map(|p| &p.value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Property> {
        self.items.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Reason string sent by the broker, if any
    pub fn reason_string(&self) -> Option<&str> {
        match self.get(id::REASON_STRING) {
            Some(PropertyValue::Utf8(reason)) => Some(reason),
            _ => None,
        }
    }

    /// Writes the property length prefix followed by every property.
    pub(crate) fn encode(&self, out: &mut BytesMut) -> Result<(), ProtocolError> {
        let mut body = BytesMut::new();
        for property in &self.items {
            let expected = wire_type(property.id).ok_or_else(|| {
                ProtocolError::MalformedPacket(format!("unknown property id {:#04x}", property.id))
            })?;
            if property.value.wire_type() != expected {
                return Err(ProtocolError::MalformedPacket(format!(
                    "property {:#04x} has the wrong value type",
                    property.id
                )));
            }
            body.put_u8(property.id);
            match &property.value {
                PropertyValue::Byte(v) => body.put_u8(*v),
                PropertyValue::TwoByteInt(v) => body.put_u16(*v),
                PropertyValue::FourByteInt(v) => body.put_u32(*v),
                PropertyValue::VarInt(v) => put_varint(&mut body, *v as usize)?,
                PropertyValue::Utf8(s) => put_string(&mut body, s)?,
                PropertyValue::Binary(b) => put_binary(&mut body, b)?,
                PropertyValue::Utf8Pair(k, v) => {
                    put_string(&mut body, k)?;
                    put_string(&mut body, v)?;
                }
            }
        }
        put_varint(out, body.len())?;
        out.put_slice(&body);
        Ok(())
    }

    pub(crate) fn decode(reader: &mut Reader) -> Result<Self, ProtocolError> {
        let length = reader.varint()? as usize;
        let mut section = Reader::new(reader.take(length)?);
        let mut properties = Properties::new();
        while section.remaining() > 0 {
            let property = section.varint()?;
            let kind = u8::try_from(property)
                .ok()
                .and_then(wire_type)
                .ok_or_else(|| {
                    ProtocolError::MalformedPacket(format!("unknown property id {property:#04x}"))
                })?;
            let value = match kind {
                WireType::Byte => PropertyValue::Byte(section.u8()?),
                WireType::TwoByte => PropertyValue::TwoByteInt(section.u16()?),
                WireType::FourByte => PropertyValue::FourByteInt(section.u32()?),
                WireType::VarInt => PropertyValue::VarInt(section.varint()?),
                WireType::Utf8 => PropertyValue::Utf8(section.string()?),
                WireType::Binary => PropertyValue::Binary(section.binary()?),
                WireType::Utf8Pair => {
                    let key = section.string()?;
                    PropertyValue::Utf8Pair(key, section.string()?)
                }
            };
            properties.push(property as u8, value);
        }
        Ok(properties)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_properties_encode_to_single_zero() {
        let mut out = BytesMut::new();
        Properties::new().encode(&mut out).unwrap();
        assert_eq!(&out[..], &[0x00]);
    }

    #[test]
    fn test_properties_roundtrip_preserves_order() {
        let properties = Properties::new()
            .with(id::USER_PROPERTY, PropertyValue::Utf8Pair("b".into(), "2".into()))
            .with(id::SESSION_EXPIRY_INTERVAL, PropertyValue::FourByteInt(3600))
            .with(id::USER_PROPERTY, PropertyValue::Utf8Pair("a".into(), "1".into()))
            .with(id::SUBSCRIPTION_IDENTIFIER, PropertyValue::VarInt(300))
            .with(id::CORRELATION_DATA, PropertyValue::Binary(Bytes::from_static(b"\x00\x01")));

        let mut out = BytesMut::new();
        properties.encode(&mut out).unwrap();
        let mut reader = Reader::new(out.freeze());
        let decoded = Properties::decode(&mut reader).unwrap();

        assert_eq!(decoded, properties);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_wrong_value_type_is_rejected() {
        let properties = Properties::new().with(id::TOPIC_ALIAS, PropertyValue::Byte(1));
        let mut out = BytesMut::new();
        assert!(matches!(
            properties.encode(&mut out),
            Err(ProtocolError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_unknown_property_id_is_rejected_on_decode() {
        let mut reader = Reader::new(Bytes::from_static(&[0x02, 0x7F, 0x00]));
        assert!(matches!(
            Properties::decode(&mut reader),
            Err(ProtocolError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_reason_string_accessor() {
        let properties =
            Properties::new().with(id::REASON_STRING, PropertyValue::Utf8("quota".into()));
        assert_eq!(properties.reason_string(), Some("quota"));
        assert_eq!(Properties::new().reason_string(), None);
    }
}
