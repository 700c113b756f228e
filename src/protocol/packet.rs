//! MQTT control packet model
//!
//! One tagged variant per control packet type. Fields mirror the wire format of
//! MQTT 3.1.1 and MQTT 5; v5-only fields (properties, reason codes) are left at
//! their defaults when speaking 3.1.1.

use super::properties::Properties;
use super::ProtocolError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// MQTT protocol revision negotiated by CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// MQTT 3.1.1 (protocol level 4)
    #[default]
    #[serde(rename = "v311")]
    V311,
    /// MQTT 5.0 (protocol level 5)
    #[serde(rename = "v5")]
    V5,
}

impl ProtocolVersion {
    /// Protocol level byte carried in CONNECT
    pub fn level(self) -> u8 {
        match self {
            ProtocolVersion::V311 => 4,
            ProtocolVersion::V5 => 5,
        }
    }

    pub fn from_level(level: u8) -> Result<Self, ProtocolError> {
        match level {
            4 => Ok(ProtocolVersion::V311),
            5 => Ok(ProtocolVersion::V5),
            other => Err(ProtocolError::UnsupportedProtocolVersion(other)),
        }
    }

    pub fn is_v5(self) -> bool {
        matches!(self, ProtocolVersion::V5)
    }
}

/// MQTT Quality of Service level.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
#[allow(clippy::enum_variant_names)]
pub enum QoS {
    /// At most once delivery (fire and forget).
    #[default]
    AtMostOnce = 0,
    /// At least once delivery (acknowledged delivery).
    AtLeastOnce = 1,
    /// Exactly once delivery (assured delivery).
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(ProtocolError::MalformedPacket(format!("invalid QoS {other}"))),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos as u8
    }
}

/// Last Will and Testament carried by CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    /// Will properties (v5 only)
    pub properties: Properties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Protocol revision announced by this CONNECT
    pub protocol: ProtocolVersion,
    pub client_id: String,
    pub clean_start: bool,
    /// Keep-alive interval in seconds (0 disables keep-alive)
    pub keep_alive: u16,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub will: Option<LastWill>,
    pub properties: Properties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    /// 3.1.1 return code or v5 reason code; 0 means accepted
    pub code: u8,
    pub properties: Properties,
}

impl ConnAck {
    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// Present exactly when `qos` is 1 or 2
    pub packet_id: Option<u16>,
    pub payload: Bytes,
    pub properties: Properties,
}

/// Body shared by PUBACK, PUBREC, PUBREL and PUBCOMP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub packet_id: u16,
    /// v5 reason code; always 0 on 3.1.1
    pub reason_code: u8,
    pub properties: Properties,
}

impl Ack {
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            reason_code: 0,
            properties: Properties::default(),
        }
    }
}

/// Per-filter subscription options. Only `qos` exists on 3.1.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriptionOptions {
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: u8,
}

impl SubscriptionOptions {
    pub fn with_qos(qos: QoS) -> Self {
        Self {
            qos,
            ..Default::default()
        }
    }

    pub(crate) fn to_byte(self) -> u8 {
        (self.qos as u8)
            | (u8::from(self.no_local) << 2)
            | (u8::from(self.retain_as_published) << 3)
            | (self.retain_handling << 4)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeFilter {
    pub filter: String,
    pub options: SubscriptionOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub filters: Vec<SubscribeFilter>,
    pub properties: Properties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    /// Granted QoS (0x00-0x02) or failure code (>= 0x80), one per filter
    pub return_codes: Vec<u8>,
    pub properties: Properties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
    pub properties: Properties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubAck {
    pub packet_id: u16,
    /// One reason code per filter (v5 only; empty on 3.1.1)
    pub reason_codes: Vec<u8>,
    pub properties: Properties,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Disconnect {
    /// v5 reason code; always 0 on 3.1.1
    pub reason_code: u8,
    pub properties: Properties,
}

/// An MQTT control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(Ack),
    PubRec(Ack),
    PubRel(Ack),
    PubComp(Ack),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect(Disconnect),
}

impl Packet {
    /// Control packet type (upper nibble of the fixed header)
    pub fn packet_type(&self) -> u8 {
        match self {
            Packet::Connect(_) => 1,
            Packet::ConnAck(_) => 2,
            Packet::Publish(_) => 3,
            Packet::PubAck(_) => 4,
            Packet::PubRec(_) => 5,
            Packet::PubRel(_) => 6,
            Packet::PubComp(_) => 7,
            Packet::Subscribe(_) => 8,
            Packet::SubAck(_) => 9,
            Packet::Unsubscribe(_) => 10,
            Packet::UnsubAck(_) => 11,
            Packet::PingReq => 12,
            Packet::PingResp => 13,
            Packet::Disconnect(_) => 14,
        }
    }

    pub fn name(&self) -> &'static str {
        packet_name(self.packet_type())
    }
}

pub(crate) fn packet_name(packet_type: u8) -> &'static str {
    match packet_type {
        1 => "CONNECT",
        2 => "CONNACK",
        3 => "PUBLISH",
        4 => "PUBACK",
        5 => "PUBREC",
        6 => "PUBREL",
        7 => "PUBCOMP",
        8 => "SUBSCRIBE",
        9 => "SUBACK",
        10 => "UNSUBSCRIBE",
        11 => "UNSUBACK",
        12 => "PINGREQ",
        13 => "PINGRESP",
        14 => "DISCONNECT",
        15 => "AUTH",
        _ => "RESERVED",
    }
}

/// CONNACK codes shared by both protocol revisions where they overlap.
pub mod connack_code {
    pub const ACCEPTED: u8 = 0x00;
    pub const UNACCEPTABLE_PROTOCOL_VERSION: u8 = 0x01;
    pub const IDENTIFIER_REJECTED: u8 = 0x02;
    pub const SERVER_UNAVAILABLE: u8 = 0x03;
    pub const BAD_USERNAME_OR_PASSWORD: u8 = 0x04;
    pub const NOT_AUTHORIZED: u8 = 0x05;
}

/// Human readable description of a CONNACK refusal.
pub fn describe_connack_code(version: ProtocolVersion, code: u8) -> &'static str {
    match (version, code) {
        (_, 0x00) => "accepted",
        (ProtocolVersion::V311, 0x01) => "unacceptable protocol version",
        (ProtocolVersion::V311, 0x02) => "identifier rejected",
        (ProtocolVersion::V311, 0x03) => "server unavailable",
        (ProtocolVersion::V311, 0x04) => "bad user name or password",
        (ProtocolVersion::V311, 0x05) => "not authorized",
        (ProtocolVersion::V5, 0x80) => "unspecified error",
        (ProtocolVersion::V5, 0x81) => "malformed packet",
        (ProtocolVersion::V5, 0x82) => "protocol error",
        (ProtocolVersion::V5, 0x84) => "unsupported protocol version",
        (ProtocolVersion::V5, 0x85) => "client identifier not valid",
        (ProtocolVersion::V5, 0x86) => "bad user name or password",
        (ProtocolVersion::V5, 0x87) => "not authorized",
        (ProtocolVersion::V5, 0x88) => "server unavailable",
        (ProtocolVersion::V5, 0x89) => "server busy",
        (ProtocolVersion::V5, 0x8A) => "banned",
        (ProtocolVersion::V5, 0x8C) => "bad authentication method",
        (ProtocolVersion::V5, 0x95) => "packet too large",
        (ProtocolVersion::V5, 0x97) => "quota exceeded",
        (ProtocolVersion::V5, 0x9F) => "connection rate exceeded",
        _ => "refused",
    }
}
