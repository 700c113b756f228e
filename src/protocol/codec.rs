//! Binary codec for MQTT control packets
//!
//! [`Codec`] encodes and decodes whole frames for one protocol revision.
//! [`Decoder`] adds the incremental side: bytes are appended as they arrive and
//! complete frames are split off the front of the buffer without copying the
//! backlog.

use super::packet::{
    packet_name, Ack, ConnAck, Connect, Disconnect, LastWill, Packet, ProtocolVersion, Publish,
    QoS, SubAck, Subscribe, SubscribeFilter, SubscriptionOptions, UnsubAck, Unsubscribe,
};
use super::properties::Properties;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Largest value the variable-length remaining length can carry
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Largest possible frame: one header byte, four length bytes and the body
pub const MAX_FRAME_SIZE: usize = MAX_REMAINING_LENGTH + 5;

const PROTOCOL_NAME: &str = "MQTT";

/// Wire-level failures. Any of these is fatal to the connection that produced it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed fixed header: {0}")]
    MalformedFixedHeader(String),

    #[error("Reserved flag bits set on {packet}: {flags:#06b}")]
    ReservedBitsSet { packet: &'static str, flags: u8 },

    #[error("Invalid packet type {0}")]
    InvalidPacketType(u8),

    #[error("Remaining length encoding exceeds four bytes")]
    InvalidRemainingLength,

    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,

    #[error("Packet of {size} bytes exceeds the maximum of {max} bytes")]
    PacketTooLarge { size: usize, max: usize },

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Unexpected {0} packet")]
    UnexpectedPacket(&'static str),

    #[error("Unsupported protocol level {0}")]
    UnsupportedProtocolVersion(u8),
}

fn malformed(detail: impl Into<String>) -> ProtocolError {
    ProtocolError::MalformedPacket(detail.into())
}

/// Decodes the variable-length remaining length at the start of `buf`.
///
/// Returns the value and the number of bytes it occupied, or `None` when more
/// bytes are needed.
pub fn decode_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, ProtocolError> {
    let mut value = 0usize;
    for (i, &byte) in buf.iter().take(4).enumerate() {
        value |= usize::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= 4 {
        Err(ProtocolError::InvalidRemainingLength)
    } else {
        Ok(None)
    }
}

pub(crate) fn put_varint(out: &mut BytesMut, value: usize) -> Result<(), ProtocolError> {
    if value > MAX_REMAINING_LENGTH {
        return Err(malformed(format!(
            "length {value} exceeds the variable byte integer maximum"
        )));
    }
    let mut remaining = value;
    loop {
        let mut byte = (remaining % 128) as u8;
        remaining /= 128;
        if remaining > 0 {
            byte |= 0x80;
        }
        out.put_u8(byte);
        if remaining == 0 {
            return Ok(());
        }
    }
}

pub(crate) fn put_string(out: &mut BytesMut, value: &str) -> Result<(), ProtocolError> {
    if value.contains('\0') {
        return Err(malformed("string contains U+0000"));
    }
    put_binary(out, value.as_bytes())
}

pub(crate) fn put_binary(out: &mut BytesMut, value: &[u8]) -> Result<(), ProtocolError> {
    let len = u16::try_from(value.len())
        .map_err(|_| malformed(format!("field of {} bytes exceeds 65535", value.len())))?;
    out.put_u16(len);
    out.put_slice(value);
    Ok(())
}

/// Cursor over the body of one complete frame. Running out of bytes here means
/// the frame is malformed, not that more data is needed.
pub(crate) struct Reader {
    buf: Bytes,
}

impl Reader {
    pub(crate) fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize) -> Result<(), ProtocolError> {
        if self.buf.remaining() < n {
            Err(malformed("packet body truncated"))
        } else {
            Ok(())
        }
    }

    pub(crate) fn u8(&mut self) -> Result<u8, ProtocolError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub(crate) fn u16(&mut self) -> Result<u16, ProtocolError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    pub(crate) fn u32(&mut self) -> Result<u32, ProtocolError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub(crate) fn varint(&mut self) -> Result<u32, ProtocolError> {
        match decode_remaining_length(&self.buf)? {
            Some((value, used)) => {
                self.buf.advance(used);
                Ok(value as u32)
            }
            None => Err(malformed("variable byte integer truncated")),
        }
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<Bytes, ProtocolError> {
        self.need(n)?;
        Ok(self.buf.split_to(n))
    }

    pub(crate) fn binary(&mut self) -> Result<Bytes, ProtocolError> {
        let len = usize::from(self.u16()?);
        self.take(len)
    }

    pub(crate) fn string(&mut self) -> Result<String, ProtocolError> {
        let raw = self.binary()?;
        let value = std::str::from_utf8(&raw).map_err(|_| ProtocolError::InvalidUtf8)?;
        if value.contains('\0') {
            return Err(ProtocolError::InvalidUtf8);
        }
        Ok(value.to_owned())
    }

    fn packet_id(&mut self) -> Result<u16, ProtocolError> {
        match self.u16()? {
            0 => Err(malformed("packet identifier 0")),
            id => Ok(id),
        }
    }

    fn rest(&mut self) -> Bytes {
        let n = self.buf.remaining();
        self.buf.split_to(n)
    }

    fn finish(&self, packet: &str) -> Result<(), ProtocolError> {
        if self.buf.has_remaining() {
            Err(malformed(format!("trailing bytes after {packet}")))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FixedHeader {
    byte: u8,
    header_len: usize,
    remaining: usize,
}

impl FixedHeader {
    fn total(&self) -> usize {
        self.header_len + self.remaining
    }
}

fn validate_header_flags(byte: u8) -> Result<(), ProtocolError> {
    let packet_type = byte >> 4;
    let flags = byte & 0x0F;
    match packet_type {
        0 | 15 => Err(ProtocolError::InvalidPacketType(packet_type)),
        3 => {
            let qos = (flags >> 1) & 0x03;
            if qos == 3 {
                return Err(ProtocolError::MalformedFixedHeader(
                    "PUBLISH with QoS 3".to_string(),
                ));
            }
            if qos == 0 && flags & 0x08 != 0 {
                return Err(ProtocolError::MalformedFixedHeader(
                    "DUP set on QoS 0 PUBLISH".to_string(),
                ));
            }
            Ok(())
        }
        6 | 8 | 10 if flags != 0x02 => Err(ProtocolError::ReservedBitsSet {
            packet: packet_name(packet_type),
            flags,
        }),
        6 | 8 | 10 => Ok(()),
        _ if flags != 0 => Err(ProtocolError::ReservedBitsSet {
            packet: packet_name(packet_type),
            flags,
        }),
        _ => Ok(()),
    }
}

fn parse_fixed_header(buf: &[u8]) -> Result<Option<FixedHeader>, ProtocolError> {
    let Some(&byte) = buf.first() else {
        return Ok(None);
    };
    validate_header_flags(byte)?;
    Ok(decode_remaining_length(&buf[1..])?.map(|(remaining, len)| FixedHeader {
        byte,
        header_len: 1 + len,
        remaining,
    }))
}

/// Encoder/decoder for one protocol revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Codec {
    version: ProtocolVersion,
    max_packet_size: usize,
}

impl Codec {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            version,
            max_packet_size: MAX_FRAME_SIZE,
        }
    }

    /// Caps the size of inbound frames (header included)
    pub fn with_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Appends the encoded frame to `out`.
    ///
    /// Fails only on internally inconsistent input; `out` is left untouched on error.
    pub fn encode(&self, packet: &Packet, out: &mut BytesMut) -> Result<(), ProtocolError> {
        let mut body = BytesMut::new();
        let flags = self.encode_body(packet, &mut body)?;
        let mut header = BytesMut::with_capacity(5);
        header.put_u8((packet.packet_type() << 4) | flags);
        put_varint(&mut header, body.len())?;
        out.reserve(header.len() + body.len());
        out.put_slice(&header);
        out.put_slice(&body);
        Ok(())
    }

    pub fn encode_to_bytes(&self, packet: &Packet) -> Result<Bytes, ProtocolError> {
        let mut out = BytesMut::new();
        self.encode(packet, &mut out)?;
        Ok(out.freeze())
    }

    /// Decodes one frame from the front of `buf`.
    ///
    /// Returns the packet and the number of bytes consumed, or `None` when
    /// `buf` does not yet hold a complete frame.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, ProtocolError> {
        let Some(header) = self.complete_header(buf)? else {
            return Ok(None);
        };
        let total = header.total();
        if buf.len() < total {
            return Ok(None);
        }
        let body = Bytes::copy_from_slice(&buf[header.header_len..total]);
        let packet = self.decode_body(header.byte, body)?;
        Ok(Some((packet, total)))
    }

    fn complete_header(&self, buf: &[u8]) -> Result<Option<FixedHeader>, ProtocolError> {
        let Some(header) = parse_fixed_header(buf)? else {
            return Ok(None);
        };
        if header.total() > self.max_packet_size {
            return Err(ProtocolError::PacketTooLarge {
                size: header.total(),
                max: self.max_packet_size,
            });
        }
        Ok(Some(header))
    }

    fn check_properties(&self, properties: &Properties, packet: &str) -> Result<(), ProtocolError> {
        if !self.version.is_v5() && !properties.is_empty() {
            return Err(malformed(format!("{packet} properties require MQTT 5")));
        }
        Ok(())
    }

    fn put_properties(&self, properties: &Properties, out: &mut BytesMut) -> Result<(), ProtocolError> {
        if self.version.is_v5() {
            properties.encode(out)?;
        }
        Ok(())
    }

    fn read_properties(&self, reader: &mut Reader) -> Result<Properties, ProtocolError> {
        if self.version.is_v5() {
            Properties::decode(reader)
        } else {
            Ok(Properties::default())
        }
    }

    /// Writes the variable header and payload, returning the fixed-header flags.
    fn encode_body(&self, packet: &Packet, out: &mut BytesMut) -> Result<u8, ProtocolError> {
        match packet {
            Packet::Connect(connect) => {
                encode_connect(connect, out)?;
                Ok(0)
            }
            Packet::ConnAck(ack) => {
                self.check_properties(&ack.properties, "CONNACK")?;
                out.put_u8(u8::from(ack.session_present));
                out.put_u8(ack.code);
                self.put_properties(&ack.properties, out)?;
                Ok(0)
            }
            Packet::Publish(publish) => self.encode_publish(publish, out),
            Packet::PubAck(ack) | Packet::PubRec(ack) | Packet::PubComp(ack) => {
                self.encode_ack(ack, packet.name(), out)?;
                Ok(0)
            }
            Packet::PubRel(ack) => {
                self.encode_ack(ack, "PUBREL", out)?;
                Ok(0x02)
            }
            Packet::Subscribe(subscribe) => {
                self.encode_subscribe(subscribe, out)?;
                Ok(0x02)
            }
            Packet::SubAck(ack) => {
                self.check_properties(&ack.properties, "SUBACK")?;
                if ack.return_codes.is_empty() {
                    return Err(malformed("SUBACK without return codes"));
                }
                put_packet_id(out, ack.packet_id)?;
                self.put_properties(&ack.properties, out)?;
                out.put_slice(&ack.return_codes);
                Ok(0)
            }
            Packet::Unsubscribe(unsubscribe) => {
                self.check_properties(&unsubscribe.properties, "UNSUBSCRIBE")?;
                if unsubscribe.filters.is_empty() {
                    return Err(malformed("UNSUBSCRIBE without topic filters"));
                }
                put_packet_id(out, unsubscribe.packet_id)?;
                self.put_properties(&unsubscribe.properties, out)?;
                for filter in &unsubscribe.filters {
                    put_topic(out, filter)?;
                }
                Ok(0x02)
            }
            Packet::UnsubAck(ack) => {
                self.check_properties(&ack.properties, "UNSUBACK")?;
                put_packet_id(out, ack.packet_id)?;
                if self.version.is_v5() {
                    if ack.reason_codes.is_empty() {
                        return Err(malformed("UNSUBACK without reason codes"));
                    }
                    ack.properties.encode(out)?;
                    out.put_slice(&ack.reason_codes);
                } else if !ack.reason_codes.is_empty() {
                    return Err(malformed("UNSUBACK reason codes require MQTT 5"));
                }
                Ok(0)
            }
            Packet::PingReq | Packet::PingResp => Ok(0),
            Packet::Disconnect(disconnect) => {
                self.check_properties(&disconnect.properties, "DISCONNECT")?;
                if self.version.is_v5() {
                    if !disconnect.properties.is_empty() {
                        out.put_u8(disconnect.reason_code);
                        disconnect.properties.encode(out)?;
                    } else if disconnect.reason_code != 0 {
                        out.put_u8(disconnect.reason_code);
                    }
                } else if disconnect.reason_code != 0 {
                    return Err(malformed("DISCONNECT reason code requires MQTT 5"));
                }
                Ok(0)
            }
        }
    }

    fn encode_publish(&self, publish: &Publish, out: &mut BytesMut) -> Result<u8, ProtocolError> {
        self.check_properties(&publish.properties, "PUBLISH")?;
        if publish.topic.is_empty() {
            return Err(malformed("PUBLISH with empty topic name"));
        }
        if publish.topic.contains(['+', '#']) {
            return Err(malformed("PUBLISH topic name contains a wildcard"));
        }
        if publish.dup && publish.qos == QoS::AtMostOnce {
            return Err(malformed("DUP set on QoS 0 PUBLISH"));
        }
        put_string(out, &publish.topic)?;
        match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, None) => {}
            (QoS::AtMostOnce, Some(_)) => {
                return Err(malformed("QoS 0 PUBLISH carries a packet identifier"))
            }
            (_, Some(id)) => put_packet_id(out, id)?,
            (_, None) => return Err(malformed("QoS 1/2 PUBLISH without packet identifier")),
        }
        self.put_properties(&publish.properties, out)?;
        out.put_slice(&publish.payload);
        Ok((u8::from(publish.dup) << 3) | ((publish.qos as u8) << 1) | u8::from(publish.retain))
    }

    fn encode_ack(&self, ack: &Ack, name: &str, out: &mut BytesMut) -> Result<(), ProtocolError> {
        self.check_properties(&ack.properties, name)?;
        put_packet_id(out, ack.packet_id)?;
        if self.version.is_v5() {
            if !ack.properties.is_empty() {
                out.put_u8(ack.reason_code);
                ack.properties.encode(out)?;
            } else if ack.reason_code != 0 {
                out.put_u8(ack.reason_code);
            }
        } else if ack.reason_code != 0 {
            return Err(malformed(format!("{name} reason code requires MQTT 5")));
        }
        Ok(())
    }

    fn encode_subscribe(&self, subscribe: &Subscribe, out: &mut BytesMut) -> Result<(), ProtocolError> {
        self.check_properties(&subscribe.properties, "SUBSCRIBE")?;
        if subscribe.filters.is_empty() {
            return Err(malformed("SUBSCRIBE without topic filters"));
        }
        put_packet_id(out, subscribe.packet_id)?;
        self.put_properties(&subscribe.properties, out)?;
        for entry in &subscribe.filters {
            let options = entry.options;
            if options.retain_handling > 2 {
                return Err(malformed("retain handling must be 0, 1 or 2"));
            }
            let extended =
                options.no_local || options.retain_as_published || options.retain_handling != 0;
            if extended && !self.version.is_v5() {
                return Err(malformed("subscription options require MQTT 5"));
            }
            put_topic(out, &entry.filter)?;
            out.put_u8(options.to_byte());
        }
        Ok(())
    }

    fn decode_body(&self, byte: u8, body: Bytes) -> Result<Packet, ProtocolError> {
        let mut reader = Reader::new(body);
        let flags = byte & 0x0F;
        let packet = match byte >> 4 {
            1 => Packet::Connect(decode_connect(&mut reader)?),
            2 => {
                let ack_flags = reader.u8()?;
                if ack_flags & 0xFE != 0 {
                    return Err(malformed("CONNACK acknowledge flags reserved bits set"));
                }
                let code = reader.u8()?;
                let properties = self.read_properties(&mut reader)?;
                Packet::ConnAck(ConnAck {
                    session_present: ack_flags & 0x01 != 0,
                    code,
                    properties,
                })
            }
            3 => Packet::Publish(self.decode_publish(flags, &mut reader)?),
            4 => Packet::PubAck(self.decode_ack(&mut reader)?),
            5 => Packet::PubRec(self.decode_ack(&mut reader)?),
            6 => Packet::PubRel(self.decode_ack(&mut reader)?),
            7 => Packet::PubComp(self.decode_ack(&mut reader)?),
            8 => Packet::Subscribe(self.decode_subscribe(&mut reader)?),
            9 => {
                let packet_id = reader.packet_id()?;
                let properties = self.read_properties(&mut reader)?;
                let return_codes = reader.rest().to_vec();
                if return_codes.is_empty() {
                    return Err(malformed("SUBACK without return codes"));
                }
                Packet::SubAck(SubAck {
                    packet_id,
                    return_codes,
                    properties,
                })
            }
            10 => {
                let packet_id = reader.packet_id()?;
                let properties = self.read_properties(&mut reader)?;
                let mut filters = Vec::new();
                while reader.remaining() > 0 {
                    filters.push(reader.string()?);
                }
                if filters.is_empty() {
                    return Err(malformed("UNSUBSCRIBE without topic filters"));
                }
                Packet::Unsubscribe(Unsubscribe {
                    packet_id,
                    filters,
                    properties,
                })
            }
            11 => {
                let packet_id = reader.packet_id()?;
                let properties = self.read_properties(&mut reader)?;
                let reason_codes = reader.rest().to_vec();
                if self.version.is_v5() && reason_codes.is_empty() {
                    return Err(malformed("UNSUBACK without reason codes"));
                }
                if !self.version.is_v5() && !reason_codes.is_empty() {
                    return Err(malformed("trailing bytes after UNSUBACK"));
                }
                Packet::UnsubAck(UnsubAck {
                    packet_id,
                    reason_codes,
                    properties,
                })
            }
            12 => Packet::PingReq,
            13 => Packet::PingResp,
            14 => {
                let mut disconnect = Disconnect::default();
                if self.version.is_v5() && reader.remaining() > 0 {
                    disconnect.reason_code = reader.u8()?;
                    if reader.remaining() > 0 {
                        disconnect.properties = Properties::decode(&mut reader)?;
                    }
                }
                Packet::Disconnect(disconnect)
            }
            other => return Err(ProtocolError::InvalidPacketType(other)),
        };
        reader.finish(packet.name())?;
        Ok(packet)
    }

    fn decode_publish(&self, flags: u8, reader: &mut Reader) -> Result<Publish, ProtocolError> {
        let qos = QoS::try_from((flags >> 1) & 0x03)?;
        let topic = reader.string()?;
        if topic.is_empty() {
            return Err(malformed("PUBLISH with empty topic name"));
        }
        if topic.contains(['+', '#']) {
            return Err(malformed("PUBLISH topic name contains a wildcard"));
        }
        let packet_id = match qos {
            QoS::AtMostOnce => None,
            _ => Some(reader.packet_id()?),
        };
        let properties = self.read_properties(reader)?;
        Ok(Publish {
            dup: flags & 0x08 != 0,
            qos,
            retain: flags & 0x01 != 0,
            topic,
            packet_id,
            payload: reader.rest(),
            properties,
        })
    }

    fn decode_ack(&self, reader: &mut Reader) -> Result<Ack, ProtocolError> {
        let mut ack = Ack::new(reader.packet_id()?);
        if self.version.is_v5() && reader.remaining() > 0 {
            ack.reason_code = reader.u8()?;
            if reader.remaining() > 0 {
                ack.properties = Properties::decode(reader)?;
            }
        }
        Ok(ack)
    }

    fn decode_subscribe(&self, reader: &mut Reader) -> Result<Subscribe, ProtocolError> {
        let packet_id = reader.packet_id()?;
        let properties = self.read_properties(reader)?;
        let mut filters = Vec::new();
        while reader.remaining() > 0 {
            let filter = reader.string()?;
            let byte = reader.u8()?;
            let reserved = if self.version.is_v5() { 0xC0 } else { 0xFC };
            if byte & reserved != 0 {
                return Err(malformed("subscription options reserved bits set"));
            }
            let retain_handling = (byte >> 4) & 0x03;
            if retain_handling == 3 {
                return Err(malformed("retain handling 3"));
            }
            filters.push(SubscribeFilter {
                filter,
                options: SubscriptionOptions {
                    qos: QoS::try_from(byte & 0x03)?,
                    no_local: byte & 0x04 != 0,
                    retain_as_published: byte & 0x08 != 0,
                    retain_handling,
                },
            });
        }
        if filters.is_empty() {
            return Err(malformed("SUBSCRIBE without topic filters"));
        }
        Ok(Subscribe {
            packet_id,
            filters,
            properties,
        })
    }
}

fn put_packet_id(out: &mut BytesMut, id: u16) -> Result<(), ProtocolError> {
    if id == 0 {
        return Err(malformed("packet identifier 0"));
    }
    out.put_u16(id);
    Ok(())
}

fn put_topic(out: &mut BytesMut, topic: &str) -> Result<(), ProtocolError> {
    if topic.is_empty() {
        return Err(malformed("empty topic filter"));
    }
    put_string(out, topic)
}

fn encode_connect(connect: &Connect, out: &mut BytesMut) -> Result<(), ProtocolError> {
    let v5 = connect.protocol.is_v5();
    if !v5 && !connect.properties.is_empty() {
        return Err(malformed("CONNECT properties require MQTT 5"));
    }
    if !v5 && connect.password.is_some() && connect.username.is_none() {
        return Err(malformed("password without user name"));
    }

    let mut flags = 0u8;
    if connect.clean_start {
        flags |= 0x02;
    }
    if let Some(will) = &connect.will {
        if will.topic.is_empty() {
            return Err(malformed("will with empty topic"));
        }
        if !v5 && !will.properties.is_empty() {
            return Err(malformed("will properties require MQTT 5"));
        }
        flags |= 0x04 | ((will.qos as u8) << 3);
        if will.retain {
            flags |= 0x20;
        }
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    if connect.username.is_some() {
        flags |= 0x80;
    }

    put_string(out, PROTOCOL_NAME)?;
    out.put_u8(connect.protocol.level());
    out.put_u8(flags);
    out.put_u16(connect.keep_alive);
    if v5 {
        connect.properties.encode(out)?;
    }
    put_string(out, &connect.client_id)?;
    if let Some(will) = &connect.will {
        if v5 {
            will.properties.encode(out)?;
        }
        put_string(out, &will.topic)?;
        put_binary(out, &will.payload)?;
    }
    if let Some(username) = &connect.username {
        put_string(out, username)?;
    }
    if let Some(password) = &connect.password {
        put_binary(out, password)?;
    }
    Ok(())
}

fn decode_connect(reader: &mut Reader) -> Result<Connect, ProtocolError> {
    let name = reader.string()?;
    if name != PROTOCOL_NAME {
        return Err(malformed(format!("unknown protocol name {name:?}")));
    }
    let protocol = ProtocolVersion::from_level(reader.u8()?)?;
    let v5 = protocol.is_v5();
    let flags = reader.u8()?;
    if flags & 0x01 != 0 {
        return Err(ProtocolError::ReservedBitsSet {
            packet: "CONNECT",
            flags,
        });
    }
    let has_will = flags & 0x04 != 0;
    let will_qos = QoS::try_from((flags >> 3) & 0x03)?;
    let will_retain = flags & 0x20 != 0;
    if !has_will && (will_qos != QoS::AtMostOnce || will_retain) {
        return Err(malformed("will QoS/retain set without will flag"));
    }
    let has_password = flags & 0x40 != 0;
    let has_username = flags & 0x80 != 0;
    if !v5 && has_password && !has_username {
        return Err(malformed("password without user name"));
    }

    let keep_alive = reader.u16()?;
    let properties = if v5 {
        Properties::decode(reader)?
    } else {
        Properties::default()
    };
    let client_id = reader.string()?;
    let will = if has_will {
        let will_properties = if v5 {
            Properties::decode(reader)?
        } else {
            Properties::default()
        };
        let topic = reader.string()?;
        let payload = reader.binary()?;
        Some(LastWill {
            topic,
            payload,
            qos: will_qos,
            retain: will_retain,
            properties: will_properties,
        })
    } else {
        None
    };
    let username = has_username.then(|| reader.string()).transpose()?;
    let password = has_password.then(|| reader.binary()).transpose()?;

    Ok(Connect {
        protocol,
        client_id,
        clean_start: flags & 0x02 != 0,
        keep_alive,
        username,
        password,
        will,
        properties,
    })
}

/// Incremental frame decoder.
///
/// Transports read straight into [`Decoder::buffer_mut`]; every complete frame
/// at the front is split off with `split_to` so the payload of a PUBLISH shares
/// the receive buffer instead of being copied.
#[derive(Debug)]
pub struct Decoder {
    codec: Codec,
    buffer: BytesMut,
}

impl Decoder {
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            buffer: BytesMut::with_capacity(4096),
        }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes held for a frame that has not fully arrived yet
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn decode_next(&mut self) -> Result<Option<Packet>, ProtocolError> {
        let Some(header) = self.codec.complete_header(&self.buffer)? else {
            return Ok(None);
        };
        let total = header.total();
        if self.buffer.len() < total {
            self.buffer.reserve(total - self.buffer.len());
            return Ok(None);
        }
        let mut frame = self.buffer.split_to(total).freeze();
        frame.advance(header.header_len);
        self.codec.decode_body(header.byte, frame).map(Some)
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}
