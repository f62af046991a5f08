//! MQTT 3.1.1 packet types and the client side of the codec.
//!
//! The client encodes CONNECT, PUBLISH, SUBSCRIBE, UNSUBSCRIBE, the QoS
//! acknowledgments, PINGREQ and DISCONNECT, and decodes what a broker sends
//! back. Broker-side packets can be encoded too, which keeps loopback test
//! brokers honest.

use bytes::Bytes;

use crate::error::{ProtocolError, Result};
use crate::varint;

/// Protocol level byte for MQTT 3.1.1.
pub const PROTOCOL_LEVEL: u8 = 4;

/// SUBACK return code signalling a rejected subscription.
pub const SUBACK_FAILURE: u8 = 0x80;

/// MQTT Control Packet Types (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::Connack),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::Puback),
            5 => Ok(PacketType::Pubrec),
            6 => Ok(PacketType::Pubrel),
            7 => Ok(PacketType::Pubcomp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::Suback),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::Unsuback),
            12 => Ok(PacketType::Pingreq),
            13 => Ok(PacketType::Pingresp),
            14 => Ok(PacketType::Disconnect),
            _ => Err(ProtocolError::InvalidPacketType(value)),
        }
    }
}

/// Quality of Service levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(ProtocolError::InvalidQos(value)),
        }
    }
}

/// CONNACK return codes (MQTT 3.1.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnackCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernamePassword = 4,
    NotAuthorized = 5,
}

impl ConnackCode {
    /// Map a raw return code; unknown values yield `None`.
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0 => Some(ConnackCode::Accepted),
            1 => Some(ConnackCode::UnacceptableProtocolVersion),
            2 => Some(ConnackCode::IdentifierRejected),
            3 => Some(ConnackCode::ServerUnavailable),
            4 => Some(ConnackCode::BadUsernamePassword),
            5 => Some(ConnackCode::NotAuthorized),
            _ => None,
        }
    }

    /// Human readable reason.
    pub fn description(self) -> &'static str {
        match self {
            ConnackCode::Accepted => "Connection accepted",
            ConnackCode::UnacceptableProtocolVersion => {
                "Connection refused: unacceptable protocol version"
            }
            ConnackCode::IdentifierRejected => "Connection refused: identifier rejected",
            ConnackCode::ServerUnavailable => "Connection refused: server unavailable",
            ConnackCode::BadUsernamePassword => "Connection refused: bad username or password",
            ConnackCode::NotAuthorized => "Connection refused: not authorized",
        }
    }
}

/// MQTT Packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    Puback { packet_id: u16 },
    Pubrec { packet_id: u16 },
    Pubrel { packet_id: u16 },
    Pubcomp { packet_id: u16 },
    Subscribe(Subscribe),
    Suback(Suback),
    Unsubscribe(Unsubscribe),
    Unsuback { packet_id: u16 },
    Pingreq,
    Pingresp,
    Disconnect,
}

/// CONNECT packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

/// Will message carried by CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNACK packet data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connack {
    pub session_present: bool,
    /// Raw return code; see [`ConnackCode::from_u8`].
    pub return_code: u8,
}

impl Connack {
    pub fn accepted(&self) -> bool {
        self.return_code == ConnackCode::Accepted as u8
    }
}

/// PUBLISH packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

/// SUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub topics: Vec<(String, QoS)>,
}

/// SUBACK packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suback {
    pub packet_id: u16,
    /// 0x00-0x02 = granted QoS, 0x80 = failure.
    pub return_codes: Vec<u8>,
}

/// UNSUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub topics: Vec<String>,
}

/// Cursor over a packet body.
struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn read_u8(&mut self) -> Result<u8> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or(ProtocolError::IncompletePacket { needed: 1, have: 0 })?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(ProtocolError::IncompletePacket {
                needed: len,
                have: self.remaining(),
            }
            .into());
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        if bytes.contains(&0u8) {
            return Err(ProtocolError::MalformedPacket(
                "UTF-8 string must not contain null character".into(),
            )
            .into());
        }
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8.into())
    }

    fn rest(&mut self) -> &'a [u8] {
        let bytes = &self.buf[self.pos..];
        self.pos = self.buf.len();
        bytes
    }
}

/// Try to decode one broker-to-client packet from the front of `buf`.
///
/// Returns `Ok(Some((packet, bytes_consumed)))`, `Ok(None)` when more data is
/// needed, or an error for malformed input and packets a broker never sends.
pub fn decode_packet(buf: &[u8]) -> Result<Option<(Packet, usize)>> {
    let Some(&fixed_header) = buf.first() else {
        return Ok(None);
    };
    let flags = fixed_header & 0x0F;

    let Some((remaining_len, len_bytes)) = varint::decode(&buf[1..])? else {
        return Ok(None);
    };
    let header_len = 1 + len_bytes;
    let total_len = header_len + remaining_len;
    if buf.len() < total_len {
        return Ok(None);
    }

    let packet_type = PacketType::try_from(fixed_header >> 4)?;
    let body = &buf[header_len..total_len];

    if packet_type == PacketType::Pubrel && flags != 0x02 {
        return Err(ProtocolError::MalformedPacket(format!(
            "PUBREL fixed header flags must be 0x02, got {:#04x}",
            flags
        ))
        .into());
    }

    let packet = match packet_type {
        PacketType::Connack => decode_connack(body)?,
        PacketType::Publish => decode_publish(flags, body)?,
        PacketType::Puback => Packet::Puback {
            packet_id: Decoder::new(body).read_u16()?,
        },
        PacketType::Pubrec => Packet::Pubrec {
            packet_id: Decoder::new(body).read_u16()?,
        },
        PacketType::Pubrel => Packet::Pubrel {
            packet_id: Decoder::new(body).read_u16()?,
        },
        PacketType::Pubcomp => Packet::Pubcomp {
            packet_id: Decoder::new(body).read_u16()?,
        },
        PacketType::Suback => decode_suback(body)?,
        PacketType::Unsuback => Packet::Unsuback {
            packet_id: Decoder::new(body).read_u16()?,
        },
        PacketType::Pingresp => Packet::Pingresp,
        other => {
            return Err(ProtocolError::UnexpectedPacket(format!("{:?}", other)).into());
        }
    };

    Ok(Some((packet, total_len)))
}

fn decode_connack(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let ack_flags = dec.read_u8()?;
    if ack_flags & 0xFE != 0 {
        return Err(ProtocolError::MalformedPacket(format!(
            "reserved CONNACK flags set: {:#04x}",
            ack_flags
        ))
        .into());
    }
    let return_code = dec.read_u8()?;
    Ok(Packet::Connack(Connack {
        session_present: ack_flags & 0x01 != 0,
        return_code,
    }))
}

fn decode_publish(flags: u8, body: &[u8]) -> Result<Packet> {
    let dup = flags & 0x08 != 0;
    let qos = QoS::try_from((flags >> 1) & 0x03)?;
    let retain = flags & 0x01 != 0;

    let mut dec = Decoder::new(body);
    let topic = dec.read_string()?;
    let packet_id = match qos {
        QoS::AtMostOnce => None,
        _ => Some(dec.read_u16()?),
    };
    let payload = Bytes::copy_from_slice(dec.rest());

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic,
        packet_id,
        payload,
    }))
}

fn decode_suback(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_u16()?;
    let return_codes = dec.rest().to_vec();
    if return_codes.is_empty() {
        return Err(ProtocolError::MalformedPacket("SUBACK without return codes".into()).into());
    }
    Ok(Packet::Suback(Suback {
        packet_id,
        return_codes,
    }))
}

/// Encode a packet, appending it to `buf`.
pub fn encode_packet(packet: &Packet, buf: &mut Vec<u8>) -> Result<()> {
    match packet {
        Packet::Connect(connect) => encode_connect(connect, buf),
        Packet::Connack(connack) => {
            buf.push((PacketType::Connack as u8) << 4);
            buf.push(2);
            buf.push(u8::from(connack.session_present));
            buf.push(connack.return_code);
            Ok(())
        }
        Packet::Publish(publish) => encode_publish(publish, buf),
        Packet::Puback { packet_id } => encode_id_only(PacketType::Puback, 0, *packet_id, buf),
        Packet::Pubrec { packet_id } => encode_id_only(PacketType::Pubrec, 0, *packet_id, buf),
        Packet::Pubrel { packet_id } => encode_id_only(PacketType::Pubrel, 0x02, *packet_id, buf),
        Packet::Pubcomp { packet_id } => encode_id_only(PacketType::Pubcomp, 0, *packet_id, buf),
        Packet::Subscribe(subscribe) => encode_subscribe(subscribe, buf),
        Packet::Suback(suback) => {
            let mut body = Vec::with_capacity(2 + suback.return_codes.len());
            body.extend_from_slice(&suback.packet_id.to_be_bytes());
            body.extend_from_slice(&suback.return_codes);
            frame(PacketType::Suback, 0, &body, buf)
        }
        Packet::Unsubscribe(unsubscribe) => encode_unsubscribe(unsubscribe, buf),
        Packet::Unsuback { packet_id } => encode_id_only(PacketType::Unsuback, 0, *packet_id, buf),
        Packet::Pingreq => frame(PacketType::Pingreq, 0, &[], buf),
        Packet::Pingresp => frame(PacketType::Pingresp, 0, &[], buf),
        Packet::Disconnect => frame(PacketType::Disconnect, 0, &[], buf),
    }
}

fn frame(packet_type: PacketType, flags: u8, body: &[u8], buf: &mut Vec<u8>) -> Result<()> {
    varint::check_len(body.len())?;
    buf.reserve(1 + varint::encoded_len(body.len()) + body.len());
    buf.push(((packet_type as u8) << 4) | flags);
    varint::encode(body.len(), buf);
    buf.extend_from_slice(body);
    Ok(())
}

fn encode_id_only(packet_type: PacketType, flags: u8, packet_id: u16, buf: &mut Vec<u8>) -> Result<()> {
    frame(packet_type, flags, &packet_id.to_be_bytes(), buf)
}

fn put_str(value: &[u8], out: &mut Vec<u8>) -> Result<()> {
    let len = u16::try_from(value.len()).map_err(|_| {
        ProtocolError::MalformedPacket(format!("field of {} bytes exceeds 65535", value.len()))
    })?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(value);
    Ok(())
}

fn encode_connect(connect: &Connect, buf: &mut Vec<u8>) -> Result<()> {
    let mut body = Vec::with_capacity(32 + connect.client_id.len());

    put_str(b"MQTT", &mut body)?;
    body.push(PROTOCOL_LEVEL);

    let mut flags = 0u8;
    if connect.clean_session {
        flags |= 0x02;
    }
    if let Some(will) = &connect.will {
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
    body.push(flags);
    body.extend_from_slice(&connect.keep_alive.to_be_bytes());

    put_str(connect.client_id.as_bytes(), &mut body)?;
    if let Some(will) = &connect.will {
        put_str(will.topic.as_bytes(), &mut body)?;
        put_str(&will.payload, &mut body)?;
    }
    if let Some(username) = &connect.username {
        put_str(username.as_bytes(), &mut body)?;
    }
    if let Some(password) = &connect.password {
        put_str(password, &mut body)?;
    }

    frame(PacketType::Connect, 0, &body, buf)
}

fn encode_publish(publish: &Publish, buf: &mut Vec<u8>) -> Result<()> {
    let mut flags = (publish.qos as u8) << 1;
    if publish.dup {
        flags |= 0x08;
    }
    if publish.retain {
        flags |= 0x01;
    }

    let mut body = Vec::with_capacity(4 + publish.topic.len() + publish.payload.len());
    put_str(publish.topic.as_bytes(), &mut body)?;
    match (publish.qos, publish.packet_id) {
        (QoS::AtMostOnce, _) => {}
        (_, Some(id)) => body.extend_from_slice(&id.to_be_bytes()),
        (qos, None) => {
            return Err(ProtocolError::MalformedPacket(format!(
                "PUBLISH with {:?} requires a packet identifier",
                qos
            ))
            .into())
        }
    }
    body.extend_from_slice(&publish.payload);

    frame(PacketType::Publish, flags, &body, buf)
}

fn encode_subscribe(subscribe: &Subscribe, buf: &mut Vec<u8>) -> Result<()> {
    let mut body = Vec::new();
    body.extend_from_slice(&subscribe.packet_id.to_be_bytes());
    for (filter, qos) in &subscribe.topics {
        put_str(filter.as_bytes(), &mut body)?;
        body.push(*qos as u8);
    }
    frame(PacketType::Subscribe, 0x02, &body, buf)
}

fn encode_unsubscribe(unsubscribe: &Unsubscribe, buf: &mut Vec<u8>) -> Result<()> {
    let mut body = Vec::new();
    body.extend_from_slice(&unsubscribe.packet_id.to_be_bytes());
    for filter in &unsubscribe.topics {
        put_str(filter.as_bytes(), &mut body)?;
    }
    frame(PacketType::Unsubscribe, 0x02, &body, buf)
}

// === Topic Validation ===

/// Validate a topic name used for PUBLISH or a will message.
pub fn validate_topic_name(topic: &str) -> std::result::Result<(), ProtocolError> {
    check_topic_common(topic)?;
    if topic.contains(['+', '#']) {
        return Err(ProtocolError::MalformedPacket(format!(
            "topic name '{}' must not contain wildcards",
            topic
        )));
    }
    Ok(())
}

/// Validate a topic filter used for SUBSCRIBE or UNSUBSCRIBE.
///
/// `+` must occupy a whole level; `#` must occupy the last level.
pub fn validate_topic_filter(filter: &str) -> std::result::Result<(), ProtocolError> {
    check_topic_common(filter)?;
    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        let bad_plus = level.contains('+') && *level != "+";
        let bad_hash = level.contains('#') && (*level != "#" || i + 1 != levels.len());
        if bad_plus || bad_hash {
            return Err(ProtocolError::MalformedPacket(format!(
                "invalid wildcard placement in topic filter '{}'",
                filter
            )));
        }
    }
    Ok(())
}

fn check_topic_common(topic: &str) -> std::result::Result<(), ProtocolError> {
    if topic.is_empty() {
        return Err(ProtocolError::MalformedPacket("topic must not be empty".into()));
    }
    if topic.len() > u16::MAX as usize {
        return Err(ProtocolError::MalformedPacket(format!(
            "topic of {} bytes exceeds 65535",
            topic.len()
        )));
    }
    if topic.contains('\0') {
        return Err(ProtocolError::MalformedPacket(
            "topic must not contain null character".into(),
        ));
    }
    Ok(())
}
