use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::from_utf8;

use crate::error::{Error, Result};

/// Separator between the packets of a polling payload.
/// See https://en.wikipedia.org/wiki/Delimiter#ASCII_delimited_text
pub const SEPARATOR: char = '\x1e';

/// Base64 grows binary data by a third, the size walk of the write buffer
/// accounts for it with this factor.
const BASE64_OVERHEAD: f64 = 1.33;

/// Enumeration of the `engine.io` `Packet` types.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum PacketId {
    Open,
    Close,
    Ping,
    Pong,
    Message,
    /// A message packet carrying binary data. It shares the wire type `4`
    /// with [`PacketId::Message`].
    MessageBinary,
    Upgrade,
    Noop,
}

impl PacketId {
    /// The ascii digit that introduces a text encoded packet.
    fn to_digit(self) -> char {
        char::from(u8::from(self) + b'0')
    }
}

impl From<PacketId> for u8 {
    fn from(packet_id: PacketId) -> Self {
        match packet_id {
            PacketId::Open => 0,
            PacketId::Close => 1,
            PacketId::Ping => 2,
            PacketId::Pong => 3,
            PacketId::Message | PacketId::MessageBinary => 4,
            PacketId::Upgrade => 5,
            PacketId::Noop => 6,
        }
    }
}

impl TryFrom<u8> for PacketId {
    type Error = Error;
    /// Converts an ascii digit into the corresponding packet id.
    fn try_from(b: u8) -> Result<PacketId> {
        match b {
            b'0' => Ok(PacketId::Open),
            b'1' => Ok(PacketId::Close),
            b'2' => Ok(PacketId::Ping),
            b'3' => Ok(PacketId::Pong),
            b'4' => Ok(PacketId::Message),
            b'5' => Ok(PacketId::Upgrade),
            b'6' => Ok(PacketId::Noop),
            _ => Err(Error::InvalidPacketId(b)),
        }
    }
}

impl Display for PacketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            PacketId::Open => "open",
            PacketId::Close => "close",
            PacketId::Ping => "ping",
            PacketId::Pong => "pong",
            PacketId::Message | PacketId::MessageBinary => "message",
            PacketId::Upgrade => "upgrade",
            PacketId::Noop => "noop",
        };
        f.write_str(name)
    }
}

/// A packet sent in the `engine.io` protocol.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Packet {
    pub packet_id: PacketId,
    pub data: Bytes,
}

/// The wire representation of a single packet. Transports that frame
/// messages natively may send binary data as is, everything else travels
/// as text.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Encoded {
    Text(String),
    Binary(Bytes),
}

/// Data that gets exchanged in the handshake. Its content is usually
/// defined by the server.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HandshakePacket {
    pub sid: String,
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: u64,
}

impl TryFrom<Packet> for HandshakePacket {
    type Error = Error;
    fn try_from(packet: Packet) -> Result<HandshakePacket> {
        if packet.packet_id != PacketId::Open {
            return Err(Error::InvalidHandshake(format!(
                "expected an open packet, got {}",
                packet.packet_id
            )));
        }
        let handshake: HandshakePacket = serde_json::from_slice(&packet.data)
            .map_err(|err| Error::InvalidHandshake(err.to_string()))?;
        if handshake.sid.is_empty() {
            return Err(Error::InvalidHandshake("missing sid".to_owned()));
        }
        Ok(handshake)
    }
}

impl Packet {
    /// Creates a new `Packet`.
    pub fn new<T: Into<Bytes>>(packet_id: PacketId, data: T) -> Self {
        Packet {
            packet_id,
            data: data.into(),
        }
    }

    /// Encodes the packet. Binary data is passed through untouched if the
    /// transport supports it and is base64 encoded behind a `b` marker
    /// otherwise.
    pub fn encode(&self, supports_binary: bool) -> Result<Encoded> {
        match self.packet_id {
            PacketId::MessageBinary if supports_binary => Ok(Encoded::Binary(self.data.clone())),
            PacketId::MessageBinary => {
                let mut text = String::with_capacity(self.data.len() * 4 / 3 + 4);
                text.push('b');
                text.push_str(&STANDARD.encode(&self.data));
                Ok(Encoded::Text(text))
            }
            packet_id => {
                let data = from_utf8(&self.data)?;
                let mut text = String::with_capacity(data.len() + 1);
                text.push(packet_id.to_digit());
                text.push_str(data);
                Ok(Encoded::Text(text))
            }
        }
    }

    /// Decodes a single packet from its wire representation.
    pub fn decode(encoded: Encoded) -> Result<Packet> {
        match encoded {
            Encoded::Binary(data) => Ok(Packet::new(PacketId::MessageBinary, data)),
            Encoded::Text(text) => Packet::decode_str(&text),
        }
    }

    /// Decodes a text encoded packet.
    pub fn decode_str(text: &str) -> Result<Packet> {
        let first = *text.as_bytes().first().ok_or(Error::IncompletePacket())?;

        if first == b'b' {
            let data = STANDARD.decode(&text[1..])?;
            return Ok(Packet::new(PacketId::MessageBinary, data));
        }

        let packet_id = PacketId::try_from(first)?;
        Ok(Packet::new(
            packet_id,
            Bytes::copy_from_slice(text[1..].as_bytes()),
        ))
    }

    /// The number of bytes the data of this packet occupies in a polling
    /// payload. Binary data is accounted for with its base64 expansion.
    pub(crate) fn byte_length(&self) -> usize {
        match self.packet_id {
            PacketId::MessageBinary => (self.data.len() as f64 * BASE64_OVERHEAD).ceil() as usize,
            _ => self.data.len(),
        }
    }
}

/// Encodes a batch of packets into a single polling payload. Every packet is
/// forced into its text form.
pub fn encode_payload(packets: &[Packet]) -> Result<String> {
    let mut payload = String::new();
    for (index, packet) in packets.iter().enumerate() {
        if index > 0 {
            payload.push(SEPARATOR);
        }
        match packet.encode(false)? {
            Encoded::Text(text) => payload.push_str(&text),
            // unreachable as binary support is disabled above
            Encoded::Binary(data) => payload.push_str(&STANDARD.encode(data)),
        }
    }
    Ok(payload)
}

/// Decodes a polling payload. Decoding stops at the first packet that fails
/// to decode, the error is kept as the last element and everything after it
/// is discarded.
pub fn decode_payload(payload: &str) -> Vec<Result<Packet>> {
    let mut packets = Vec::new();
    for encoded in payload.split(SEPARATOR) {
        let packet = Packet::decode_str(encoded);
        let failed = packet.is_err();
        packets.push(packet);
        if failed {
            break;
        }
    }
    packets
}
