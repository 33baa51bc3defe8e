use bytes::Bytes;
use log::trace;
use std::convert::TryFrom;
use std::fmt::Write;

use crate::error::{Error, Result};
use crate::event::{Event, RESERVED_EVENTS};
use crate::payload::Payload;
use crate::value::Value;

/// An enumeration of the different `Packet` types in the `socket.io` protocol.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PacketId {
    Connect = 0,
    Disconnect = 1,
    Event = 2,
    Ack = 3,
    ConnectError = 4,
    BinaryEvent = 5,
    BinaryAck = 6,
}

impl TryFrom<u8> for PacketId {
    type Error = Error;
    fn try_from(b: u8) -> Result<Self> {
        PacketId::try_from(b as char)
    }
}

impl TryFrom<char> for PacketId {
    type Error = Error;
    fn try_from(b: char) -> Result<Self> {
        match b {
            '0' => Ok(PacketId::Connect),
            '1' => Ok(PacketId::Disconnect),
            '2' => Ok(PacketId::Event),
            '3' => Ok(PacketId::Ack),
            '4' => Ok(PacketId::ConnectError),
            '5' => Ok(PacketId::BinaryEvent),
            '6' => Ok(PacketId::BinaryAck),
            _ => Err(Error::InvalidPacketId(b)),
        }
    }
}

/// A packet which gets sent or received during in the `socket.io` protocol.
/// Binary data stays inside `data`, the [`Encoder`] moves it out into
/// attachments and the [`Decoder`] moves it back.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Packet {
    pub packet_type: PacketId,
    pub nsp: String,
    pub id: Option<u64>,
    pub data: Option<Value>,
}

impl Default for Packet {
    fn default() -> Self {
        Self {
            packet_type: PacketId::Event,
            nsp: String::from("/"),
            id: None,
            data: None,
        }
    }
}

impl Packet {
    /// Creates an instance.
    pub fn new<T: Into<String>>(
        packet_type: PacketId,
        nsp: T,
        data: Option<Value>,
        id: Option<u64>,
    ) -> Self {
        Packet {
            packet_type,
            nsp: nsp.into(),
            id,
            data,
        }
    }

    pub(crate) fn connect(nsp: &str, auth: Option<Value>) -> Self {
        Packet::new(PacketId::Connect, nsp, auth, None)
    }

    pub(crate) fn disconnect(nsp: &str) -> Self {
        Packet::new(PacketId::Disconnect, nsp, None, None)
    }

    /// An event packet, the event name goes first in the data array.
    pub(crate) fn event(nsp: &str, event: &Event, payload: Payload, id: Option<u64>) -> Self {
        let mut args = Vec::with_capacity(payload.len() + 1);
        args.push(Value::from(event.as_str()));
        args.extend(payload);
        Packet::new(PacketId::Event, nsp, Some(Value::Array(args)), id)
    }

    pub(crate) fn ack(nsp: &str, id: u64, payload: Payload) -> Self {
        Packet::new(
            PacketId::Ack,
            nsp,
            Some(Value::Array(payload.into_args())),
            Some(id),
        )
    }

    /// The arguments of an event or ack packet.
    pub(crate) fn into_args(self) -> Vec<Value> {
        match self.data {
            Some(Value::Array(args)) => args,
            _ => Vec::new(),
        }
    }
}

/// One frame on the `engine.io` connection. Binary packets take a text header
/// followed by one binary chunk per attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Text(String),
    Binary(Bytes),
}

/// Checks the data of a packet against what its type allows.
pub fn is_payload_valid(packet_type: PacketId, data: Option<&Value>) -> bool {
    match packet_type {
        PacketId::Connect => data.map_or(true, |data| data.as_object().is_some()),
        PacketId::Disconnect => data.is_none(),
        PacketId::ConnectError => {
            matches!(data, Some(Value::String(_)) | Some(Value::Object(_)))
        }
        PacketId::Event | PacketId::BinaryEvent => {
            match data.and_then(Value::as_array).and_then(|args| args.first()) {
                Some(Value::Number(_)) => true,
                Some(Value::String(name)) => !RESERVED_EVENTS.contains(&name.as_str()),
                _ => false,
            }
        }
        PacketId::Ack | PacketId::BinaryAck => data.and_then(Value::as_array).is_some(),
    }
}

/// Turns packets into chunks.
#[derive(Debug, Default, Clone, Copy)]
pub struct Encoder;

impl Encoder {
    /// Event and ack packets that carry binary data are sent as their binary
    /// variant: a header in which every binary leaf is replaced by a
    /// placeholder, followed by the leaves themselves.
    pub fn encode(&self, packet: &Packet) -> Vec<Chunk> {
        let binary_type = match packet.packet_type {
            PacketId::Event if packet.data.as_ref().is_some_and(Value::has_binary) => {
                Some(PacketId::BinaryEvent)
            }
            PacketId::Ack if packet.data.as_ref().is_some_and(Value::has_binary) => {
                Some(PacketId::BinaryAck)
            }
            PacketId::BinaryEvent | PacketId::BinaryAck => Some(packet.packet_type),
            _ => None,
        };

        let Some(packet_type) = binary_type else {
            return vec![Chunk::Text(encode_header(
                packet.packet_type,
                &packet.nsp,
                packet.id,
                None,
                packet.data.as_ref(),
            ))];
        };

        let mut buffers = Vec::new();
        let data = packet.data.clone().map(|data| data.deconstruct(&mut buffers));
        trace!("encoded packet with {} attachments", buffers.len());

        let mut chunks = Vec::with_capacity(buffers.len() + 1);
        chunks.push(Chunk::Text(encode_header(
            packet_type,
            &packet.nsp,
            packet.id,
            Some(buffers.len()),
            data.as_ref(),
        )));
        chunks.extend(buffers.into_iter().map(Chunk::Binary));
        chunks
    }
}

fn encode_header(
    packet_type: PacketId,
    nsp: &str,
    id: Option<u64>,
    attachments: Option<usize>,
    data: Option<&Value>,
) -> String {
    // first the packet type
    let mut buffer = String::new();
    buffer.push((packet_type as u8 + b'0') as char);

    // eventually a number of attachments, followed by '-'
    if let Some(attachments) = attachments {
        let _ = write!(buffer, "{attachments}-");
    }

    // if the namespace is different from the default one append it as well,
    // followed by ','
    if !nsp.is_empty() && nsp != "/" {
        buffer.push_str(nsp);
        buffer.push(',');
    }

    if let Some(id) = id {
        let _ = write!(buffer, "{id}");
    }

    if let Some(data) = data {
        buffer.push_str(&data.to_json().to_string());
    }

    buffer
}

/// Collects the attachments of a binary packet.
#[derive(Debug)]
struct BinaryReconstructor {
    packet: Packet,
    attachments: usize,
    buffers: Vec<Bytes>,
}

impl BinaryReconstructor {
    fn finish(self) -> Result<Packet> {
        let BinaryReconstructor {
            mut packet,
            buffers,
            ..
        } = self;
        packet.data = packet
            .data
            .map(|data| data.reconstruct(&buffers))
            .transpose()?;
        Ok(packet)
    }
}

/// Turns chunks back into packets. Binary packets are held back until all of
/// their attachments arrived and are surfaced as plain event or ack packets.
#[derive(Debug, Default)]
pub struct Decoder {
    reconstructor: Option<BinaryReconstructor>,
}

impl Decoder {
    pub fn new() -> Self {
        Decoder::default()
    }

    /// Feeds one chunk. Any error means the stream can't be trusted anymore.
    pub fn add(&mut self, chunk: Chunk) -> Result<Option<Packet>> {
        match chunk {
            Chunk::Text(text) => {
                if self.reconstructor.is_some() {
                    return Err(Error::UnexpectedPlaintext());
                }
                let (mut packet, attachments) = decode_header(&text)?;
                packet.packet_type = match packet.packet_type {
                    PacketId::BinaryEvent => PacketId::Event,
                    PacketId::BinaryAck => PacketId::Ack,
                    _ => return Ok(Some(packet)),
                };
                if attachments == 0 {
                    return Ok(Some(packet));
                }
                self.reconstructor = Some(BinaryReconstructor {
                    packet,
                    attachments,
                    buffers: Vec::with_capacity(attachments),
                });
                Ok(None)
            }
            Chunk::Binary(data) => {
                let mut reconstructor = self
                    .reconstructor
                    .take()
                    .ok_or(Error::UnexpectedBinary())?;
                reconstructor.buffers.push(data);
                if reconstructor.buffers.len() < reconstructor.attachments {
                    self.reconstructor = Some(reconstructor);
                    return Ok(None);
                }
                reconstructor.finish().map(Some)
            }
        }
    }

    /// Drops a partially received binary packet.
    pub fn reset(&mut self) {
        self.reconstructor = None;
    }

    pub fn is_reconstructing(&self) -> bool {
        self.reconstructor.is_some()
    }
}

fn decode_header(text: &str) -> Result<(Packet, usize)> {
    let first = *text.as_bytes().first().ok_or(Error::IncompletePacket())?;
    let packet_type = PacketId::try_from(first)?;
    let mut payload = &text[1..];

    let mut attachments = 0;
    if let PacketId::BinaryAck | PacketId::BinaryEvent = packet_type {
        let (count, rest) = payload
            .split_once('-')
            .ok_or(Error::IllegalAttachments())?;
        attachments = count.parse().map_err(|_| Error::IllegalAttachments())?;
        payload = rest;
    }

    let mut nsp = String::from("/");
    if payload.starts_with('/') {
        match payload.split_once(',') {
            Some((prefix, rest)) => {
                nsp = prefix.to_owned();
                payload = rest;
            }
            None => {
                nsp = payload.to_owned();
                payload = "";
            }
        }
    }

    let digits = payload
        .bytes()
        .take_while(|b| b.is_ascii_digit())
        .count();
    let mut id = None;
    if digits > 0 {
        let (prefix, rest) = payload.split_at(digits);
        id = Some(prefix.parse().map_err(|_| Error::InvalidPacket())?);
        payload = rest;
    }

    let mut data = None;
    if !payload.is_empty() {
        let json: serde_json::Value =
            serde_json::from_str(payload).map_err(|_| Error::InvalidPayload())?;
        let value = Value::from(json);
        if !is_payload_valid(packet_type, Some(&value)) {
            return Err(Error::InvalidPayload());
        }
        data = Some(value);
    }

    Ok((
        Packet {
            packet_type,
            nsp,
            id,
            data,
        },
        attachments,
    ))
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn text(chunk: &Chunk) -> &str {
        match chunk {
            Chunk::Text(text) => text,
            Chunk::Binary(_) => panic!("expected a text chunk"),
        }
    }

    fn decode_one(text: &str) -> Result<Option<Packet>> {
        Decoder::new().add(Chunk::Text(text.to_owned()))
    }

    #[test]
    fn encode_plain_packets() {
        let encoder = Encoder;

        let packet = Packet::connect("/", None);
        assert_eq!(encoder.encode(&packet), vec![Chunk::Text("0".to_owned())]);

        let packet = Packet::connect("/admin", Some(Value::from(json!({"token": "123"}))));
        assert_eq!(
            encoder.encode(&packet),
            vec![Chunk::Text("0/admin,{\"token\":\"123\"}".to_owned())]
        );

        let packet = Packet::event("/", &Event::from("hello"), Payload::from("world"), Some(12));
        assert_eq!(
            encoder.encode(&packet),
            vec![Chunk::Text("212[\"hello\",\"world\"]".to_owned())]
        );

        let packet = Packet::ack("/admin", 4, Payload::from(vec![json!(1), json!({"ok": true})]));
        assert_eq!(
            encoder.encode(&packet),
            vec![Chunk::Text("3/admin,4[1,{\"ok\":true}]".to_owned())]
        );

        let packet = Packet::disconnect("/admin");
        assert_eq!(encoder.encode(&packet), vec![Chunk::Text("1/admin,".to_owned())]);
    }

    #[test]
    fn encode_binary_event() {
        let payload = Payload::new(vec![
            Value::from(vec![1_u8, 2]),
            Value::from(json!({"kind": "avatar"})),
            Value::from(vec![3_u8]),
        ]);
        let packet = Packet::event("/admin", &Event::from("upload"), payload, Some(7));
        let chunks = Encoder.encode(&packet);

        assert_eq!(chunks.len(), 3);
        assert_eq!(
            text(&chunks[0]),
            "52-/admin,7[\"upload\",{\"_placeholder\":true,\"num\":0},{\"kind\":\"avatar\"},{\"_placeholder\":true,\"num\":1}]"
        );
        assert_eq!(chunks[1], Chunk::Binary(Bytes::from_static(&[1, 2])));
        assert_eq!(chunks[2], Chunk::Binary(Bytes::from_static(&[3])));

        let mut decoder = Decoder::new();
        let mut decoded = None;
        for chunk in chunks {
            decoded = decoder.add(chunk).unwrap();
        }
        assert!(!decoder.is_reconstructing());
        assert_eq!(decoded, Some(packet));
    }

    #[test]
    fn binary_ack_round_trip() {
        let packet = Packet::ack("/", 3, Payload::from(Bytes::from_static(b"pong")));
        let chunks = Encoder.encode(&packet);
        assert_eq!(text(&chunks[0]), "61-3[{\"_placeholder\":true,\"num\":0}]");

        let mut decoder = Decoder::new();
        assert_eq!(decoder.add(chunks[0].clone()).unwrap(), None);
        assert!(decoder.is_reconstructing());
        assert_eq!(decoder.add(chunks[1].clone()).unwrap(), Some(packet));
    }

    #[test]
    fn decode_header_fields() {
        let packet = decode_one("2/admin,456[\"project:delete\",123]")
            .unwrap()
            .unwrap();
        assert_eq!(packet.packet_type, PacketId::Event);
        assert_eq!(packet.nsp, "/admin");
        assert_eq!(packet.id, Some(456));
        assert_eq!(
            packet.data,
            Some(Value::from(json!(["project:delete", 123])))
        );

        let packet = decode_one("0{\"sid\":\"abc\"}").unwrap().unwrap();
        assert_eq!(packet.packet_type, PacketId::Connect);
        assert_eq!(packet.nsp, "/");
        assert_eq!(packet.id, None);

        let packet = decode_one("1/admin").unwrap().unwrap();
        assert_eq!(packet.packet_type, PacketId::Disconnect);
        assert_eq!(packet.nsp, "/admin");
        assert_eq!(packet.data, None);

        let packet = decode_one("4{\"message\":\"Not authorized\"}").unwrap().unwrap();
        assert_eq!(packet.packet_type, PacketId::ConnectError);
    }

    #[test]
    fn decode_rejects_malformed_packets() {
        assert!(matches!(decode_one(""), Err(Error::IncompletePacket())));
        assert!(matches!(decode_one("9"), Err(Error::InvalidPacketId('9'))));
        assert!(matches!(
            decode_one("5[\"a\"]"),
            Err(Error::IllegalAttachments())
        ));
        assert!(matches!(
            decode_one("5x-[\"a\"]"),
            Err(Error::IllegalAttachments())
        ));
        assert!(matches!(decode_one("2[\"a\""), Err(Error::InvalidPayload())));
        assert!(matches!(
            decode_one("299999999999999999999[\"a\"]"),
            Err(Error::InvalidPacket())
        ));
    }

    #[test]
    fn payload_validation() {
        let json = |value: serde_json::Value| Value::from(value);

        assert!(is_payload_valid(PacketId::Connect, None));
        assert!(is_payload_valid(PacketId::Connect, Some(&json(json!({})))));
        assert!(!is_payload_valid(PacketId::Connect, Some(&json(json!("a")))));

        assert!(is_payload_valid(PacketId::Disconnect, None));
        assert!(!is_payload_valid(PacketId::Disconnect, Some(&json(json!({})))));

        assert!(is_payload_valid(PacketId::ConnectError, Some(&json(json!("no")))));
        assert!(is_payload_valid(PacketId::ConnectError, Some(&json(json!({"message": "no"})))));
        assert!(!is_payload_valid(PacketId::ConnectError, Some(&json(json!(1)))));
        assert!(!is_payload_valid(PacketId::ConnectError, None));

        assert!(is_payload_valid(PacketId::Event, Some(&json(json!(["chat", 1])))));
        assert!(is_payload_valid(PacketId::Event, Some(&json(json!([1, "a"])))));
        assert!(!is_payload_valid(PacketId::Event, Some(&json(json!([])))));
        assert!(!is_payload_valid(PacketId::Event, Some(&json(json!({"a": 1})))));
        for reserved in RESERVED_EVENTS {
            assert!(!is_payload_valid(PacketId::Event, Some(&json(json!([reserved])))));
        }

        assert!(is_payload_valid(PacketId::Ack, Some(&json(json!([])))));
        assert!(!is_payload_valid(PacketId::Ack, Some(&json(json!("a")))));

        assert!(matches!(decode_one("1\"bye\""), Err(Error::InvalidPayload())));
        assert!(matches!(decode_one("2[\"connect\"]"), Err(Error::InvalidPayload())));
        assert!(matches!(decode_one("3{}"), Err(Error::InvalidPayload())));
    }

    #[test]
    fn reconstruction_is_strict() {
        let mut decoder = Decoder::new();
        assert!(matches!(
            decoder.add(Chunk::Binary(Bytes::from_static(b"x"))),
            Err(Error::UnexpectedBinary())
        ));

        assert_eq!(
            decoder
                .add(Chunk::Text(
                    "52-[\"a\",{\"_placeholder\":true,\"num\":0},{\"_placeholder\":true,\"num\":1}]"
                        .to_owned()
                ))
                .unwrap(),
            None
        );
        assert!(matches!(
            decoder.add(Chunk::Text("2[\"b\"]".to_owned())),
            Err(Error::UnexpectedPlaintext())
        ));

        let mut decoder = Decoder::new();
        decoder
            .add(Chunk::Text(
                "51-[\"a\",{\"_placeholder\":true,\"num\":3}]".to_owned(),
            ))
            .unwrap();
        assert!(matches!(
            decoder.add(Chunk::Binary(Bytes::from_static(b"x"))),
            Err(Error::IllegalAttachments())
        ));
        assert!(!decoder.is_reconstructing());
    }

    #[test]
    fn binary_packet_without_attachments_is_surfaced_at_once() {
        let mut decoder = Decoder::new();
        let packet = decoder
            .add(Chunk::Text("50-[\"a\"]".to_owned()))
            .unwrap()
            .unwrap();
        assert_eq!(packet.packet_type, PacketId::Event);
        assert!(!decoder.is_reconstructing());
    }
}
