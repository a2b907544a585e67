//! Headphone family packet codec.
//!
//! ```text
//! 0x3E | escaped( type:u8 | seq:u8 | len:u32 BE | payload | checksum:u8 ) | 0x3C
//! ```
//!
//! The checksum is the byte sum of everything between the markers. Inside
//! the markers 0x3C, 0x3D and 0x3E are sent as `0x3D, b & 0xEF`.

use crate::error::{ensure, ProtocolError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

pub const PACKET_HEADER: u8 = 0x3E;
pub const PACKET_TRAILER: u8 = 0x3C;
pub const PACKET_ESCAPE: u8 = 0x3D;
const ESCAPE_MASK: u8 = 0xEF;
const UNESCAPE_MASK: u8 = 0x10;

/// type + seq + len, plus the trailing checksum.
const PACKET_OVERHEAD: usize = 1 + 1 + 4 + 1;

pub const BATTERY_LEVEL_REQUEST: u8 = 0x10;
pub const BATTERY_LEVEL_REPLY: u8 = 0x11;
pub const BATTERY_LEVEL_NOTIFY: u8 = 0x13;

/// Packet type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Ack,
    Command1,
    Command2,
    Unknown(u8),
}

impl MessageType {
    pub fn as_u8(self) -> u8 {
        match self {
            MessageType::Ack => 0x01,
            MessageType::Command1 => 0x0C,
            MessageType::Command2 => 0x0E,
            MessageType::Unknown(b) => b,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            0x01 => MessageType::Ack,
            0x0C => MessageType::Command1,
            0x0E => MessageType::Command2,
            other => MessageType::Unknown(other),
        }
    }
}

/// One unescaped, checksum-verified packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub message_type: MessageType,
    pub sequence: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(message_type: MessageType, sequence: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            message_type,
            sequence,
            payload: payload.into(),
        }
    }

    pub fn ack(sequence: u8) -> Self {
        Self::new(MessageType::Ack, sequence, Bytes::new())
    }

    /// Encodes the packet including markers.
    pub fn encode(&self) -> BytesMut {
        let mut raw = BytesMut::with_capacity(PACKET_OVERHEAD + self.payload.len());
        raw.put_u8(self.message_type.as_u8());
        raw.put_u8(self.sequence);
        raw.put_u32(self.payload.len() as u32);
        raw.put_slice(&self.payload);
        raw.put_u8(checksum(&raw));

        let mut out = BytesMut::with_capacity(raw.len() + 2);
        out.put_u8(PACKET_HEADER);
        out.put_slice(&escape(&raw));
        out.put_u8(PACKET_TRAILER);
        out
    }

    /// Decodes the bytes between (and excluding) the two markers.
    pub fn decode(escaped: &[u8]) -> Result<Self, ProtocolError> {
        let raw = unescape(escaped)?;
        ensure(&raw, PACKET_OVERHEAD, "headphone packet")?;

        let (body, tail) = raw.split_at(raw.len() - 1);
        let expected = checksum(body);
        if tail[0] != expected {
            return Err(ProtocolError::BadChecksum {
                expected,
                actual: tail[0],
            });
        }

        let mut buf = body;
        let message_type = MessageType::from_u8(buf.get_u8());
        let sequence = buf.get_u8();
        let declared = buf.get_u32() as usize;
        if declared != buf.len() {
            return Err(ProtocolError::LengthMismatch {
                declared,
                actual: buf.len(),
            });
        }

        Ok(Self {
            message_type,
            sequence,
            payload: Bytes::copy_from_slice(buf),
        })
    }
}

/// Wrapping byte sum.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &b in data {
        if matches!(b, PACKET_TRAILER | PACKET_ESCAPE | PACKET_HEADER) {
            out.push(PACKET_ESCAPE);
            out.push(b & ESCAPE_MASK);
        } else {
            out.push(b);
        }
    }
    out
}

pub fn unescape(data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter();
    while let Some(&b) = iter.next() {
        if b == PACKET_ESCAPE {
            let next = iter.next().ok_or(ProtocolError::InvalidEscape)?;
            out.push(next | UNESCAPE_MASK);
        } else {
            out.push(b);
        }
    }
    Ok(out)
}

/// Splits a byte stream into marker-delimited packets.
#[derive(Debug, Default)]
pub struct PacketDecoder {
    buffer: BytesMut,
}

impl PacketDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns the next complete packet, if any.
    ///
    /// Bytes before a header marker are discarded. A packet that fails to
    /// decode is consumed and returned as an error.
    pub fn decode_packet(&mut self) -> Option<Result<Packet, ProtocolError>> {
        let start = match self.buffer.iter().position(|b| *b == PACKET_HEADER) {
            Some(start) => start,
            None => {
                self.buffer.clear();
                return None;
            }
        };
        self.buffer.advance(start);

        let end = self.buffer.iter().position(|b| *b == PACKET_TRAILER)?;
        let packet = self.buffer.split_to(end + 1);
        Some(Packet::decode(&packet[1..end]))
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Battery arrangement reported in a battery message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatteryType {
    Single,
    Dual,
    Case,
}

impl BatteryType {
    pub fn as_u8(self) -> u8 {
        match self {
            BatteryType::Single => 0,
            BatteryType::Dual => 1,
            BatteryType::Case => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(BatteryType::Single),
            1 => Some(BatteryType::Dual),
            2 => Some(BatteryType::Case),
            _ => None,
        }
    }
}

/// One battery's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryLevel {
    /// 0 for single/case, 1 left and 2 right for dual.
    pub index: u8,
    pub level: u8,
    pub charging: bool,
}

/// Payload of a battery level request.
pub fn battery_request(battery_type: BatteryType) -> Packet {
    Packet::new(
        MessageType::Command1,
        0,
        vec![BATTERY_LEVEL_REQUEST, battery_type.as_u8()],
    )
}

/// Parses a battery reply or notification payload. Returns `None` for
/// payloads that are not battery messages.
pub fn parse_battery(payload: &[u8]) -> Result<Option<Vec<BatteryLevel>>, ProtocolError> {
    match payload.first() {
        Some(&BATTERY_LEVEL_REPLY) | Some(&BATTERY_LEVEL_NOTIFY) => {}
        _ => return Ok(None),
    }
    ensure(payload, 4, "battery message")?;

    let battery_type = match BatteryType::from_u8(payload[1]) {
        Some(t) => t,
        None => return Ok(None),
    };

    let levels = match battery_type {
        BatteryType::Single | BatteryType::Case => vec![BatteryLevel {
            index: 0,
            level: payload[2],
            charging: payload[3] == 1,
        }],
        BatteryType::Dual => {
            ensure(payload, 6, "dual battery message")?;
            [(1, payload[2], payload[3]), (2, payload[4], payload[5])]
                .into_iter()
                .filter(|(_, level, _)| *level > 0)
                .map(|(index, level, charging)| BatteryLevel {
                    index,
                    level,
                    charging: charging == 1,
                })
                .collect()
        }
    };
    Ok(Some(levels))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BATTERY_PACKET: [u8; 16] = [
        0x3e, 0x0c, 0x00, 0x00, 0x00, 0x00, 0x08, 0x68, 0x15, 0x01, 0x01, 0x00, 0x03, 0x01, 0x0f,
        0xa6,
    ];

    #[test]
    fn test_encode_known_packet() {
        let packet = Packet::new(
            MessageType::Command1,
            0,
            vec![0x68, 0x15, 0x01, 0x01, 0x00, 0x03, 0x01, 0x0f],
        );
        let encoded = packet.encode();
        assert_eq!(&encoded[..16], &BATTERY_PACKET[..]);
        assert_eq!(encoded[16], PACKET_TRAILER);
    }

    #[test]
    fn test_decode_known_packet() {
        let packet = Packet::decode(&BATTERY_PACKET[1..]).unwrap();
        assert_eq!(packet.message_type, MessageType::Command1);
        assert_eq!(packet.sequence, 0);
        assert_eq!(packet.payload.len(), 8);
    }

    #[test]
    fn test_escape_markers() {
        assert_eq!(escape(&[0x3c, 0x3d, 0x3e, 0x01]), vec![0x3d, 0x2c, 0x3d, 0x2d, 0x3d, 0x2e, 0x01]);
        assert_eq!(
            unescape(&[0x3d, 0x2c, 0x3d, 0x2d, 0x3d, 0x2e, 0x01]).unwrap(),
            vec![0x3c, 0x3d, 0x3e, 0x01]
        );
        assert!(matches!(unescape(&[0x01, 0x3d]), Err(ProtocolError::InvalidEscape)));
    }

    #[test]
    fn test_payload_with_markers_survives() {
        let packet = Packet::new(MessageType::Command2, 1, vec![0x3c, 0x3e, 0x3d]);
        let encoded = packet.encode();
        assert!(!encoded[1..encoded.len() - 1].contains(&PACKET_TRAILER));

        let mut decoder = PacketDecoder::new();
        decoder.extend(&encoded);
        assert_eq!(decoder.decode_packet().unwrap().unwrap(), packet);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_bad_checksum_rejected() {
        let mut raw = BATTERY_PACKET[1..].to_vec();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        assert!(matches!(
            Packet::decode(&raw),
            Err(ProtocolError::BadChecksum { expected: 0xa6, .. })
        ));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let mut raw = vec![0x0c, 0x00, 0x00, 0x00, 0x00, 0x05, 0x01];
        raw.push(checksum(&raw));
        assert!(matches!(
            Packet::decode(&raw),
            Err(ProtocolError::LengthMismatch { declared: 5, actual: 1 })
        ));
    }

    #[test]
    fn test_decoder_skips_garbage_and_waits() {
        let mut decoder = PacketDecoder::new();
        decoder.extend(&[0xaa, 0xbb]);
        decoder.extend(&BATTERY_PACKET[..10]);
        assert!(decoder.decode_packet().is_none());

        decoder.extend(&BATTERY_PACKET[10..]);
        decoder.extend(&[PACKET_TRAILER]);
        let packet = decoder.decode_packet().unwrap().unwrap();
        assert_eq!(packet.message_type, MessageType::Command1);
        assert!(decoder.decode_packet().is_none());
    }

    #[test]
    fn test_parse_battery_single_and_dual() {
        let single = parse_battery(&[0x11, 0, 80, 1]).unwrap().unwrap();
        assert_eq!(
            single,
            vec![BatteryLevel {
                index: 0,
                level: 80,
                charging: true
            }]
        );

        let dual = parse_battery(&[0x13, 1, 70, 0, 60, 1]).unwrap().unwrap();
        assert_eq!(dual.len(), 2);
        assert_eq!(dual[0].index, 1);
        assert_eq!(dual[1].index, 2);
        assert!(dual[1].charging);

        let one_bud = parse_battery(&[0x13, 1, 0, 0, 60, 0]).unwrap().unwrap();
        assert_eq!(one_bud.len(), 1);
        assert_eq!(one_bud[0].index, 2);

        assert!(parse_battery(&[0x22, 0]).unwrap().is_none());
        assert!(parse_battery(&[0x11, 1, 50]).is_err());
    }

    #[test]
    fn test_battery_request() {
        let packet = battery_request(BatteryType::Case);
        assert_eq!(packet.message_type, MessageType::Command1);
        assert_eq!(&packet.payload[..], &[0x10, 2]);
    }
}
