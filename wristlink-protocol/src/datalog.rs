//! Datalog wire messages.
//!
//! ```text
//! OPEN      | 0x01 | id | uuid:16 | timestamp:u32 LE | tag:i32 LE | item_type:u8 | item_size:u16 LE
//! SENDDATA  | 0x02 | id | items_left:u32 LE | crc:u32 LE | data
//! CLOSE     | 0x03 | id
//! TIMEOUT   | 0x07 | id
//! ACK/NACK  | 0x85/0x86 | id
//! ```

use crate::endpoint;
use crate::error::{ensure, ProtocolError};
use crate::frame::Frame;
use bytes::{Buf, Bytes};
use uuid::Uuid;

pub const DATALOG_OPEN: u8 = 0x01;
pub const DATALOG_SENDDATA: u8 = 0x02;
pub const DATALOG_CLOSE: u8 = 0x03;
pub const DATALOG_TIMEOUT: u8 = 0x07;
pub const DATALOG_REPORTSESSIONS: u8 = 0x84;
pub const DATALOG_ACK: u8 = 0x85;
pub const DATALOG_NACK: u8 = 0x86;

/// Datalog message sent by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatalogMessage {
    Open {
        id: u8,
        uuid: Uuid,
        timestamp: u32,
        tag: i32,
        item_type: u8,
        item_size: u16,
    },
    SendData {
        id: u8,
        items_left: u32,
        crc: u32,
        data: Bytes,
    },
    Close {
        id: u8,
    },
    Timeout {
        id: u8,
    },
    /// Any other command. Answered with a NACK.
    Unknown {
        command: u8,
        id: u8,
    },
}

impl DatalogMessage {
    pub fn id(&self) -> u8 {
        match self {
            DatalogMessage::Open { id, .. }
            | DatalogMessage::SendData { id, .. }
            | DatalogMessage::Close { id }
            | DatalogMessage::Timeout { id }
            | DatalogMessage::Unknown { id, .. } => *id,
        }
    }

    /// Parses a datalog frame payload.
    pub fn parse(payload: &Bytes) -> Result<Self, ProtocolError> {
        ensure(payload, 2, "datalog header")?;
        let mut buf = &payload[..];
        let command = buf.get_u8();
        let id = buf.get_u8();

        match command {
            DATALOG_OPEN => {
                ensure(buf, 16 + 4 + 4 + 1 + 2, "datalog open")?;
                let uuid = Uuid::from_u128(buf.get_u128());
                let timestamp = buf.get_u32_le();
                let tag = buf.get_i32_le();
                let item_type = buf.get_u8();
                let item_size = buf.get_u16_le();
                Ok(DatalogMessage::Open {
                    id,
                    uuid,
                    timestamp,
                    tag,
                    item_type,
                    item_size,
                })
            }
            DATALOG_SENDDATA => {
                ensure(buf, 8, "datalog send data")?;
                let items_left = buf.get_u32_le();
                let crc = buf.get_u32_le();
                let data = payload.slice(10..);
                Ok(DatalogMessage::SendData {
                    id,
                    items_left,
                    crc,
                    data,
                })
            }
            DATALOG_CLOSE => Ok(DatalogMessage::Close { id }),
            DATALOG_TIMEOUT => Ok(DatalogMessage::Timeout { id }),
            command => Ok(DatalogMessage::Unknown { command, id }),
        }
    }
}

/// ACK or NACK for a session.
pub fn reply(id: u8, ack: bool) -> Frame {
    let command = if ack { DATALOG_ACK } else { DATALOG_NACK };
    Frame::new(endpoint::DATALOG, vec![command, id])
}

/// Asks the device to re-announce its open sessions.
pub fn report_sessions() -> Frame {
    Frame::new(endpoint::DATALOG, vec![DATALOG_REPORTSESSIONS])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_open() {
        let mut raw = vec![DATALOG_OPEN, 3];
        raw.extend_from_slice(&[0u8; 16]);
        raw.extend_from_slice(&1_400_000_000u32.to_le_bytes());
        raw.extend_from_slice(&81i32.to_le_bytes());
        raw.push(2);
        raw.extend_from_slice(&124u16.to_le_bytes());

        let msg = DatalogMessage::parse(&Bytes::from(raw)).unwrap();
        assert_eq!(
            msg,
            DatalogMessage::Open {
                id: 3,
                uuid: Uuid::nil(),
                timestamp: 1_400_000_000,
                tag: 81,
                item_type: 2,
                item_size: 124,
            }
        );
        assert_eq!(msg.id(), 3);
    }

    #[test]
    fn test_parse_send_data_keeps_tail() {
        let mut raw = vec![DATALOG_SENDDATA, 9];
        raw.extend_from_slice(&2u32.to_le_bytes());
        raw.extend_from_slice(&0xdeadbeefu32.to_le_bytes());
        raw.extend_from_slice(&[1, 2, 3, 4]);

        match DatalogMessage::parse(&Bytes::from(raw)).unwrap() {
            DatalogMessage::SendData {
                id,
                items_left,
                crc,
                data,
            } => {
                assert_eq!(id, 9);
                assert_eq!(items_left, 2);
                assert_eq!(crc, 0xdeadbeef);
                assert_eq!(&data[..], &[1, 2, 3, 4]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_close_timeout_unknown() {
        assert_eq!(
            DatalogMessage::parse(&Bytes::from_static(&[0x03, 1])).unwrap(),
            DatalogMessage::Close { id: 1 }
        );
        assert_eq!(
            DatalogMessage::parse(&Bytes::from_static(&[0x07, 2])).unwrap(),
            DatalogMessage::Timeout { id: 2 }
        );
        assert_eq!(
            DatalogMessage::parse(&Bytes::from_static(&[0x42, 4])).unwrap(),
            DatalogMessage::Unknown { command: 0x42, id: 4 }
        );
    }

    #[test]
    fn test_parse_truncated() {
        assert!(DatalogMessage::parse(&Bytes::from_static(&[0x01])).is_err());
        assert!(DatalogMessage::parse(&Bytes::from_static(&[0x01, 1, 0, 0])).is_err());
        assert!(DatalogMessage::parse(&Bytes::from_static(&[0x02, 1, 0, 0, 0, 0])).is_err());
    }

    #[test]
    fn test_replies() {
        let ack = reply(7, true);
        assert_eq!(ack.endpoint, endpoint::DATALOG);
        assert_eq!(&ack.payload[..], &[0x85, 7]);
        assert_eq!(&reply(7, false).payload[..], &[0x86, 7]);
        assert_eq!(&report_sessions().payload[..], &[0x84]);
    }
}
