//! Application messages: a command, a transaction id and an app UUID,
//! followed by a dictionary for Push and Request.
//!
//! ```text
//! +---------+-----+--------------------------+------------------+
//! | command | tid | uuid (msb, lsb; BE)      | dict (Push/Req)  |
//! | 1 byte  | 1   | 16 bytes                 | variable         |
//! +---------+-----+--------------------------+------------------+
//! ```

use crate::dict::Dict;
use crate::endpoint;
use crate::error::{ensure, ProtocolError};
use crate::frame::Frame;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Command + transaction id + UUID.
pub const APP_MESSAGE_HEADER_SIZE: usize = 18;

/// Application message command byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppCommand {
    Push,
    Request,
    Ack,
    Nack,
}

impl AppCommand {
    pub fn as_u8(self) -> u8 {
        match self {
            AppCommand::Push => 0x01,
            AppCommand::Request => 0x02,
            AppCommand::Ack => 0xff,
            AppCommand::Nack => 0x7f,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(AppCommand::Push),
            0x02 => Some(AppCommand::Request),
            0xff => Some(AppCommand::Ack),
            0x7f => Some(AppCommand::Nack),
            _ => None,
        }
    }

    /// Whether a dictionary follows the header.
    pub fn carries_dict(self) -> bool {
        matches!(self, AppCommand::Push | AppCommand::Request)
    }
}

/// A decoded or to-be-encoded application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppMessage {
    pub command: AppCommand,
    pub transaction_id: u8,
    pub uuid: Uuid,
    /// Empty for Ack and Nack.
    pub dict: Dict,
}

/// The fixed part of an application message, with the undecoded rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppMessageHeader<'a> {
    pub command: AppCommand,
    pub transaction_id: u8,
    pub uuid: Uuid,
    pub body: &'a [u8],
}

impl AppMessage {
    pub fn push(uuid: Uuid, transaction_id: u8, dict: Dict) -> Self {
        Self {
            command: AppCommand::Push,
            transaction_id,
            uuid,
            dict,
        }
    }

    pub fn request(uuid: Uuid, transaction_id: u8, dict: Dict) -> Self {
        Self {
            command: AppCommand::Request,
            transaction_id,
            uuid,
            dict,
        }
    }

    pub fn ack(uuid: Uuid, transaction_id: u8) -> Self {
        Self {
            command: AppCommand::Ack,
            transaction_id,
            uuid,
            dict: Dict::new(),
        }
    }

    pub fn nack(uuid: Uuid, transaction_id: u8) -> Self {
        Self {
            command: AppCommand::Nack,
            transaction_id,
            uuid,
            dict: Dict::new(),
        }
    }

    /// Encodes the message into a frame payload.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let dict_len = if self.command.carries_dict() {
            self.dict.encoded_len()
        } else {
            0
        };
        let mut buf = BytesMut::with_capacity(APP_MESSAGE_HEADER_SIZE + dict_len);
        buf.put_u8(self.command.as_u8());
        buf.put_u8(self.transaction_id);
        buf.put_slice(self.uuid.as_bytes());
        if self.command.carries_dict() {
            self.dict.encode(&mut buf)?;
        }
        Ok(buf.freeze())
    }

    /// Encodes the message as a frame on the application message endpoint.
    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        self.to_frame_on(endpoint::APPLICATION_MESSAGE)
    }

    /// Encodes the message as a frame on an explicit endpoint (the launcher
    /// endpoint carries the same format).
    pub fn to_frame_on(&self, endpoint: u16) -> Result<Frame, ProtocolError> {
        Ok(Frame::new(endpoint, self.encode()?))
    }

    /// Decodes the fixed header, leaving the dictionary bytes undecoded.
    pub fn decode_header(payload: &[u8]) -> Result<AppMessageHeader<'_>, ProtocolError> {
        ensure(payload, APP_MESSAGE_HEADER_SIZE, "app message header")?;
        let mut buf = payload;
        let raw_command = buf.get_u8();
        let command =
            AppCommand::from_u8(raw_command).ok_or(ProtocolError::UnknownCommand {
                endpoint: endpoint::APPLICATION_MESSAGE,
                command: raw_command,
            })?;
        let transaction_id = buf.get_u8();
        let uuid = Uuid::from_u128(buf.get_u128());
        Ok(AppMessageHeader {
            command,
            transaction_id,
            uuid,
            body: buf,
        })
    }

    /// Decodes a full message.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let header = Self::decode_header(payload)?;
        let dict = if header.command.carries_dict() {
            let mut body = header.body;
            Dict::decode(&mut body)?
        } else {
            Dict::new()
        };
        Ok(Self {
            command: header.command,
            transaction_id: header.transaction_id,
            uuid: header.uuid,
            dict,
        })
    }
}

/// The per-connection transaction id counter.
///
/// A single counter is shared by every conversation on the connection:
/// outgoing messages use the id after the last one seen, and every inbound
/// application message overwrites the last seen id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionCounter {
    last: u8,
}

impl TransactionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances and returns the id for an outgoing message.
    pub fn next_id(&mut self) -> u8 {
        self.last = self.last.wrapping_add(1);
        self.last
    }

    /// Records an id received from the device.
    pub fn observe(&mut self, id: u8) {
        self.last = id;
    }

    pub fn last(&self) -> u8 {
        self.last
    }
}
