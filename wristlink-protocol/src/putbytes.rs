//! Chunked upload sub-protocol (PutBytes), carried on a single endpoint.
//!
//! ```text
//! Init     | 1 | size:u32 | type:u8 | slot:u8 | [file name, NUL]    (legacy, File)
//! Init     | 1 | size:u32 | type|0x80:u8 | app_id:u32                (modern)
//! Send     | 2 | token:u32 | len:u32 | bytes
//! Commit   | 3 | token:u32 | crc:u32
//! Abort    | 4 | token:u32
//! Complete | 5 | token:u32
//! ```

use crate::endpoint;
use crate::error::{ensure, ProtocolError};
use crate::frame::Frame;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

pub const PUTBYTES_INIT: u8 = 1;
pub const PUTBYTES_SEND: u8 = 2;
pub const PUTBYTES_COMMIT: u8 = 3;
pub const PUTBYTES_ABORT: u8 = 4;
pub const PUTBYTES_COMPLETE: u8 = 5;

/// Maximum bytes carried by one Send.
pub const CHUNK_SIZE: usize = 2000;

/// Flag set on the binary type of a modern, app-id addressed Init.
const APP_ID_ADDRESSED: u8 = 0x80;

/// Kind of binary being uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryType {
    Firmware,
    Recovery,
    SysResources,
    Resources,
    Binary,
    File,
    Worker,
}

impl BinaryType {
    pub fn as_u8(self) -> u8 {
        match self {
            BinaryType::Firmware => 1,
            BinaryType::Recovery => 2,
            BinaryType::SysResources => 3,
            BinaryType::Resources => 4,
            BinaryType::Binary => 5,
            BinaryType::File => 6,
            BinaryType::Worker => 7,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(BinaryType::Firmware),
            2 => Some(BinaryType::Recovery),
            3 => Some(BinaryType::SysResources),
            4 => Some(BinaryType::Resources),
            5 => Some(BinaryType::Binary),
            6 => Some(BinaryType::File),
            7 => Some(BinaryType::Worker),
            _ => None,
        }
    }
}

/// Protocol generation, derived from the watch's firmware major version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolGeneration {
    /// Firmware 1.x and 2.x: slot-addressed installs.
    #[default]
    Legacy,
    /// Firmware 3.x and later: blob-addressed installs.
    Modern,
}

impl ProtocolGeneration {
    pub fn from_firmware_major(major: u8) -> Self {
        if major >= 3 {
            ProtocolGeneration::Modern
        } else {
            ProtocolGeneration::Legacy
        }
    }

    pub fn is_modern(self) -> bool {
        self == ProtocolGeneration::Modern
    }
}

/// Builds an upload Init frame.
///
/// `target` is the slot on the legacy generation and the app id on the
/// modern one. File uploads always use the slot form.
pub fn init(
    generation: ProtocolGeneration,
    binary_type: BinaryType,
    size: u32,
    target: u32,
    file_name: Option<&str>,
) -> Frame {
    let app_id_addressed = generation.is_modern() && binary_type != BinaryType::File;
    let name = file_name.filter(|_| binary_type == BinaryType::File);

    let mut buf = BytesMut::with_capacity(10 + name.map_or(0, |n| n.len() + 1));
    buf.put_u8(PUTBYTES_INIT);
    buf.put_u32(size);
    if app_id_addressed {
        buf.put_u8(binary_type.as_u8() | APP_ID_ADDRESSED);
        buf.put_u32(target);
    } else {
        buf.put_u8(binary_type.as_u8());
        buf.put_u8(target as u8);
    }
    if let Some(name) = name {
        buf.put_slice(name.as_bytes());
        buf.put_u8(0);
    }

    Frame::new(endpoint::PUT_BYTES, buf.freeze())
}

/// Builds a Send frame carrying one chunk.
pub fn send(token: u32, chunk: &[u8]) -> Frame {
    let mut buf = BytesMut::with_capacity(9 + chunk.len());
    buf.put_u8(PUTBYTES_SEND);
    buf.put_u32(token);
    buf.put_u32(chunk.len() as u32);
    buf.put_slice(chunk);
    Frame::new(endpoint::PUT_BYTES, buf.freeze())
}

/// Builds a Commit frame.
pub fn commit(token: u32, crc: u32) -> Frame {
    let mut buf = BytesMut::with_capacity(9);
    buf.put_u8(PUTBYTES_COMMIT);
    buf.put_u32(token);
    buf.put_u32(crc);
    Frame::new(endpoint::PUT_BYTES, buf.freeze())
}

/// Builds a Complete frame.
pub fn complete(token: u32) -> Frame {
    token_only(PUTBYTES_COMPLETE, token)
}

/// Builds an Abort (upload cancel) frame.
pub fn abort(token: u32) -> Frame {
    token_only(PUTBYTES_ABORT, token)
}

fn token_only(command: u8, token: u32) -> Frame {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(command);
    buf.put_u32(token);
    Frame::new(endpoint::PUT_BYTES, buf.freeze())
}

/// Device reply on the upload endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutBytesResponse {
    /// The device accepted the last request and issued a token.
    Token(u32),
    /// The device rejected the last request.
    Failure { command: u8, token: Option<u32> },
}

/// Parses a reply frame payload.
pub fn parse_response(payload: &[u8]) -> Result<PutBytesResponse, ProtocolError> {
    ensure(payload, 1, "put bytes response")?;
    let mut buf = payload;
    let command = buf.get_u8();
    let token = if buf.remaining() >= 4 {
        Some(buf.get_u32())
    } else {
        None
    };

    match (command, token) {
        (PUTBYTES_INIT, Some(token)) => Ok(PutBytesResponse::Token(token)),
        (PUTBYTES_INIT, None) => Err(ProtocolError::Truncated {
            what: "put bytes token",
            needed: 5,
            available: payload.len(),
        }),
        (command, token) => Ok(PutBytesResponse::Failure { command, token }),
    }
}
