//! Endpoint-multiplexed frame envelope.
//!
//! Frame layout (4 bytes header + payload, big-endian):
//!
//! ```text
//! +-------------+-------------+------------------+
//! | length      | endpoint    | payload          |
//! | 2 bytes     | 2 bytes     | length bytes     |
//! +-------------+-------------+------------------+
//! ```
//!
//! When talking to the emulator over TCP every frame is wrapped again:
//!
//! ```text
//! +--------+---------+-----------+---------+--------+
//! | 0xFEED | 0x0001  | frame_len | frame   | 0xBEEF |
//! | 2 bytes| 2 bytes | 2 bytes   |         | 2 bytes|
//! +--------+---------+-----------+---------+--------+
//! ```

use crate::error::ProtocolError;
use crate::MAX_FRAME;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Size of the frame header in bytes (2+2 = 4).
pub const FRAME_HEADER_SIZE: usize = 4;

/// Leading magic of the emulator wrapper.
pub const EMULATOR_HEAD_MAGIC: u16 = 0xFEED;

/// Trailing magic of the emulator wrapper.
pub const EMULATOR_TAIL_MAGIC: u16 = 0xBEEF;

/// Protocol word written after the leading magic.
pub const EMULATOR_PROTOCOL: u16 = 0x0001;

/// Bytes the emulator wrapper puts in front of each frame.
pub const EMULATOR_PREFIX_SIZE: usize = 6;

/// Bytes the emulator wrapper puts after each frame.
pub const EMULATOR_SUFFIX_SIZE: usize = 2;

/// How frames are carried on the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Frame bytes go directly on the wire (Bluetooth RFCOMM, serial).
    #[default]
    Serial,
    /// Frames are wrapped with the emulator magic (TCP pipe).
    Emulator,
}

impl TransportMode {
    fn prefix_len(self) -> usize {
        match self {
            TransportMode::Serial => 0,
            TransportMode::Emulator => EMULATOR_PREFIX_SIZE,
        }
    }

    fn suffix_len(self) -> usize {
        match self {
            TransportMode::Serial => 0,
            TransportMode::Emulator => EMULATOR_SUFFIX_SIZE,
        }
    }
}

/// A single endpoint-addressed unit of wire data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Endpoint (channel) id.
    pub endpoint: u16,
    /// Frame payload.
    pub payload: Bytes,
}

/// Result of a decode attempt on a buffer holding at least one header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete frame.
    Frame(Frame),
    /// The length field was out of range; `discarded` buffered bytes were dropped.
    Resync { discarded: usize },
}

impl Frame {
    /// Creates a new frame for the given endpoint.
    pub fn new(endpoint: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            endpoint,
            payload: payload.into(),
        }
    }

    /// Encodes the frame for a serial transport.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        self.encode_for(TransportMode::Serial)
    }

    /// Encodes the frame for the given transport mode.
    pub fn encode_for(&self, mode: TransportMode) -> Result<BytesMut, ProtocolError> {
        let len = self.payload.len();
        if len > MAX_FRAME {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: MAX_FRAME,
            });
        }

        let frame_len = FRAME_HEADER_SIZE + len;
        let mut buf = BytesMut::with_capacity(mode.prefix_len() + frame_len + mode.suffix_len());

        if mode == TransportMode::Emulator {
            buf.put_u16(EMULATOR_HEAD_MAGIC);
            buf.put_u16(EMULATOR_PROTOCOL);
            buf.put_u16(frame_len as u16);
        }

        buf.put_u16(len as u16);
        buf.put_u16(self.endpoint);
        buf.put_slice(&self.payload);

        if mode == TransportMode::Emulator {
            buf.put_u16(EMULATOR_TAIL_MAGIC);
        }

        Ok(buf)
    }

    /// Decodes a frame from bytes.
    ///
    /// Returns `None` if more data is needed. A length field that is negative
    /// as a signed 16-bit value or larger than [`MAX_FRAME`] drains the whole
    /// buffer and yields [`Decoded::Resync`]; the payload is never awaited.
    pub fn decode(buf: &mut BytesMut, mode: TransportMode) -> Option<Decoded> {
        let prefix = mode.prefix_len();
        if buf.len() < prefix + FRAME_HEADER_SIZE {
            return None;
        }

        let raw_len = u16::from_be_bytes([buf[prefix], buf[prefix + 1]]);
        if (raw_len as i16) < 0 || raw_len as usize > MAX_FRAME {
            let discarded = buf.len();
            buf.clear();
            return Some(Decoded::Resync { discarded });
        }

        let len = raw_len as usize;
        let total = prefix + FRAME_HEADER_SIZE + len + mode.suffix_len();
        if buf.len() < total {
            return None;
        }

        buf.advance(prefix);
        let _len = buf.get_u16();
        let endpoint = buf.get_u16();
        let payload = buf.split_to(len).freeze();
        buf.advance(mode.suffix_len());

        Some(Decoded::Frame(Frame { endpoint, payload }))
    }
}
