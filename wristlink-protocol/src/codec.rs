//! Streaming encoder and decoder for frames.

use crate::error::ProtocolError;
use crate::frame::{Decoded, Frame, TransportMode};
use bytes::{Bytes, BytesMut};

/// Encodes frames for a transport mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct Encoder {
    mode: TransportMode,
}

impl Encoder {
    pub fn new(mode: TransportMode) -> Self {
        Self { mode }
    }

    /// Encodes an endpoint and payload into wire bytes.
    pub fn encode(&self, endpoint: u16, payload: &[u8]) -> Result<BytesMut, ProtocolError> {
        Frame::new(endpoint, Bytes::copy_from_slice(payload)).encode_for(self.mode)
    }

    /// Encodes a frame into wire bytes.
    pub fn encode_frame(&self, frame: &Frame) -> Result<BytesMut, ProtocolError> {
        frame.encode_for(self.mode)
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }
}

/// Accumulates transport reads and yields decoded frames.
pub struct Decoder {
    buffer: BytesMut,
    mode: TransportMode,
}

impl Decoder {
    pub fn new(mode: TransportMode) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            mode,
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next frame from the buffer.
    ///
    /// Short reads leave the partial frame buffered until the rest arrives.
    pub fn decode_frame(&mut self) -> Option<Decoded> {
        Frame::decode(&mut self.buffer, self.mode)
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(TransportMode::Serial)
    }
}
