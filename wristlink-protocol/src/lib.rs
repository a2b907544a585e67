//! # wristlink-protocol
//!
//! Wire codecs for the wristlink watch protocol and the headphone packet format.
//!
//! This crate provides:
//! - Endpoint-multiplexed framing, with the emulator TCP wrapper
//! - Little-endian app message dictionaries and application messages
//! - The chunked upload (PutBytes) sub-protocol and its STM32 CRC32
//! - Control and datalog messages, and an inbound message parser
//! - The headphone family's escaped packet codec

pub mod appmessage;
pub mod codec;
pub mod control;
pub mod crc;
pub mod datalog;
pub mod dict;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod headphones;
pub mod message;
pub mod putbytes;

pub use appmessage::{AppCommand, AppMessage, AppMessageHeader, TransactionCounter};
pub use codec::{Decoder, Encoder};
pub use control::{AppMetadata, VersionInfo};
pub use crc::{stm32_crc32, Stm32Crc};
pub use datalog::DatalogMessage;
pub use dict::{Dict, DictEntry, DictValue};
pub use error::ProtocolError;
pub use frame::{Decoded, Frame, TransportMode, FRAME_HEADER_SIZE};
pub use message::DeviceMessage;
pub use putbytes::{BinaryType, ProtocolGeneration, PutBytesResponse, CHUNK_SIZE};

/// Maximum frame payload size.
pub const MAX_FRAME: usize = 8192;

/// TCP port the emulator listens on for the phone connection.
pub const DEFAULT_EMULATOR_PORT: u16 = 12344;
