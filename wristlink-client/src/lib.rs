//! # wristlink-client
//!
//! Device connection supervisor for wristlink.
//!
//! This crate provides:
//! - Emulator TCP and serial device streams behind one connector trait
//! - The per-device read loop with serialized, install-aware writes
//! - Bounded reconnect with backoff
//! - YAML and environment configuration

pub mod config;
pub mod error;
pub mod stream;
pub mod supervisor;

pub use config::{Config, ConfigError, ReconnectPolicy, TransportKind};
pub use error::ClientError;
pub use stream::{Connector, DeviceConnector, DeviceStream, DeviceTarget};
pub use supervisor::{read_frame, Command, DeviceHandle, Supervisor};
