//! # wristlink-core
//!
//! Transfer engine for wristlink.
//!
//! This crate provides:
//! - The chunked upload installation state machine
//! - Datalog session registry and health record decoders
//! - Sample persistence boundary
//! - Endpoint dispatch with per-app message handlers
//! - The headphone family session

pub mod datalog;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod headphones;
pub mod install;
pub mod records;
pub mod store;

pub use datalog::{DatalogRegistry, DatalogResponse, DatalogSession, SessionKind};
pub use dispatcher::{
    AppMessageHandler, Dispatch, Dispatcher, DispatcherConfig, FnHandler, HandlerResponse,
    Origin, Outgoing,
};
pub use error::CoreError;
pub use events::{AppManagementKind, ConnectionState, DeviceEvent, Outcome};
pub use headphones::{HeadphoneOutput, HeadphoneSession};
pub use install::{
    FsInstallSource, InstallKind, InstallPhase, InstallRequest, InstallSource, Installable,
    Installer, MemoryInstallSource,
};
pub use records::HealthRecord;
pub use store::{MemorySampleStore, SampleStore};
