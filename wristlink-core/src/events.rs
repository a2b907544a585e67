//! Events emitted upward to the host application.

use crate::records::HealthRecord;
use serde::Serialize;
use uuid::Uuid;
use wristlink_protocol::control::AppLogEntry;
use wristlink_protocol::headphones::BatteryLevel;
use wristlink_protocol::VersionInfo;

/// Connection lifecycle as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    /// Transport open, protocol not yet negotiated.
    Connected,
    /// Firmware version received.
    Initialized,
    WaitingReconnect,
    NotConnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AppManagementKind {
    Install,
    Delete,
    Start,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn from_success(success: bool) -> Self {
        if success {
            Outcome::Success
        } else {
            Outcome::Failure
        }
    }
}

/// Something the device did or reported.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeviceEvent {
    Connection {
        state: ConnectionState,
    },
    VersionInfo(VersionInfo),
    BatteryInfo {
        levels: Vec<BatteryLevel>,
    },
    AppManagement {
        kind: AppManagementKind,
        outcome: Outcome,
        uuid: Option<Uuid>,
    },
    /// The watch wants an app's binaries; install it again with this id.
    AppFetchRequest {
        uuid: Uuid,
        app_id: u32,
    },
    AppStarted {
        uuid: Uuid,
    },
    AppStopped {
        uuid: Uuid,
    },
    InstallProgress {
        item: usize,
        bytes_written: u32,
        total: u32,
    },
    InstallFinished {
        outcome: Outcome,
        reason: Option<String>,
    },
    /// A push for an app with no registered handler.
    AppMessage {
        uuid: Uuid,
        transaction_id: u8,
        dict: serde_json::Value,
    },
    /// A key/value update produced by an app handler.
    AppUpdate {
        uuid: Uuid,
        key: String,
        value: serde_json::Value,
    },
    DatalogRecords {
        tag: i32,
        records: Vec<HealthRecord>,
    },
    /// Raw items from a session with no record decoder.
    DatalogData {
        uuid: Uuid,
        tag: i32,
        item_size: u16,
        data: Vec<u8>,
    },
    AppLog(AppLogEntry),
    Ping {
        cookie: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event = DeviceEvent::InstallFinished {
            outcome: Outcome::Failure,
            reason: Some("NO_FREE_SLOT".into()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "install_finished");
        assert_eq!(json["outcome"], "failure");
        assert_eq!(json["reason"], "NO_FREE_SLOT");

        let event = DeviceEvent::Connection {
            state: ConnectionState::WaitingReconnect,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["state"], "waiting_reconnect");
    }

    #[test]
    fn test_newtype_variant_flattens() {
        let event = DeviceEvent::VersionInfo(VersionInfo {
            firmware: "v3.12".into(),
            major: 3,
            hardware_revision: None,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "version_info");
        assert_eq!(json["firmware"], "v3.12");
    }

    #[test]
    fn test_outcome_from_success() {
        assert_eq!(Outcome::from_success(true), Outcome::Success);
        assert_eq!(Outcome::from_success(false), Outcome::Failure);
    }
}
