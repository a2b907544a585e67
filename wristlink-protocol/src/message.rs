//! Inbound message classification by endpoint.

use crate::control::{
    self, AppFetchRequest, AppLogEntry, AppManagerResponse, VersionInfo, PHONE_VERSION_REQUEST,
    PING_PING,
};
use crate::datalog::DatalogMessage;
use crate::endpoint;
use crate::error::{ensure, ProtocolError};
use crate::frame::Frame;
use crate::putbytes::{self, PutBytesResponse};
use bytes::{Buf, Bytes};
use uuid::Uuid;

/// A frame from the device, parsed according to its endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceMessage {
    Version(VersionInfo),
    PhoneVersionRequest,
    Ping { cookie: u32 },
    /// Application message payload; decoded by the dispatcher so the header
    /// survives a bad dictionary.
    Application(Bytes),
    PutBytes(PutBytesResponse),
    AppManager(AppManagerResponse),
    AppFetch(AppFetchRequest),
    AppRunState { started: bool, uuid: Uuid },
    BlobDb { token: u16, status: u8 },
    Datalog(DatalogMessage),
    System { code: u8 },
    AppLog(AppLogEntry),
    /// An endpoint or command this client does not act on.
    Unhandled { endpoint: u16, command: Option<u8> },
}

impl DeviceMessage {
    /// Parses a frame into a message.
    pub fn parse(frame: &Frame) -> Result<Self, ProtocolError> {
        let payload = &frame.payload;
        match frame.endpoint {
            endpoint::FIRMWARE_VERSION => {
                control::parse_firmware_version(payload).map(DeviceMessage::Version)
            }
            endpoint::PHONE_VERSION => match payload.first() {
                Some(&PHONE_VERSION_REQUEST) => Ok(DeviceMessage::PhoneVersionRequest),
                command => Ok(DeviceMessage::Unhandled {
                    endpoint: frame.endpoint,
                    command: command.copied(),
                }),
            },
            endpoint::PING => {
                ensure(payload, 5, "ping")?;
                let mut buf = &payload[..];
                let command = buf.get_u8();
                let cookie = buf.get_u32();
                if command == PING_PING {
                    Ok(DeviceMessage::Ping { cookie })
                } else {
                    Ok(DeviceMessage::Unhandled {
                        endpoint: frame.endpoint,
                        command: Some(command),
                    })
                }
            }
            endpoint::APPLICATION_MESSAGE | endpoint::LAUNCHER => {
                Ok(DeviceMessage::Application(payload.clone()))
            }
            endpoint::PUT_BYTES => putbytes::parse_response(payload).map(DeviceMessage::PutBytes),
            endpoint::APP_MANAGER => {
                control::parse_app_manager(payload).map(DeviceMessage::AppManager)
            }
            endpoint::APP_FETCH => control::parse_app_fetch(payload).map(DeviceMessage::AppFetch),
            endpoint::APP_RUN_STATE => control::parse_app_run_state(payload)
                .map(|(started, uuid)| DeviceMessage::AppRunState { started, uuid }),
            endpoint::BLOBDB => control::parse_blobdb_response(payload)
                .map(|(token, status)| DeviceMessage::BlobDb { token, status }),
            endpoint::DATALOG => DatalogMessage::parse(payload).map(DeviceMessage::Datalog),
            endpoint::SYSTEM_MESSAGE => {
                control::parse_system_message(payload).map(|code| DeviceMessage::System { code })
            }
            endpoint::APP_LOGS => control::parse_app_log(payload).map(DeviceMessage::AppLog),
            other => Ok(DeviceMessage::Unhandled {
                endpoint: other,
                command: payload.first().copied(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ping() {
        let frame = Frame::new(endpoint::PING, vec![0, 0, 0, 1, 0]);
        assert_eq!(
            DeviceMessage::parse(&frame).unwrap(),
            DeviceMessage::Ping { cookie: 256 }
        );

        let pong = Frame::new(endpoint::PING, vec![1, 0, 0, 1, 0]);
        assert!(matches!(
            DeviceMessage::parse(&pong).unwrap(),
            DeviceMessage::Unhandled { command: Some(1), .. }
        ));
    }

    #[test]
    fn test_parse_phone_version_request() {
        let frame = Frame::new(endpoint::PHONE_VERSION, vec![0]);
        assert_eq!(
            DeviceMessage::parse(&frame).unwrap(),
            DeviceMessage::PhoneVersionRequest
        );
    }

    #[test]
    fn test_parse_put_bytes_token() {
        let frame = Frame::new(endpoint::PUT_BYTES, vec![1, 0, 0, 0, 9]);
        assert_eq!(
            DeviceMessage::parse(&frame).unwrap(),
            DeviceMessage::PutBytes(PutBytesResponse::Token(9))
        );
    }

    #[test]
    fn test_application_payload_passed_through() {
        let frame = Frame::new(endpoint::APPLICATION_MESSAGE, vec![1, 2, 3]);
        assert_eq!(
            DeviceMessage::parse(&frame).unwrap(),
            DeviceMessage::Application(Bytes::from_static(&[1, 2, 3]))
        );
    }

    #[test]
    fn test_unknown_endpoint_is_unhandled() {
        let frame = Frame::new(0x1234, vec![7]);
        assert_eq!(
            DeviceMessage::parse(&frame).unwrap(),
            DeviceMessage::Unhandled {
                endpoint: 0x1234,
                command: Some(7)
            }
        );
    }

    #[test]
    fn test_truncated_payload_is_error() {
        let frame = Frame::new(endpoint::APP_RUN_STATE, vec![1, 2]);
        assert!(DeviceMessage::parse(&frame).is_err());
    }
}
