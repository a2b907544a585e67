//! Control messages on the non-application endpoints.
//!
//! Every builder returns a [`Frame`] addressed to its endpoint; every parser
//! takes the frame payload.

use crate::appmessage::AppMessage;
use crate::dict::Dict;
use crate::endpoint;
use crate::error::{ensure, ProtocolError};
use crate::frame::Frame;
use crate::putbytes::ProtocolGeneration;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const TIME_GET: u8 = 0;
pub const TIME_SET_LOCAL: u8 = 2;
pub const TIME_SET_UTC: u8 = 3;

pub const SYSTEM_FIRMWARE_START: u8 = 1;
pub const SYSTEM_FIRMWARE_COMPLETE: u8 = 2;
pub const SYSTEM_FIRMWARE_FAIL: u8 = 3;

pub const APP_MANAGER_BANK_STATUS: u8 = 1;
pub const APP_MANAGER_REMOVE: u8 = 2;
pub const APP_MANAGER_REFRESH: u8 = 3;
pub const APP_MANAGER_UUIDS: u8 = 5;
pub const APP_MANAGER_RESULT_SUCCESS: u32 = 1;

pub const PING_PING: u8 = 0;
pub const PING_PONG: u8 = 1;

pub const PHONE_VERSION_REQUEST: u8 = 0;
pub const PHONE_VERSION_REPLY: u8 = 1;
pub const REMOTE_OS_ANDROID: u32 = 2;
const PHONE_VERSION_APP_MAGIC: u8 = 2;
const PHONE_VERSION_FLAGS: u64 = 0x29af;

pub const APP_FETCH_REQUEST: u8 = 1;

pub const APP_RUN_STATE_START: u8 = 1;
pub const APP_RUN_STATE_STOP: u8 = 2;

pub const BLOBDB_INSERT: u8 = 1;
pub const BLOBDB_DELETE: u8 = 4;
pub const BLOBDB_APP: u8 = 2;

/// Size of the app metadata blob stored in the App database.
pub const APP_METADATA_SIZE: usize = 126;
const APP_METADATA_NAME_SIZE: usize = 96;

/// Bytes of one installed-app record in a bank status reply.
const BANK_ENTRY_SIZE: usize = 78;

const HARDWARE_REVISIONS: [&str; 23] = [
    "silk_bb2",
    "robert_bb",
    "silk_bb",
    "spalding_bb2",
    "snowy_bb2",
    "snowy_bb",
    "bb2",
    "bb",
    "unknown",
    "ev1",
    "ev2",
    "ev2_3",
    "ev2_4",
    "v1_5",
    "v2_0",
    "snowy_evt2",
    "snowy_dvt",
    "spalding_dvt",
    "snowy_s3",
    "spalding",
    "silk_evt",
    "robert_evt",
    "silk",
];

fn simple(endpoint: u16, command: u8) -> Frame {
    Frame::new(endpoint, vec![command])
}

fn fixed_string(raw: &[u8]) -> String {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

// ----------------------------------------------------------------------------
// Time

/// Requests the watch's current time.
pub fn get_time() -> Frame {
    simple(endpoint::TIME, TIME_GET)
}

/// Sets local time (legacy generation).
pub fn set_time_local(local_seconds: u32) -> Frame {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(TIME_SET_LOCAL);
    buf.put_u32(local_seconds);
    Frame::new(endpoint::TIME, buf.freeze())
}

/// Sets UTC time with the zone offset and name (modern generation).
pub fn set_time_utc(utc_seconds: u32, offset_minutes: i16, timezone: &str) -> Frame {
    let tz = &timezone.as_bytes()[..timezone.len().min(u8::MAX as usize)];
    let mut buf = BytesMut::with_capacity(8 + tz.len());
    buf.put_u8(TIME_SET_UTC);
    buf.put_u32(utc_seconds);
    buf.put_i16(offset_minutes);
    buf.put_u8(tz.len() as u8);
    buf.put_slice(tz);
    Frame::new(endpoint::TIME, buf.freeze())
}

/// Builds the time frame appropriate for the protocol generation.
pub fn set_time(
    generation: ProtocolGeneration,
    utc_seconds: i64,
    offset_seconds: i32,
    timezone: &str,
) -> Frame {
    match generation {
        ProtocolGeneration::Modern => set_time_utc(
            utc_seconds as u32,
            (offset_seconds / 60) as i16,
            timezone,
        ),
        ProtocolGeneration::Legacy => set_time_local((utc_seconds + offset_seconds as i64) as u32),
    }
}

// ----------------------------------------------------------------------------
// System messages

pub fn system_message(code: u8) -> Frame {
    Frame::new(endpoint::SYSTEM_MESSAGE, vec![0, code])
}

pub fn firmware_start() -> Frame {
    system_message(SYSTEM_FIRMWARE_START)
}

pub fn firmware_complete() -> Frame {
    system_message(SYSTEM_FIRMWARE_COMPLETE)
}

/// Parses a system message payload into its code.
pub fn parse_system_message(payload: &[u8]) -> Result<u8, ProtocolError> {
    ensure(payload, 2, "system message")?;
    Ok(payload[1])
}

// ----------------------------------------------------------------------------
// Firmware and phone version

/// Firmware and hardware identification reported by the watch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Running firmware version string, e.g. `v3.12.3`.
    pub firmware: String,
    /// Firmware major version.
    pub major: u8,
    /// Board revision name, when known.
    pub hardware_revision: Option<String>,
}

impl VersionInfo {
    pub fn generation(&self) -> ProtocolGeneration {
        ProtocolGeneration::from_firmware_major(self.major)
    }
}

pub fn firmware_version_request() -> Frame {
    simple(endpoint::FIRMWARE_VERSION, 0)
}

/// Parses the firmware version response.
pub fn parse_firmware_version(payload: &[u8]) -> Result<VersionInfo, ProtocolError> {
    ensure(payload, 1 + 4 + 32 + 9 + 1, "firmware version")?;
    let firmware = fixed_string(&payload[5..37]);
    let major = firmware
        .as_bytes()
        .get(1)
        .map(|c| c.wrapping_sub(b'0'))
        .filter(|m| *m <= 9)
        .unwrap_or(0);

    let hw_index = payload[46] as i8 as i32 + 8;
    let hardware_revision = usize::try_from(hw_index)
        .ok()
        .and_then(|i| HARDWARE_REVISIONS.get(i))
        .map(|s| s.to_string());

    Ok(VersionInfo {
        firmware,
        major,
        hardware_revision,
    })
}

/// Builds the reply to the watch's phone version request.
pub fn phone_version_reply(os: u32) -> Frame {
    let mut buf = BytesMut::with_capacity(25);
    buf.put_u8(PHONE_VERSION_REPLY);
    buf.put_i32(-1);
    buf.put_u32(0);
    buf.put_u32(os);
    buf.put_u8(PHONE_VERSION_APP_MAGIC);
    buf.put_u8(4);
    buf.put_u8(1);
    buf.put_u8(1);
    buf.put_u64_le(PHONE_VERSION_FLAGS);
    Frame::new(endpoint::PHONE_VERSION, buf.freeze())
}

// ----------------------------------------------------------------------------
// Ping

pub fn ping(cookie: u32) -> Frame {
    ping_frame(PING_PING, cookie)
}

pub fn pong(cookie: u32) -> Frame {
    ping_frame(PING_PONG, cookie)
}

fn ping_frame(command: u8, cookie: u32) -> Frame {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(command);
    buf.put_u32(cookie);
    Frame::new(endpoint::PING, buf.freeze())
}

// ----------------------------------------------------------------------------
// App manager

pub fn app_bank_status_request() -> Frame {
    simple(endpoint::APP_MANAGER, APP_MANAGER_BANK_STATUS)
}

pub fn app_info_request() -> Frame {
    simple(endpoint::APP_MANAGER, APP_MANAGER_UUIDS)
}

/// Asks a legacy watch to load the app just written to `slot`.
pub fn app_refresh(slot: u32) -> Frame {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(APP_MANAGER_REFRESH);
    buf.put_u32(slot);
    Frame::new(endpoint::APP_MANAGER, buf.freeze())
}

/// Removes an app on a legacy watch.
pub fn app_delete_legacy(uuid: Uuid) -> Frame {
    let mut buf = BytesMut::with_capacity(17);
    buf.put_u8(APP_MANAGER_REMOVE);
    buf.put_slice(uuid.as_bytes());
    Frame::new(endpoint::APP_MANAGER, buf.freeze())
}

/// One occupied slot in a bank status reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledApp {
    pub id: u32,
    pub index: u32,
    pub name: String,
    pub creator: String,
    pub flags: u32,
    pub version: u16,
}

/// Replies on the app manager endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppManagerResponse {
    BankStatus {
        slot_count: u32,
        apps: Vec<InstalledApp>,
        /// First unoccupied slot, `None` when the bank is full.
        free_slot: Option<u32>,
    },
    Uuids(Vec<Uuid>),
    /// Result of a remove or refresh.
    Result { command: u8, success: bool },
}

pub fn parse_app_manager(payload: &[u8]) -> Result<AppManagerResponse, ProtocolError> {
    ensure(payload, 1, "app manager response")?;
    let mut buf = payload;
    let command = buf.get_u8();

    match command {
        APP_MANAGER_BANK_STATUS => {
            ensure(buf, 8, "bank status header")?;
            let slot_count = buf.get_u32();
            let used = buf.get_u32() as usize;
            ensure(buf, used.saturating_mul(BANK_ENTRY_SIZE), "bank status entries")?;

            let mut in_use = vec![false; slot_count.min(u8::MAX as u32 + 1) as usize];
            let mut apps = Vec::with_capacity(used);
            for _ in 0..used {
                let id = buf.get_u32();
                let index = buf.get_u32();
                let name = fixed_string(&buf[..32]);
                buf.advance(32);
                let creator = fixed_string(&buf[..32]);
                buf.advance(32);
                let flags = buf.get_u32();
                let version = buf.get_u16();
                if let Some(slot) = in_use.get_mut(index as usize) {
                    *slot = true;
                }
                apps.push(InstalledApp {
                    id,
                    index,
                    name,
                    creator,
                    flags,
                    version,
                });
            }

            let free_slot = in_use.iter().position(|used| !used).map(|i| i as u32);
            Ok(AppManagerResponse::BankStatus {
                slot_count,
                apps,
                free_slot,
            })
        }
        APP_MANAGER_UUIDS => {
            ensure(buf, 4, "uuid count")?;
            let count = buf.get_u32() as usize;
            ensure(buf, count.saturating_mul(16), "uuid list")?;
            let uuids = (0..count).map(|_| Uuid::from_u128(buf.get_u128())).collect();
            Ok(AppManagerResponse::Uuids(uuids))
        }
        APP_MANAGER_REMOVE | APP_MANAGER_REFRESH => {
            ensure(buf, 4, "app manager result")?;
            let result = buf.get_u32();
            Ok(AppManagerResponse::Result {
                command,
                success: result == APP_MANAGER_RESULT_SUCCESS,
            })
        }
        command => Err(ProtocolError::UnknownCommand {
            endpoint: endpoint::APP_MANAGER,
            command,
        }),
    }
}

// ----------------------------------------------------------------------------
// App fetch (modern generation)

pub fn app_fetch_ack() -> Frame {
    Frame::new(endpoint::APP_FETCH, vec![0x01, 0x01])
}

/// The watch asking for an app's binaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppFetchRequest {
    pub uuid: Uuid,
    pub app_id: u32,
}

pub fn parse_app_fetch(payload: &[u8]) -> Result<AppFetchRequest, ProtocolError> {
    ensure(payload, 1, "app fetch")?;
    let mut buf = payload;
    let command = buf.get_u8();
    if command != APP_FETCH_REQUEST {
        return Err(ProtocolError::UnknownCommand {
            endpoint: endpoint::APP_FETCH,
            command,
        });
    }
    ensure(buf, 20, "app fetch request")?;
    let uuid = Uuid::from_u128(buf.get_u128());
    let app_id = buf.get_u32_le();
    Ok(AppFetchRequest { uuid, app_id })
}

// ----------------------------------------------------------------------------
// App run state

/// Starts or stops an app. The legacy generation has no run state endpoint
/// and uses a launcher push instead.
pub fn app_start(
    generation: ProtocolGeneration,
    uuid: Uuid,
    start: bool,
    transaction_id: u8,
) -> Result<Frame, ProtocolError> {
    match generation {
        ProtocolGeneration::Modern => {
            let mut buf = BytesMut::with_capacity(17);
            buf.put_u8(if start {
                APP_RUN_STATE_START
            } else {
                APP_RUN_STATE_STOP
            });
            buf.put_slice(uuid.as_bytes());
            Ok(Frame::new(endpoint::APP_RUN_STATE, buf.freeze()))
        }
        ProtocolGeneration::Legacy => {
            let dict = Dict::new().with(1, start as i32);
            AppMessage::push(uuid, transaction_id, dict).to_frame_on(endpoint::LAUNCHER)
        }
    }
}

/// Parses `[1|2, uuid]` into (started, uuid).
pub fn parse_app_run_state(payload: &[u8]) -> Result<(bool, Uuid), ProtocolError> {
    ensure(payload, 17, "app run state")?;
    let mut buf = payload;
    let command = buf.get_u8();
    let uuid = Uuid::from_u128(buf.get_u128());
    match command {
        APP_RUN_STATE_START => Ok((true, uuid)),
        APP_RUN_STATE_STOP => Ok((false, uuid)),
        command => Err(ProtocolError::UnknownCommand {
            endpoint: endpoint::APP_RUN_STATE,
            command,
        }),
    }
}

// ----------------------------------------------------------------------------
// BlobDB

/// App metadata inserted into the App database ahead of an app fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMetadata {
    pub uuid: Uuid,
    pub name: String,
    pub flags: u32,
    pub icon_id: u32,
    pub app_version: u16,
    pub sdk_version: u16,
}

impl AppMetadata {
    /// Encodes the 126-byte metadata blob. Names longer than 96 bytes are cut.
    pub fn encode(&self) -> [u8; APP_METADATA_SIZE] {
        let mut blob = [0u8; APP_METADATA_SIZE];
        let mut buf = &mut blob[..];
        buf.put_slice(self.uuid.as_bytes());
        buf.put_u32_le(self.flags);
        buf.put_u32_le(self.icon_id);
        buf.put_u16_le(self.app_version);
        buf.put_u16_le(self.sdk_version);
        buf.put_u8(0);
        buf.put_u8(0);
        let name = self.name.as_bytes();
        let len = name.len().min(APP_METADATA_NAME_SIZE);
        buf.put_slice(&name[..len]);
        blob
    }
}

/// Builds a BlobDB insert.
pub fn blobdb_insert(token: u16, database: u8, key: &[u8], blob: &[u8]) -> Frame {
    blobdb(BLOBDB_INSERT, token, database, key, Some(blob))
}

/// Builds a BlobDB delete.
pub fn blobdb_delete(token: u16, database: u8, key: &[u8]) -> Frame {
    blobdb(BLOBDB_DELETE, token, database, key, None)
}

fn blobdb(command: u8, token: u16, database: u8, key: &[u8], blob: Option<&[u8]>) -> Frame {
    let key = &key[..key.len().min(u8::MAX as usize)];
    let mut buf = BytesMut::with_capacity(5 + key.len() + blob.map_or(0, |b| b.len() + 2));
    buf.put_u8(command);
    buf.put_u16_le(token);
    buf.put_u8(database);
    buf.put_u8(key.len() as u8);
    buf.put_slice(key);
    if let Some(blob) = blob {
        buf.put_u16_le(blob.len() as u16);
        buf.put_slice(blob);
    }
    Frame::new(endpoint::BLOBDB, buf.freeze())
}

/// Inserts app metadata keyed by the app UUID.
pub fn install_metadata(token: u16, metadata: &AppMetadata) -> Frame {
    blobdb_insert(
        token,
        BLOBDB_APP,
        metadata.uuid.as_bytes(),
        &metadata.encode(),
    )
}

/// Parses a BlobDB reply into (token, status).
pub fn parse_blobdb_response(payload: &[u8]) -> Result<(u16, u8), ProtocolError> {
    ensure(payload, 3, "blobdb response")?;
    let mut buf = payload;
    let token = buf.get_u16_le();
    let status = buf.get_u8();
    Ok((token, status))
}

// ----------------------------------------------------------------------------
// App logs

pub fn enable_app_logs(enable: bool) -> Frame {
    Frame::new(endpoint::APP_LOGS, vec![enable as u8])
}

/// A log line emitted by an app on the watch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppLogEntry {
    pub uuid: Uuid,
    pub timestamp: u32,
    pub level: u8,
    pub line: u16,
    pub file_name: String,
    pub message: String,
}

pub fn parse_app_log(payload: &[u8]) -> Result<AppLogEntry, ProtocolError> {
    ensure(payload, 16 + 4 + 1 + 1 + 2 + 16, "app log header")?;
    let mut buf = payload;
    let uuid = Uuid::from_u128(buf.get_u128());
    let timestamp = buf.get_u32();
    let level = buf.get_u8();
    let message_len = buf.get_u8() as usize;
    let line = buf.get_u16();
    let file_name = fixed_string(&buf[..16]);
    buf.advance(16);
    ensure(buf, message_len, "app log message")?;
    let message = fixed_string(&buf[..message_len]);
    Ok(AppLogEntry {
        uuid,
        timestamp,
        level,
        line,
        file_name,
        message,
    })
}
