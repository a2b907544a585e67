//! Decoders for the health datalog record formats.
//!
//! Every item starts with a little-endian `version:u16`; the rest of the
//! layout depends on the tag and that version. All fields are little-endian.

use crate::error::CoreError;
use bytes::Buf;
use serde::{Deserialize, Serialize};

pub const TAG_ANALYTICS: i32 = 78;
pub const TAG_STEPS: i32 = 81;
pub const TAG_SLEEP: i32 = 83;
pub const TAG_OVERLAY: i32 = 84;
pub const TAG_HEART_RATE: i32 = 85;

const STEPS_VERSIONS: [u16; 5] = [5, 6, 7, 12, 13];
const STEPS_HEADER_SIZE: usize = 2 + 4 + 1 + 1 + 1;

/// One decoded health sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum HealthRecord {
    Steps {
        timestamp: u32,
        steps: u8,
        orientation: u8,
        intensity: u16,
        light: u8,
        plugged_in: Option<bool>,
        active_kcal: Option<u16>,
        resting_kcal: Option<u16>,
    },
    Sleep {
        offset_utc: i32,
        start: u32,
        end: u32,
        deep_seconds: u32,
    },
    Overlay {
        offset_utc: i32,
        start: u32,
        duration: u32,
        kind: u16,
    },
    HeartRate {
        timestamp: u32,
        bpm: u8,
    },
}

impl HealthRecord {
    /// The time the sample refers to; with the tag it identifies the sample.
    pub fn timestamp(&self) -> u32 {
        match self {
            HealthRecord::Steps { timestamp, .. } | HealthRecord::HeartRate { timestamp, .. } => {
                *timestamp
            }
            HealthRecord::Sleep { start, .. } | HealthRecord::Overlay { start, .. } => *start,
        }
    }
}

fn version(tag: i32, item: &[u8]) -> Result<u16, CoreError> {
    if item.len() < 2 {
        return Err(CoreError::MalformedBatch {
            len: item.len(),
            item_size: 2,
        });
    }
    let version = u16::from_le_bytes([item[0], item[1]]);
    tracing::trace!("tag {} record version {}", tag, version);
    Ok(version)
}

fn short(item: &[u8], needed: usize) -> CoreError {
    CoreError::MalformedBatch {
        len: item.len(),
        item_size: needed as u16,
    }
}

/// Decodes one steps item into per-minute samples.
pub fn decode_steps(item: &[u8]) -> Result<Vec<HealthRecord>, CoreError> {
    let version = version(TAG_STEPS, item)?;
    if !STEPS_VERSIONS.contains(&version) {
        return Err(CoreError::UnsupportedRecordVersion {
            tag: TAG_STEPS,
            version,
        });
    }
    if item.len() < STEPS_HEADER_SIZE {
        return Err(short(item, STEPS_HEADER_SIZE));
    }

    let mut buf = &item[2..];
    let base_timestamp = buf.get_u32_le();
    let _unknown = buf.get_u8();
    let record_len = buf.get_u8() as usize;
    let record_count = buf.get_u8() as usize;

    let min_len = match version {
        v if v >= 12 => 10,
        v if v >= 7 => 6,
        _ => 5,
    };
    if record_len < min_len || buf.len() < record_len * record_count {
        return Err(short(item, STEPS_HEADER_SIZE + record_len * record_count));
    }

    let mut records = Vec::with_capacity(record_count);
    for minute in 0..record_count {
        let mut rec = &buf[..record_len];
        buf.advance(record_len);

        let steps = rec.get_u8();
        let orientation = rec.get_u8();
        let intensity = rec.get_u16_le();
        let light = rec.get_u8();
        let plugged_in = (version >= 7).then(|| rec.get_u8() & 1 == 1);
        let (active_kcal, resting_kcal) = if version >= 12 {
            (Some(rec.get_u16_le()), Some(rec.get_u16_le()))
        } else {
            (None, None)
        };

        records.push(HealthRecord::Steps {
            timestamp: base_timestamp + minute as u32 * 60,
            steps,
            orientation,
            intensity,
            light,
            plugged_in,
            active_kcal,
            resting_kcal,
        });
    }
    Ok(records)
}

pub fn decode_sleep(item: &[u8]) -> Result<Vec<HealthRecord>, CoreError> {
    let version = version(TAG_SLEEP, item)?;
    if version != 1 {
        return Err(CoreError::UnsupportedRecordVersion {
            tag: TAG_SLEEP,
            version,
        });
    }
    if item.len() < 18 {
        return Err(short(item, 18));
    }
    let mut buf = &item[2..];
    Ok(vec![HealthRecord::Sleep {
        offset_utc: buf.get_i32_le(),
        start: buf.get_u32_le(),
        end: buf.get_u32_le(),
        deep_seconds: buf.get_u32_le(),
    }])
}

pub fn decode_overlay(item: &[u8]) -> Result<Vec<HealthRecord>, CoreError> {
    let version = version(TAG_OVERLAY, item)?;
    if !(1..=3).contains(&version) {
        return Err(CoreError::UnsupportedRecordVersion {
            tag: TAG_OVERLAY,
            version,
        });
    }
    if item.len() < 16 {
        return Err(short(item, 16));
    }
    let mut buf = &item[2..];
    Ok(vec![HealthRecord::Overlay {
        offset_utc: buf.get_i32_le(),
        start: buf.get_u32_le(),
        duration: buf.get_u32_le(),
        kind: buf.get_u16_le(),
    }])
}

pub fn decode_heart_rate(item: &[u8]) -> Result<Vec<HealthRecord>, CoreError> {
    let version = version(TAG_HEART_RATE, item)?;
    if version != 1 {
        return Err(CoreError::UnsupportedRecordVersion {
            tag: TAG_HEART_RATE,
            version,
        });
    }
    if item.len() < 7 {
        return Err(short(item, 7));
    }
    let mut buf = &item[2..];
    Ok(vec![HealthRecord::HeartRate {
        timestamp: buf.get_u32_le(),
        bpm: buf.get_u8(),
    }])
}
