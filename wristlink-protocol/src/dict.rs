//! Typed key/value dictionary carried by application messages.
//!
//! Unlike the frame envelope, the dictionary is little-endian:
//!
//! ```text
//! +-------+------------------------------------------------------+
//! | count | entry * count                                        |
//! | 1 byte| key:i32 LE | type:u8 | len:u16 LE | value: len bytes |
//! +-------+------------------------------------------------------+
//! ```

use crate::error::{ensure, ProtocolError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::json;

/// Raw byte array.
pub const TYPE_BYTE_ARRAY: u8 = 0;
/// NUL-terminated string; the length includes the NUL.
pub const TYPE_CSTRING: u8 = 1;
/// Unsigned little-endian integer.
pub const TYPE_UINT: u8 = 2;
/// Signed little-endian integer.
pub const TYPE_INT: u8 = 3;

/// Per-entry header size (key + type + length).
const ENTRY_HEADER_SIZE: usize = 7;

/// A typed dictionary value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DictValue {
    Bytes(Vec<u8>),
    String(String),
    Uint(u32),
    Int(i32),
}

impl DictValue {
    /// Wire type tag.
    pub fn type_tag(&self) -> u8 {
        match self {
            DictValue::Bytes(_) => TYPE_BYTE_ARRAY,
            DictValue::String(_) => TYPE_CSTRING,
            DictValue::Uint(_) => TYPE_UINT,
            DictValue::Int(_) => TYPE_INT,
        }
    }

    /// Encoded value length (without the entry header).
    pub fn encoded_len(&self) -> usize {
        match self {
            DictValue::Bytes(b) => b.len(),
            DictValue::String(s) => s.len() + 1,
            DictValue::Uint(_) | DictValue::Int(_) => 4,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DictValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view of either integer type.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DictValue::Uint(v) => Some(*v as i64),
            DictValue::Int(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            DictValue::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl From<&str> for DictValue {
    fn from(s: &str) -> Self {
        DictValue::String(s.to_string())
    }
}

impl From<String> for DictValue {
    fn from(s: String) -> Self {
        DictValue::String(s)
    }
}

impl From<u32> for DictValue {
    fn from(v: u32) -> Self {
        DictValue::Uint(v)
    }
}

impl From<i32> for DictValue {
    fn from(v: i32) -> Self {
        DictValue::Int(v)
    }
}

impl From<Vec<u8>> for DictValue {
    fn from(b: Vec<u8>) -> Self {
        DictValue::Bytes(b)
    }
}

/// One key/value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DictEntry {
    pub key: i32,
    pub value: DictValue,
}

/// Ordered dictionary. Duplicate keys are kept in wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dict {
    entries: Vec<DictEntry>,
}

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style append.
    pub fn with(mut self, key: i32, value: impl Into<DictValue>) -> Self {
        self.push(key, value);
        self
    }

    pub fn push(&mut self, key: i32, value: impl Into<DictValue>) {
        self.entries.push(DictEntry {
            key,
            value: value.into(),
        });
    }

    /// Returns the most recently appended value for `key`.
    pub fn get(&self, key: i32) -> Option<&DictValue> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.key == key)
            .map(|e| &e.value)
    }

    pub fn entries(&self) -> &[DictEntry] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &DictEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total encoded size including the count byte.
    pub fn encoded_len(&self) -> usize {
        1 + self
            .entries
            .iter()
            .map(|e| ENTRY_HEADER_SIZE + e.value.encoded_len())
            .sum::<usize>()
    }

    /// Appends the encoded dictionary to `buf`. Integers are always written
    /// as 4 bytes.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        if self.entries.len() > u8::MAX as usize {
            return Err(ProtocolError::DictTooLarge(self.entries.len()));
        }

        buf.reserve(self.encoded_len());
        buf.put_u8(self.entries.len() as u8);

        for entry in &self.entries {
            let len = entry.value.encoded_len();
            if len > u16::MAX as usize {
                return Err(ProtocolError::ValueTooLong {
                    key: entry.key,
                    len,
                });
            }

            buf.put_i32_le(entry.key);
            buf.put_u8(entry.value.type_tag());
            buf.put_u16_le(len as u16);

            match &entry.value {
                DictValue::Bytes(b) => buf.put_slice(b),
                DictValue::String(s) => {
                    buf.put_slice(s.as_bytes());
                    buf.put_u8(0);
                }
                DictValue::Uint(v) => buf.put_u32_le(*v),
                DictValue::Int(v) => buf.put_i32_le(*v),
            }
        }

        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decodes a dictionary, advancing `buf` past it.
    ///
    /// Entries with an unknown type tag or an unsupported integer width are
    /// skipped. A length field running past the end of the buffer aborts the
    /// whole dictionary.
    pub fn decode(buf: &mut &[u8]) -> Result<Dict, ProtocolError> {
        ensure(buf, 1, "dict count")?;
        let count = buf.get_u8();
        let mut dict = Dict::new();

        for _ in 0..count {
            ensure(buf, ENTRY_HEADER_SIZE, "dict entry header")?;
            let key = buf.get_i32_le();
            let tag = buf.get_u8();
            let len = buf.get_u16_le() as usize;
            ensure(buf, len, "dict entry value")?;

            let whole: &[u8] = *buf;
            let (raw, rest) = whole.split_at(len);
            *buf = rest;

            let value = match tag {
                TYPE_BYTE_ARRAY => DictValue::Bytes(raw.to_vec()),
                TYPE_CSTRING => {
                    // Only the terminator; embedded NULs belong to the value.
                    let text = raw.strip_suffix(&[0u8]).unwrap_or(raw);
                    DictValue::String(String::from_utf8_lossy(text).into_owned())
                }
                TYPE_UINT => match raw.len() {
                    1 => DictValue::Uint(raw[0] as u32),
                    2 => DictValue::Uint(u16::from_le_bytes([raw[0], raw[1]]) as u32),
                    4 => DictValue::Uint(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
                    width => {
                        tracing::warn!("Skipping uint dict entry {} with width {}", key, width);
                        continue;
                    }
                },
                TYPE_INT => match raw.len() {
                    1 => DictValue::Int(raw[0] as i8 as i32),
                    2 => DictValue::Int(i16::from_le_bytes([raw[0], raw[1]]) as i32),
                    4 => DictValue::Int(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
                    width => {
                        tracing::warn!("Skipping int dict entry {} with width {}", key, width);
                        continue;
                    }
                },
                unknown => {
                    tracing::warn!("Skipping dict entry {} with unknown type {}", key, unknown);
                    continue;
                }
            };

            dict.entries.push(DictEntry { key, value });
        }

        Ok(dict)
    }

    /// Renders the dictionary as a JSON array of `{key, type, length, value}`
    /// objects, the form external app bridges consume.
    pub fn to_json(&self) -> serde_json::Value {
        let items: Vec<serde_json::Value> = self
            .entries
            .iter()
            .map(|e| match &e.value {
                DictValue::Bytes(b) => json!({
                    "key": e.key, "type": "bytes", "length": b.len(), "value": b,
                }),
                DictValue::String(s) => json!({
                    "key": e.key, "type": "string", "length": s.len(), "value": s,
                }),
                DictValue::Uint(v) => json!({
                    "key": e.key, "type": "uint", "length": 4, "value": v,
                }),
                DictValue::Int(v) => json!({
                    "key": e.key, "type": "int", "length": 4, "value": v,
                }),
            })
            .collect();
        serde_json::Value::Array(items)
    }

    /// Parses the array form produced by [`Dict::to_json`]. `length` is
    /// ignored; a missing `type` is inferred from the JSON value.
    pub fn from_json(value: &serde_json::Value) -> Result<Dict, ProtocolError> {
        let items = value
            .as_array()
            .ok_or_else(|| ProtocolError::InvalidDictJson("expected an array".to_string()))?;

        let mut dict = Dict::new();
        for item in items {
            let key = item
                .get("key")
                .and_then(|k| k.as_i64())
                .and_then(|k| i32::try_from(k).ok())
                .ok_or_else(|| ProtocolError::InvalidDictJson(format!("bad key in {}", item)))?;
            let raw = item
                .get("value")
                .ok_or_else(|| ProtocolError::InvalidDictJson(format!("no value for key {}", key)))?;
            let kind = item.get("type").and_then(|t| t.as_str());

            let value = match (kind, raw) {
                (Some("string") | None, serde_json::Value::String(s)) => DictValue::String(s.clone()),
                (Some("uint"), v) => v
                    .as_u64()
                    .and_then(|n| u32::try_from(n).ok())
                    .map(DictValue::Uint)
                    .ok_or_else(|| ProtocolError::InvalidDictJson(format!("bad uint for key {}", key)))?,
                (Some("int") | None, v) if v.is_number() => v
                    .as_i64()
                    .and_then(|n| i32::try_from(n).ok())
                    .map(DictValue::Int)
                    .ok_or_else(|| ProtocolError::InvalidDictJson(format!("bad int for key {}", key)))?,
                (Some("bytes") | None, serde_json::Value::Array(_)) => {
                    DictValue::Bytes(serde_json::from_value(raw.clone())?)
                }
                (kind, _) => {
                    return Err(ProtocolError::InvalidDictJson(format!(
                        "unsupported type {:?} for key {}",
                        kind, key
                    )))
                }
            };
            dict.push(key, value);
        }
        Ok(dict)
    }

    /// Parses a JSON string via [`Dict::from_json`].
    pub fn from_json_str(s: &str) -> Result<Dict, ProtocolError> {
        let value: serde_json::Value = serde_json::from_str(s)?;
        Self::from_json(&value)
    }
}

impl FromIterator<(i32, DictValue)> for Dict {
    fn from_iter<T: IntoIterator<Item = (i32, DictValue)>>(iter: T) -> Self {
        let mut dict = Dict::new();
        for (key, value) in iter {
            dict.push(key, value);
        }
        dict
    }
}
