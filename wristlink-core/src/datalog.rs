//! Datalog session registry.
//!
//! The device opens one session per tag, streams fixed-size items into it
//! and closes it. Each batch is answered with ACK or NACK; a NACK makes the
//! device resend the same batch later, so a batch is only acknowledged once
//! it has been fully decoded and persisted.

use crate::error::CoreError;
use crate::events::DeviceEvent;
use crate::records::{
    decode_heart_rate, decode_overlay, decode_sleep, decode_steps, HealthRecord, TAG_ANALYTICS,
    TAG_HEART_RATE, TAG_OVERLAY, TAG_SLEEP, TAG_STEPS,
};
use crate::store::SampleStore;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wristlink_protocol::datalog::{self, DatalogMessage};
use wristlink_protocol::Frame;

/// Verdict for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatalogResponse {
    Acknowledge,
    Reject,
}

impl DatalogResponse {
    pub fn is_ack(self) -> bool {
        self == DatalogResponse::Acknowledge
    }
}

/// What a session does with its items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Acknowledged without being kept.
    Analytics,
    Steps,
    Sleep,
    Overlay,
    HeartRate,
    /// Raw items forwarded upward.
    Generic,
}

impl SessionKind {
    /// Health tags are only recognized for the system (nil) UUID.
    pub fn for_session(uuid: Uuid, tag: i32) -> Self {
        if !uuid.is_nil() {
            return SessionKind::Generic;
        }
        match tag {
            TAG_ANALYTICS => SessionKind::Analytics,
            TAG_STEPS => SessionKind::Steps,
            TAG_SLEEP => SessionKind::Sleep,
            TAG_OVERLAY => SessionKind::Overlay,
            TAG_HEART_RATE => SessionKind::HeartRate,
            _ => SessionKind::Generic,
        }
    }

    fn decoder(self) -> Option<fn(&[u8]) -> Result<Vec<HealthRecord>, CoreError>> {
        match self {
            SessionKind::Steps => Some(decode_steps),
            SessionKind::Sleep => Some(decode_sleep),
            SessionKind::Overlay => Some(decode_overlay),
            SessionKind::HeartRate => Some(decode_heart_rate),
            SessionKind::Analytics | SessionKind::Generic => None,
        }
    }
}

/// One open session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatalogSession {
    pub id: u8,
    pub tag: i32,
    pub uuid: Uuid,
    pub item_type: u8,
    pub item_size: u16,
    pub timestamp: u32,
    pub kind: SessionKind,
}

impl DatalogSession {
    pub fn new(id: u8, uuid: Uuid, tag: i32, item_type: u8, item_size: u16, timestamp: u32) -> Self {
        Self {
            id,
            tag,
            uuid,
            item_type,
            item_size,
            timestamp,
            kind: SessionKind::for_session(uuid, tag),
        }
    }

    /// Decodes and persists a batch.
    pub fn handle(
        &self,
        data: &[u8],
        store: &dyn SampleStore,
    ) -> (DatalogResponse, Option<DeviceEvent>) {
        match self.process(data, store) {
            Ok(event) => (DatalogResponse::Acknowledge, event),
            Err(e) => {
                warn!(
                    "Rejecting datalog batch for session {} (tag {}): {}",
                    self.id, self.tag, e
                );
                (DatalogResponse::Reject, None)
            }
        }
    }

    fn process(
        &self,
        data: &[u8],
        store: &dyn SampleStore,
    ) -> Result<Option<DeviceEvent>, CoreError> {
        let item_size = self.item_size as usize;
        if item_size == 0 || data.len() % item_size != 0 {
            return Err(CoreError::MalformedBatch {
                len: data.len(),
                item_size: self.item_size,
            });
        }

        let decode = match self.kind {
            SessionKind::Analytics => return Ok(None),
            SessionKind::Generic => {
                return Ok(Some(DeviceEvent::DatalogData {
                    uuid: self.uuid,
                    tag: self.tag,
                    item_size: self.item_size,
                    data: data.to_vec(),
                }))
            }
            kind => match kind.decoder() {
                Some(decode) => decode,
                None => return Ok(None),
            },
        };

        let mut records = Vec::new();
        for item in data.chunks_exact(item_size) {
            records.extend(decode(item)?);
        }
        store.store(self.tag, &records)?;
        debug!(
            "Stored {} records from datalog session {} (tag {})",
            records.len(),
            self.id,
            self.tag
        );

        if records.is_empty() {
            Ok(None)
        } else {
            Ok(Some(DeviceEvent::DatalogRecords {
                tag: self.tag,
                records,
            }))
        }
    }
}

/// Reply frame and events produced by one datalog message.
#[derive(Debug, Default)]
pub struct DatalogOutcome {
    pub reply: Option<Frame>,
    pub events: Vec<DeviceEvent>,
}

/// Open sessions keyed by their wire id.
pub struct DatalogRegistry {
    sessions: HashMap<u8, DatalogSession>,
    store: Arc<dyn SampleStore>,
}

impl DatalogRegistry {
    pub fn new(store: Arc<dyn SampleStore>) -> Self {
        Self {
            sessions: HashMap::new(),
            store,
        }
    }

    /// Registers a session. Returns false if the id was already open, in
    /// which case the existing session is kept.
    pub fn open_session(
        &mut self,
        id: u8,
        uuid: Uuid,
        tag: i32,
        item_type: u8,
        item_size: u16,
        timestamp: u32,
    ) -> bool {
        if self.sessions.contains_key(&id) {
            return false;
        }
        info!(
            "Datalog session {} opened: uuid {}, tag {}, item size {}",
            id, uuid, tag, item_size
        );
        self.sessions.insert(
            id,
            DatalogSession::new(id, uuid, tag, item_type, item_size, timestamp),
        );
        true
    }

    /// Handles a batch. `None` when the session is unknown.
    pub fn handle(&self, id: u8, data: &[u8]) -> Option<(DatalogResponse, Option<DeviceEvent>)> {
        let session = self.sessions.get(&id)?;
        Some(session.handle(data, self.store.as_ref()))
    }

    pub fn close_session(&mut self, id: u8) -> bool {
        self.sessions.remove(&id).is_some()
    }

    pub fn session(&self, id: u8) -> Option<&DatalogSession> {
        self.sessions.get(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Applies a datalog message and builds the ACK/NACK.
    pub fn handle_message(&mut self, message: DatalogMessage) -> DatalogOutcome {
        match message {
            DatalogMessage::Open {
                id,
                uuid,
                timestamp,
                tag,
                item_type,
                item_size,
            } => {
                self.open_session(id, uuid, tag, item_type, item_size, timestamp);
                DatalogOutcome {
                    reply: Some(datalog::reply(id, true)),
                    events: Vec::new(),
                }
            }
            DatalogMessage::SendData {
                id,
                items_left,
                data,
                ..
            } => {
                debug!(
                    "Datalog session {}: {} bytes, {} items left",
                    id,
                    data.len(),
                    items_left
                );
                match self.handle(id, &data) {
                    Some((response, event)) => DatalogOutcome {
                        reply: Some(datalog::reply(id, response.is_ack())),
                        events: event.into_iter().collect(),
                    },
                    None => {
                        warn!("Datalog data for unknown session {}", id);
                        DatalogOutcome {
                            reply: Some(datalog::reply(id, false)),
                            events: Vec::new(),
                        }
                    }
                }
            }
            DatalogMessage::Close { id } => {
                let known = self.close_session(id);
                if known {
                    info!("Datalog session {} closed", id);
                } else {
                    warn!("Close for unknown datalog session {}", id);
                }
                DatalogOutcome {
                    reply: Some(datalog::reply(id, known)),
                    events: Vec::new(),
                }
            }
            DatalogMessage::Timeout { id } => {
                info!("Datalog session {} timed out", id);
                DatalogOutcome::default()
            }
            DatalogMessage::Unknown { command, id } => {
                warn!("Unknown datalog command {:#04x} for session {}", command, id);
                DatalogOutcome {
                    reply: Some(datalog::reply(id, false)),
                    events: Vec::new(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::tests::steps_item;
    use crate::store::MemorySampleStore;
    use bytes::Bytes;
    use wristlink_protocol::datalog::{DATALOG_ACK, DATALOG_NACK};

    fn registry() -> (DatalogRegistry, Arc<MemorySampleStore>) {
        let store = Arc::new(MemorySampleStore::new());
        (DatalogRegistry::new(store.clone()), store)
    }

    fn open(id: u8, uuid: Uuid, tag: i32, item_size: u16) -> DatalogMessage {
        DatalogMessage::Open {
            id,
            uuid,
            timestamp: 0,
            tag,
            item_type: 2,
            item_size,
        }
    }

    fn send(id: u8, data: Vec<u8>) -> DatalogMessage {
        DatalogMessage::SendData {
            id,
            items_left: 0,
            crc: 0,
            data: Bytes::from(data),
        }
    }

    fn reply_code(outcome: &DatalogOutcome) -> u8 {
        outcome.reply.as_ref().map(|f| f.payload[0]).unwrap_or(0)
    }

    #[test]
    fn test_session_kinds() {
        assert_eq!(SessionKind::for_session(Uuid::nil(), 81), SessionKind::Steps);
        assert_eq!(SessionKind::for_session(Uuid::nil(), 78), SessionKind::Analytics);
        assert_eq!(SessionKind::for_session(Uuid::nil(), 85), SessionKind::HeartRate);
        assert_eq!(SessionKind::for_session(Uuid::nil(), 12), SessionKind::Generic);
        assert_eq!(
            SessionKind::for_session(Uuid::from_u128(1), 81),
            SessionKind::Generic
        );
    }

    #[test]
    fn test_open_is_acked_and_idempotent() {
        let (mut reg, _) = registry();
        let out = reg.handle_message(open(1, Uuid::nil(), 81, 24));
        assert_eq!(reply_code(&out), DATALOG_ACK);
        assert!(!reg.open_session(1, Uuid::nil(), 85, 7, 7, 0));
        assert_eq!(reg.session(1).map(|s| s.tag), Some(81));
    }

    #[test]
    fn test_data_for_unknown_session_is_nacked() {
        let (mut reg, _) = registry();
        let out = reg.handle_message(send(9, vec![0; 4]));
        assert_eq!(reply_code(&out), DATALOG_NACK);
    }

    #[test]
    fn test_steps_stored_and_acked() {
        let (mut reg, store) = registry();
        let item = steps_item(5, 1000, 2);
        reg.handle_message(open(1, Uuid::nil(), 81, item.len() as u16));

        let out = reg.handle_message(send(1, item));
        assert_eq!(reply_code(&out), DATALOG_ACK);
        assert_eq!(store.len(), 2);
        assert!(matches!(
            out.events.as_slice(),
            [DeviceEvent::DatalogRecords { tag: 81, .. }]
        ));
    }

    #[test]
    fn test_non_multiple_length_rejected() {
        let (mut reg, store) = registry();
        reg.handle_message(open(1, Uuid::nil(), 85, 7));
        let out = reg.handle_message(send(1, vec![1, 0, 0, 0, 0, 0, 72, 1]));
        assert_eq!(reply_code(&out), DATALOG_NACK);
        assert!(store.is_empty());
    }

    #[test]
    fn test_unknown_version_rejected() {
        let (mut reg, store) = registry();
        reg.handle_message(open(1, Uuid::nil(), 85, 7));
        let out = reg.handle_message(send(1, vec![9, 0, 0, 0, 0, 0, 72]));
        assert_eq!(reply_code(&out), DATALOG_NACK);
        assert!(store.is_empty());
    }

    #[test]
    fn test_reject_then_retry_is_idempotent() {
        let (mut reg, store) = registry();
        let item = steps_item(7, 500, 3);
        let size = item.len() as u16;
        reg.handle_message(open(2, Uuid::nil(), 81, size));

        let mut malformed = item.clone();
        malformed.pop();
        assert_eq!(reply_code(&reg.handle_message(send(2, malformed))), DATALOG_NACK);
        assert!(store.is_empty());

        assert_eq!(reply_code(&reg.handle_message(send(2, item.clone()))), DATALOG_ACK);
        let once = store.records(81);

        assert_eq!(reply_code(&reg.handle_message(send(2, item))), DATALOG_ACK);
        assert_eq!(store.records(81), once);
        assert_eq!(once.len(), 3);
    }

    #[test]
    fn test_store_failure_rejects() {
        let (mut reg, store) = registry();
        reg.handle_message(open(1, Uuid::nil(), 85, 7));
        store.set_offline(true);
        let out = reg.handle_message(send(1, vec![1, 0, 0, 0, 0, 0, 72]));
        assert_eq!(reply_code(&out), DATALOG_NACK);

        store.set_offline(false);
        let out = reg.handle_message(send(1, vec![1, 0, 0, 0, 0, 0, 72]));
        assert_eq!(reply_code(&out), DATALOG_ACK);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_generic_session_forwards_data() {
        let (mut reg, store) = registry();
        let uuid = Uuid::from_u128(5);
        reg.handle_message(open(3, uuid, 1, 2));
        let out = reg.handle_message(send(3, vec![1, 2, 3, 4]));
        assert_eq!(reply_code(&out), DATALOG_ACK);
        assert!(store.is_empty());
        assert_eq!(
            out.events,
            vec![DeviceEvent::DatalogData {
                uuid,
                tag: 1,
                item_size: 2,
                data: vec![1, 2, 3, 4]
            }]
        );
    }

    #[test]
    fn test_analytics_acked_without_storing() {
        let (mut reg, store) = registry();
        reg.handle_message(open(4, Uuid::nil(), 78, 4));
        let out = reg.handle_message(send(4, vec![0; 8]));
        assert_eq!(reply_code(&out), DATALOG_ACK);
        assert!(out.events.is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn test_close_and_timeout() {
        let (mut reg, _) = registry();
        reg.handle_message(open(1, Uuid::nil(), 85, 7));
        assert!(reg.handle_message(DatalogMessage::Timeout { id: 1 }).reply.is_none());
        assert_eq!(reg.len(), 1);

        let out = reg.handle_message(DatalogMessage::Close { id: 1 });
        assert_eq!(reply_code(&out), DATALOG_ACK);
        assert!(reg.is_empty());

        let out = reg.handle_message(DatalogMessage::Close { id: 1 });
        assert_eq!(reply_code(&out), DATALOG_NACK);
    }

    #[test]
    fn test_unknown_command_nacked() {
        let (mut reg, _) = registry();
        let out = reg.handle_message(DatalogMessage::Unknown { command: 0x42, id: 6 });
        assert_eq!(out.reply.map(|f| f.payload.to_vec()), Some(vec![DATALOG_NACK, 6]));
    }
}
