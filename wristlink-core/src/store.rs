//! Sample persistence boundary for decoded datalog records.

use crate::error::CoreError;
use crate::records::HealthRecord;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Persists decoded health records.
///
/// The device redelivers a batch after a NACK, so `store` may see the same
/// records more than once and must be idempotent per `(tag, timestamp)`.
pub trait SampleStore: Send + Sync {
    /// Stores a batch; either all records are stored or an error is returned.
    fn store(&self, tag: i32, records: &[HealthRecord]) -> Result<(), CoreError>;
}

/// In-memory store keyed by `(tag, timestamp)`.
#[derive(Debug, Default)]
pub struct MemorySampleStore {
    samples: RwLock<BTreeMap<(i32, u32), HealthRecord>>,
    offline: AtomicBool,
}

impl MemorySampleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent writes fail with a retryable error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.samples.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.read().is_empty()
    }

    /// All records for a tag in timestamp order.
    pub fn records(&self, tag: i32) -> Vec<HealthRecord> {
        self.samples
            .read()
            .range((tag, 0)..=(tag, u32::MAX))
            .map(|(_, r)| r.clone())
            .collect()
    }
}

impl SampleStore for MemorySampleStore {
    fn store(&self, tag: i32, records: &[HealthRecord]) -> Result<(), CoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(CoreError::StoreUnavailable {
                reason: "store is offline".to_string(),
            });
        }

        let mut samples = self.samples.write();
        for record in records {
            samples.insert((tag, record.timestamp()), record.clone());
        }
        Ok(())
    }
}
