//! Local storage for records put through the DHT.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::common::{Id, Record, ValidationError, ValidatorRegistry};

const MAX_RECORDS: usize = 1000;

/// A bounded store of validated records, keyed by the hash of their key.
#[derive(Debug)]
pub struct RecordStore {
    records: LruCache<Id, Record>,
}

impl RecordStore {
    pub fn new() -> RecordStore {
        RecordStore {
            records: LruCache::new(NonZeroUsize::new(MAX_RECORDS).expect("valid non-zero")),
        }
    }

    pub fn get(&mut self, target: &Id) -> Option<&Record> {
        self.records.get(target)
    }

    /// Validate and store a record.
    ///
    /// A conflicting existing record is resolved through the namespace's
    /// selector; returns `Ok(false)` when the existing record wins.
    pub fn put(
        &mut self,
        validators: &ValidatorRegistry,
        record: Record,
    ) -> Result<bool, ValidationError> {
        validators.validate(&record.key, &record)?;

        let target = Id::hash(&record.key);

        if let Some(existing) = self.records.get(&target) {
            let candidates = [existing.clone(), record.clone()];

            if validators.select(&record.key, &candidates) == 0 {
                return Ok(false);
            }
        }

        self.records.put(target, record);

        Ok(true)
    }
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new()
    }
}
