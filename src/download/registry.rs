//! Thread-safe registry of transfer records.
//!
//! The registry is the single source of truth for lookups by id or tag. It
//! only guards the map itself; each record guards its own state block.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::debug;

use super::record::{TransferId, TransferRecord};
use super::request::DownloadRequest;

/// Map from transfer id to record.
#[derive(Debug)]
pub struct TransferRegistry {
    records: DashMap<TransferId, Arc<TransferRecord>>,
    next_id: AtomicU64,
}

impl Default for TransferRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferRegistry {
    /// Creates an empty registry. Ids start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Assigns the next id and inserts a PENDING record for `request`.
    pub fn register(&self, request: DownloadRequest) -> Arc<TransferRecord> {
        let id = TransferId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let record = Arc::new(TransferRecord::new(id, request));
        self.records.insert(id, Arc::clone(&record));
        debug!(transfer_id = %id, url = %record.url(), "registered transfer");
        record
    }

    /// Looks up a record by id.
    #[must_use]
    pub fn lookup(&self, id: TransferId) -> Option<Arc<TransferRecord>> {
        // Clone out of the shard so no DashMap guard outlives this call.
        self.records.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// All records carrying `tag`, ordered by id.
    #[must_use]
    pub fn lookup_by_tag(&self, tag: &str) -> Vec<Arc<TransferRecord>> {
        let mut matches: Vec<_> = self
            .records
            .iter()
            .filter(|entry| entry.value().tag() == Some(tag))
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        matches.sort_by_key(|record| record.id());
        matches
    }

    /// Every record, ordered by id.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<TransferRecord>> {
        let mut records: Vec<_> = self
            .records
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        records.sort_by_key(|record| record.id());
        records
    }

    /// Removes a terminal record. Non-terminal or unknown ids are left alone.
    pub fn remove(&self, id: TransferId) -> Option<Arc<TransferRecord>> {
        self.records
            .remove_if(&id, |_, record| record.status().is_terminal())
            .map(|(_, record)| record)
    }

    /// Number of registered records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
