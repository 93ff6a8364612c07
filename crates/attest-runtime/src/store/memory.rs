//! In-memory audit store, for tests and single-process embedding.

use attest_core::{AuditRecord, StoredAuditRecord};
use parking_lot::Mutex;

use super::{chain_after, AuditStore, IndexEntry, StoreError};

#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    entries: Mutex<Vec<StoredAuditRecord>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl AuditStore for MemoryAuditStore {
    fn append(&self, record: AuditRecord) -> Result<StoredAuditRecord, StoreError> {
        let mut entries = self.entries.lock();
        if entries
            .iter()
            .any(|e| e.record.request_id == record.request_id)
        {
            return Err(StoreError::DuplicateRequestId(record.request_id));
        }

        let stored = chain_after(entries.last().map(|e| &e.link), record)?;
        entries.push(stored.clone());
        Ok(stored)
    }

    fn get(&self, request_id: &str) -> Result<Option<StoredAuditRecord>, StoreError> {
        Ok(self
            .entries
            .lock()
            .iter()
            .find(|e| e.record.request_id == request_id)
            .cloned())
    }

    fn list(&self) -> Result<Vec<IndexEntry>, StoreError> {
        Ok(self.entries.lock().iter().map(IndexEntry::for_stored).collect())
    }

    fn entries(&self) -> Result<Vec<StoredAuditRecord>, StoreError> {
        Ok(self.entries.lock().clone())
    }
}
