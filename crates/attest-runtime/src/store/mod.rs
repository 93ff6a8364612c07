//! Append-only audit storage.
//!
//! One record per request, addressable by `request_id`, plus an index in
//! append order. Stores never overwrite or delete committed records; a
//! second record for the same request id is rejected.

mod file;
mod memory;

pub use file::FileAuditStore;
pub use memory::MemoryAuditStore;

use attest_core::{verify_chain, AuditRecord, ChainError, ChainLink, StoredAuditRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Longest accepted request id.
pub const MAX_REQUEST_ID_LEN: usize = 128;

/// Errors from audit storage.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Audit store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Audit record for request '{0}' already exists")]
    DuplicateRequestId(String),

    #[error("Invalid request id '{0}': use 1-128 characters from [A-Za-z0-9._-]")]
    InvalidRequestId(String),

    #[error("Audit chain is broken: {0}")]
    Chain(#[from] ChainError),

    #[error("Audit store is corrupt: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether retrying the same append may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Io(e) => !matches!(
                e.kind(),
                io::ErrorKind::AlreadyExists
                    | io::ErrorKind::PermissionDenied
                    | io::ErrorKind::InvalidInput
                    | io::ErrorKind::NotFound
            ),
            _ => false,
        }
    }
}

/// One line of the store index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub entry_digest: String,
}

impl IndexEntry {
    pub fn for_stored(stored: &StoredAuditRecord) -> Self {
        Self {
            sequence: stored.link.sequence,
            timestamp: stored.record.timestamp,
            request_id: stored.record.request_id.clone(),
            entry_digest: stored.link.entry_digest.clone(),
        }
    }
}

/// Write-once audit storage.
///
/// Implementations serialize appends so chain links are assigned in order.
pub trait AuditStore: Send + Sync {
    /// Chain and persist a record.
    fn append(&self, record: AuditRecord) -> Result<StoredAuditRecord, StoreError>;

    /// The stored record for a request, if any.
    fn get(&self, request_id: &str) -> Result<Option<StoredAuditRecord>, StoreError>;

    /// Index entries in append order.
    fn list(&self) -> Result<Vec<IndexEntry>, StoreError>;

    /// All stored records in append order.
    fn entries(&self) -> Result<Vec<StoredAuditRecord>, StoreError> {
        self.list()?
            .iter()
            .map(|entry| {
                self.get(&entry.request_id)?.ok_or_else(|| {
                    StoreError::Corrupt(format!(
                        "index lists '{}' but its record is missing",
                        entry.request_id
                    ))
                })
            })
            .collect()
    }

    /// Verify the whole chain, returning the number of records.
    fn verify(&self) -> Result<usize, StoreError> {
        let entries = self.entries()?;
        verify_chain(&entries)?;
        Ok(entries.len())
    }
}

/// Reject ids that are empty, too long, or could escape the store directory.
pub fn validate_request_id(request_id: &str) -> Result<(), StoreError> {
    let valid = !request_id.is_empty()
        && request_id.len() <= MAX_REQUEST_ID_LEN
        && request_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        && request_id != "."
        && request_id != "..";
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidRequestId(request_id.to_string()))
    }
}

/// Link `record` after `tail`.
pub(crate) fn chain_after(
    tail: Option<&ChainLink>,
    record: AuditRecord,
) -> Result<StoredAuditRecord, StoreError> {
    validate_request_id(&record.request_id)?;
    let link = ChainLink::next(tail, &record)?;
    Ok(StoredAuditRecord { link, record })
}
