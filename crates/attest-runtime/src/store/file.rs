//! File-backed audit store.
//!
//! Layout under the store directory:
//!
//! ```text
//! records/<request_id>.json   one immutable object per record (create-new)
//! index.jsonl                 one IndexEntry per line, append-only
//! orphans/                    record files found without an index entry
//! ```
//!
//! A record is committed once its index line is written. Record files left
//! behind by a crash before that point are moved to `orphans/` on open, so
//! the request id can be appended again.
//!
//! Every handle is opened, written and closed inside a single call, so it
//! is released on every exit path, errors included.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use attest_core::{AuditRecord, ChainLink, StoredAuditRecord};
use parking_lot::Mutex;

use super::{chain_after, validate_request_id, AuditStore, IndexEntry, StoreError};

const RECORDS_DIR: &str = "records";
const INDEX_FILE: &str = "index.jsonl";
const ORPHANS_DIR: &str = "orphans";

#[derive(Debug)]
pub struct FileAuditStore {
    root: PathBuf,

    /// Link of the last committed record; held for the whole append
    tail: Mutex<Option<ChainLink>>,
}

impl FileAuditStore {
    /// Open (or create) a store, resuming the chain from the index.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(RECORDS_DIR))?;

        let store = Self {
            root,
            tail: Mutex::new(None),
        };

        let index = store.list()?;
        store.quarantine_orphans(&index)?;

        let tail = match index.last() {
            Some(entry) => {
                let stored = store.get(&entry.request_id)?.ok_or_else(|| {
                    StoreError::Corrupt(format!(
                        "index tail '{}' has no record file",
                        entry.request_id
                    ))
                })?;
                if stored.link.entry_digest != entry.entry_digest {
                    return Err(StoreError::Corrupt(format!(
                        "record '{}' does not match its index entry",
                        entry.request_id
                    )));
                }
                Some(stored.link)
            }
            None => None,
        };
        *store.tail.lock() = tail;

        tracing::debug!(root = %store.root.display(), "Opened audit store");
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, request_id: &str) -> PathBuf {
        self.root
            .join(RECORDS_DIR)
            .join(format!("{}.json", request_id))
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    fn write_record(&self, path: &Path, stored: &StoredAuditRecord) -> Result<(), StoreError> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(StoreError::DuplicateRequestId(
                    stored.record.request_id.clone(),
                ))
            }
            Err(e) => return Err(e.into()),
        };

        let written = serde_json::to_writer_pretty(&mut file, stored)
            .map_err(StoreError::from)
            .and_then(|()| file.write_all(b"\n").map_err(StoreError::from))
            .and_then(|()| file.sync_all().map_err(StoreError::from));
        if written.is_err() {
            drop(file);
            remove_uncommitted(path);
        }
        written
    }

    /// Move record files that no index entry refers to out of `records/`.
    fn quarantine_orphans(&self, index: &[IndexEntry]) -> Result<(), StoreError> {
        let committed: HashSet<&str> = index.iter().map(|e| e.request_id.as_str()).collect();

        for entry in fs::read_dir(self.root.join(RECORDS_DIR))? {
            let path = entry?.path();
            let Some(request_id) = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_suffix(".json"))
            else {
                continue;
            };
            if committed.contains(request_id) {
                continue;
            }

            let orphans = self.root.join(ORPHANS_DIR);
            fs::create_dir_all(&orphans)?;
            let target = free_orphan_path(&orphans, request_id);
            fs::rename(&path, &target)?;
            tracing::warn!(
                request_id,
                moved_to = %target.display(),
                "Quarantined audit record without an index entry"
            );
        }
        Ok(())
    }

    fn append_index(&self, entry: &IndexEntry) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut index = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.index_path())?;
        index.write_all(line.as_bytes())?;
        index.sync_all()?;
        Ok(())
    }
}

impl AuditStore for FileAuditStore {
    fn append(&self, record: AuditRecord) -> Result<StoredAuditRecord, StoreError> {
        let mut tail = self.tail.lock();

        let stored = chain_after(tail.as_ref(), record)?;
        let path = self.record_path(&stored.record.request_id);
        self.write_record(&path, &stored)?;

        // An uncommitted record must not block a retry of the same append
        if let Err(e) = self.append_index(&IndexEntry::for_stored(&stored)) {
            remove_uncommitted(&path);
            return Err(e);
        }

        *tail = Some(stored.link.clone());
        tracing::info!(
            request_id = %stored.record.request_id,
            sequence = stored.link.sequence,
            signed = stored.record.is_signed(),
            "Appended audit record"
        );
        Ok(stored)
    }

    fn get(&self, request_id: &str) -> Result<Option<StoredAuditRecord>, StoreError> {
        validate_request_id(request_id)?;
        let file = match File::open(self.record_path(request_id)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_reader(BufReader::new(file))?))
    }

    fn list(&self) -> Result<Vec<IndexEntry>, StoreError> {
        let file = match File::open(self.index_path()) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: IndexEntry = serde_json::from_str(&line).map_err(|e| {
                StoreError::Corrupt(format!("index line {}: {}", number + 1, e))
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

fn remove_uncommitted(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        tracing::warn!(
            path = %path.display(),
            error = %e,
            "Failed to remove uncommitted audit record"
        );
    }
}

/// `orphans/<id>.json`, or `<id>.<n>.json` when earlier orphans share the id.
fn free_orphan_path(orphans: &Path, request_id: &str) -> PathBuf {
    let mut candidate = orphans.join(format!("{}.json", request_id));
    let mut n = 1u32;
    while candidate.exists() {
        candidate = orphans.join(format!("{}.{}.json", request_id, n));
        n += 1;
    }
    candidate
}
