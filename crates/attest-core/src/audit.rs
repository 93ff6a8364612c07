//! Audit Trail Generator
//!
//! Builds the tamper-evident record of one verification run:
//!
//! - `input_digest`: SHA-256 over a canonical serialization of the narrative
//!   and the fact set (facts sorted by their JSON encoding)
//! - `issues_digest`: SHA-256 over the final issue list, in reporting order
//! - `signature`: optional HMAC-SHA256 over
//!   `input_digest || issues_digest || timestamp`
//!
//! Records are chained when persisted: each [`ChainLink`] commits to the
//! previous link's digest, so an edited, dropped or reordered record breaks
//! [`verify_chain`].

use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::fact::Fact;
use crate::types::{Issue, IssueCounts};

type HmacSha256 = Hmac<Sha256>;

/// Current layout of [`AuditRecord`]. Only additive changes are made.
pub const AUDIT_SCHEMA_VERSION: u32 = 1;

/// `prev_digest` of the first link in a chain.
pub const GENESIS_DIGEST: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Errors from building or verifying audit records.
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid signing key: {0}")]
    InvalidKey(String),

    #[error("Record {0} is unsigned; its integrity cannot be verified")]
    Unsigned(String),

    #[error("Record {0} is marked as signed but carries no signature")]
    MissingSignature(String),

    #[error("Signature of record {0} is not valid hex")]
    InvalidHex(String),

    #[error("Signature verification failed for record {0}")]
    InvalidSignature(String),
}

/// Errors from verifying an audit chain.
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Sequence gap: expected {expected}, found {found}")]
    SequenceGap { expected: u64, found: u64 },

    #[error("Link {sequence} does not point at the previous entry")]
    PrevDigestMismatch { sequence: u64 },

    #[error("Link {sequence} does not match its record")]
    EntryDigestMismatch { sequence: u64 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// How the record's integrity can be checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Integrity {
    HmacSha256,

    /// No key was supplied; digests are present but nothing vouches for them
    Unsigned,
}

/// Parameters needed to re-run a verification deterministically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReproducibilityNote {
    pub engine_version: String,
    pub policy_version: String,

    /// SHA-256 of the canonical policy
    pub policy_digest: String,

    /// The "now" the run was evaluated at
    pub now: DateTime<Utc>,

    #[serde(default)]
    pub roles: Vec<String>,

    pub stability_hint: f64,
}

/// One record per verification run. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub schema_version: u32,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub input_digest: String,
    pub issues_digest: String,
    pub integrity: Integrity,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,

    pub reproducibility: ReproducibilityNote,
    pub ok: bool,
    pub counts: IssueCounts,
}

impl AuditRecord {
    /// SHA-256 of the record's JSON form, used by the hash chain.
    pub fn digest(&self) -> Result<String, serde_json::Error> {
        Ok(sha256_hex(&serde_json::to_vec(self)?))
    }

    pub fn is_signed(&self) -> bool {
        self.integrity == Integrity::HmacSha256
    }

    fn signing_payload(&self) -> Vec<u8> {
        signing_payload(&self.input_digest, &self.issues_digest, &self.timestamp)
    }
}

/// Build the audit record for one run.
///
/// An empty or absent key yields an unsigned record, marked as such.
/// `timestamp` is the run's "now", so identical inputs give identical
/// digests and signatures.
pub fn build_audit(
    request_id: &str,
    narrative: &str,
    facts: &[Fact],
    issues: &[Issue],
    secret_key: Option<&[u8]>,
    reproducibility: ReproducibilityNote,
    timestamp: DateTime<Utc>,
) -> Result<AuditRecord, AuditError> {
    let input_digest = input_digest(narrative, facts)?;
    let issues_digest = issues_digest(issues)?;

    let (integrity, signature) = match secret_key.filter(|k| !k.is_empty()) {
        Some(key) => {
            let payload = signing_payload(&input_digest, &issues_digest, &timestamp);
            (Integrity::HmacSha256, Some(sign(key, &payload)?))
        }
        None => {
            tracing::debug!(request_id, "No signing key supplied, audit record is unsigned");
            (Integrity::Unsigned, None)
        }
    };

    Ok(AuditRecord {
        schema_version: AUDIT_SCHEMA_VERSION,
        request_id: request_id.to_string(),
        timestamp,
        input_digest,
        issues_digest,
        integrity,
        signature,
        reproducibility,
        ok: !issues.iter().any(Issue::is_error),
        counts: IssueCounts::tally(issues),
    })
}

/// Digest of the narrative and fact set. Fact order does not matter.
pub fn input_digest(narrative: &str, facts: &[Fact]) -> Result<String, serde_json::Error> {
    let mut encoded = facts
        .iter()
        .map(serde_json::to_string)
        .collect::<Result<Vec<_>, _>>()?;
    encoded.sort();

    let canonical = format!(
        "{{\"facts\":[{}],\"narrative\":{}}}",
        encoded.join(","),
        serde_json::to_string(narrative)?
    );
    Ok(sha256_hex(canonical.as_bytes()))
}

/// Digest of the issue list in reporting order.
pub fn issues_digest(issues: &[Issue]) -> Result<String, serde_json::Error> {
    Ok(sha256_hex(&serde_json::to_vec(issues)?))
}

/// Check a record's HMAC in constant time.
pub fn verify_signature(record: &AuditRecord, key: &[u8]) -> Result<(), AuditError> {
    if !record.is_signed() {
        return Err(AuditError::Unsigned(record.request_id.clone()));
    }
    let signature = record
        .signature
        .as_deref()
        .ok_or_else(|| AuditError::MissingSignature(record.request_id.clone()))?;
    let signature =
        hex::decode(signature).map_err(|_| AuditError::InvalidHex(record.request_id.clone()))?;

    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| AuditError::InvalidKey(e.to_string()))?;
    mac.update(&record.signing_payload());
    mac.verify_slice(&signature)
        .map_err(|_| AuditError::InvalidSignature(record.request_id.clone()))
}

fn sign(key: &[u8], payload: &[u8]) -> Result<String, AuditError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| AuditError::InvalidKey(e.to_string()))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn signing_payload(input_digest: &str, issues_digest: &str, timestamp: &DateTime<Utc>) -> Vec<u8> {
    let timestamp = timestamp.to_rfc3339_opts(SecondsFormat::Millis, true);
    let mut payload =
        Vec::with_capacity(input_digest.len() + issues_digest.len() + timestamp.len());
    payload.extend_from_slice(input_digest.as_bytes());
    payload.extend_from_slice(issues_digest.as_bytes());
    payload.extend_from_slice(timestamp.as_bytes());
    payload
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Position of a record in the append-only chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLink {
    pub sequence: u64,
    pub prev_digest: String,

    /// `SHA-256(prev_digest || record_digest)`
    pub entry_digest: String,
}

impl ChainLink {
    /// The link for `record`, following `previous` (or genesis).
    pub fn next(
        previous: Option<&ChainLink>,
        record: &AuditRecord,
    ) -> Result<Self, serde_json::Error> {
        let sequence = previous.map_or(0, |p| p.sequence + 1);
        let prev_digest = previous.map_or_else(|| GENESIS_DIGEST.to_string(), |p| p.entry_digest.clone());
        let entry_digest = entry_digest(&prev_digest, &record.digest()?);
        Ok(Self {
            sequence,
            prev_digest,
            entry_digest,
        })
    }
}

fn entry_digest(prev_digest: &str, record_digest: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_digest.as_bytes());
    hasher.update(record_digest.as_bytes());
    hex::encode(hasher.finalize())
}

/// A record as persisted by an audit store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredAuditRecord {
    pub link: ChainLink,
    pub record: AuditRecord,
}

/// Verify a chain read back in sequence order.
pub fn verify_chain(entries: &[StoredAuditRecord]) -> Result<(), ChainError> {
    let mut prev_digest = GENESIS_DIGEST.to_string();

    for (expected, entry) in (0u64..).zip(entries) {
        let link = &entry.link;
        if link.sequence != expected {
            return Err(ChainError::SequenceGap {
                expected,
                found: link.sequence,
            });
        }
        if link.prev_digest != prev_digest {
            return Err(ChainError::PrevDigestMismatch {
                sequence: link.sequence,
            });
        }
        if link.entry_digest != entry_digest(&prev_digest, &entry.record.digest()?) {
            return Err(ChainError::EntryDigestMismatch {
                sequence: link.sequence,
            });
        }
        prev_digest = link.entry_digest.clone();
    }

    Ok(())
}
