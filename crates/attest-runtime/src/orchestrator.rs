//! Runtime orchestrator for concurrent layer execution.
//!
//! The orchestrator implements:
//! - Parallel fan-out of the four layers via tokio::join! over blocking tasks
//! - Deterministic fan-in through the core Synthesizer
//! - Audit record signing and the append to the audit store, retried with
//!   backoff on transient I/O errors
//!
//! The outcome is identical to `attest_core::verify_signed` for the same
//! inputs; only the scheduling differs.

use std::sync::Arc;

use attest_core::{
    finalize, run_layers, Check, CitationEnforcer, CrossSourceChecker, LayerOutcome,
    LayerOutcomes, Policy, PreparedRequest, PrivacyRedactor, SanityValidator, StoredAuditRecord,
    VerificationOutcome, VerificationRequest, VerifyError,
};
use backon::{ExponentialBuilder, Retryable};
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};

use crate::config::{ConfigError, RuntimeConfig};
use crate::secrets::SigningKey;
use crate::store::{AuditStore, FileAuditStore, StoreError};

/// Errors from the runtime orchestrator.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Verification failed: {0}")]
    Verify(#[from] VerifyError),

    #[error("Audit store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Layer task failed: {0}")]
    Join(#[from] JoinError),
}

/// Result of one runtime verification.
#[derive(Debug, Clone)]
pub struct RuntimeOutcome {
    pub outcome: VerificationOutcome,

    /// The stored record, when an audit store is attached
    pub stored: Option<StoredAuditRecord>,
}

/// Runs verifications and persists their audit records.
///
/// Holds no per-request state; one runtime serves concurrent requests.
pub struct VerificationRuntime {
    config: RuntimeConfig,
    store: Option<Arc<dyn AuditStore>>,
    signing_key: Option<SigningKey>,
}

impl VerificationRuntime {
    /// A runtime without store or key.
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            store: None,
            signing_key: None,
        }
    }

    /// Build from configuration: opens the file store at `audit_dir` and
    /// reads the signing key from `signing_key_env`.
    pub fn from_config(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        config.validate()?;
        let store: Option<Arc<dyn AuditStore>> = match &config.audit_dir {
            Some(dir) => Some(Arc::new(FileAuditStore::open(dir)?)),
            None => None,
        };
        let signing_key = SigningKey::from_env(&config.signing_key_env);

        Ok(Self {
            config,
            store,
            signing_key,
        })
    }

    pub fn with_store(mut self, store: Arc<dyn AuditStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_signing_key(mut self, key: SigningKey) -> Self {
        self.signing_key = Some(key);
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn store(&self) -> Option<&Arc<dyn AuditStore>> {
        self.store.as_ref()
    }

    /// Verify a request and append its audit record.
    ///
    /// # Execution Flow
    /// 1. Validate the request and ingest facts
    /// 2. Fan-out: run the four layers (concurrently unless disabled)
    /// 3. Fan-in: synthesize, sign, score (deterministic)
    /// 4. Append the audit record, retrying transient failures
    pub async fn verify(
        &self,
        request: VerificationRequest,
        policy: Arc<Policy>,
    ) -> Result<RuntimeOutcome, RuntimeError> {
        let prepared = Arc::new(PreparedRequest::new(request, &policy)?);

        let outcomes = if self.config.concurrent_layers {
            self.fan_out(&prepared, &policy).await?
        } else {
            run_layers(&prepared.input(&policy))
        };

        let key = self.signing_key.as_ref().map(SigningKey::expose);
        let outcome = finalize(&prepared, &policy, outcomes, key)?;

        let stored = match &self.store {
            Some(store) => Some(self.append_with_retry(store, &outcome).await?),
            None => None,
        };

        Ok(RuntimeOutcome { outcome, stored })
    }

    /// Run each layer on its own blocking task against the shared snapshot.
    async fn fan_out(
        &self,
        prepared: &Arc<PreparedRequest>,
        policy: &Arc<Policy>,
    ) -> Result<LayerOutcomes, RuntimeError> {
        let (citation, cross_source, privacy, sanity) = tokio::join!(
            spawn_layer(CitationEnforcer::from_policy(policy), prepared, policy),
            spawn_layer(CrossSourceChecker::from_policy(policy), prepared, policy),
            spawn_layer(PrivacyRedactor::from_policy(policy), prepared, policy),
            spawn_layer(SanityValidator::from_policy(policy), prepared, policy),
        );

        Ok(LayerOutcomes {
            citation: citation?,
            cross_source: cross_source?,
            privacy: privacy?,
            sanity: sanity?,
        })
    }

    async fn append_with_retry(
        &self,
        store: &Arc<dyn AuditStore>,
        outcome: &VerificationOutcome,
    ) -> Result<StoredAuditRecord, StoreError> {
        let retry = &self.config.retry;
        let backoff = ExponentialBuilder::default()
            .with_min_delay(retry.initial_backoff)
            .with_max_delay(retry.max_backoff)
            .with_max_times(retry.max_attempts.saturating_sub(1));

        let append = || {
            let store = Arc::clone(store);
            let record = outcome.audit.clone();
            async move {
                tokio::task::spawn_blocking(move || store.append(record))
                    .await
                    .unwrap_or_else(|e| Err(StoreError::Io(std::io::Error::other(e))))
            }
        };

        append
            .retry(backoff)
            .sleep(tokio::time::sleep)
            .when(StoreError::is_retryable)
            .notify(|error: &StoreError, delay| {
                tracing::warn!(
                    request_id = %outcome.audit.request_id,
                    error = %error,
                    delay = ?delay,
                    "Audit append failed, retrying"
                );
            })
            .await
    }
}

fn spawn_layer<C>(
    check: C,
    prepared: &Arc<PreparedRequest>,
    policy: &Arc<Policy>,
) -> JoinHandle<LayerOutcome>
where
    C: Check + Send + 'static,
{
    let prepared = Arc::clone(prepared);
    let policy = Arc::clone(policy);
    tokio::task::spawn_blocking(move || {
        let outcome = check.run(&prepared.input(&policy));
        tracing::debug!(
            layer = %check.layer(),
            issues = outcome.issues.len(),
            "Layer finished"
        );
        outcome
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::secrets::KeySource;
    use crate::store::{IndexEntry, MemoryAuditStore};
    use attest_core::{verify_signature, verify_signed, AuditRecord, RawFact};
    use chrono::{DateTime, TimeZone, Utc};
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 10, 0, 0, 0).unwrap()
    }

    fn request(id: &str) -> VerificationRequest {
        VerificationRequest::new(
            id,
            "Unemployment was 0.10% [Per GCC-STAT]. Contact a.b@example.org. It rose to 9%.",
            vec![
                RawFact::numeric("qatar_unemployment", 0.10, "GCC-STAT", "2024-04-09"),
                RawFact::numeric("qatar_unemployment", 0.30, "ILO", "2024-04-09"),
            ],
            now(),
        )
    }

    fn policy() -> Arc<Policy> {
        Arc::new(
            Policy::from_yaml(
                r#"
crosschecks:
  - metric: qatar_unemployment
    tolerance_pct: 5
    preferred_source: GCC-STAT
"#,
            )
            .unwrap(),
        )
    }

    fn fast_retry() -> RuntimeConfig {
        RuntimeConfig {
            retry: RetryConfig {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
            },
            ..RuntimeConfig::default()
        }
    }

    #[tokio::test]
    async fn test_concurrent_matches_sequential() {
        let runtime = VerificationRuntime::new(RuntimeConfig::default())
            .with_signing_key(SigningKey::new("k", KeySource::Programmatic));
        let concurrent = runtime.verify(request("r1"), policy()).await.unwrap();
        let sequential = verify_signed(request("r1"), &policy(), Some(b"k")).unwrap();

        assert_eq!(concurrent.outcome, sequential);
        assert!(!concurrent.outcome.summary.ok);
        assert!(concurrent.stored.is_none());
        assert!(verify_signature(&concurrent.outcome.audit, b"k").is_ok());
    }

    #[tokio::test]
    async fn test_sequential_mode() {
        let config = RuntimeConfig {
            concurrent_layers: false,
            ..RuntimeConfig::default()
        };
        let outcome = VerificationRuntime::new(config)
            .verify(request("r1"), policy())
            .await
            .unwrap();
        let expected = verify_signed(request("r1"), &policy(), None).unwrap();
        assert_eq!(outcome.outcome, expected);
    }

    #[tokio::test]
    async fn test_appends_to_store() {
        let store = Arc::new(MemoryAuditStore::new());
        let runtime = VerificationRuntime::new(RuntimeConfig::default()).with_store(store.clone());

        let first = runtime.verify(request("r1"), policy()).await.unwrap();
        runtime.verify(request("r2"), policy()).await.unwrap();

        assert_eq!(first.stored.unwrap().link.sequence, 0);
        assert_eq!(store.len(), 2);
        assert_eq!(store.verify().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_request_not_retried() {
        let store = Arc::new(MemoryAuditStore::new());
        let runtime = VerificationRuntime::new(fast_retry()).with_store(store.clone());

        runtime.verify(request("r1"), policy()).await.unwrap();
        let err = runtime.verify(request("r1"), policy()).await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Store(StoreError::DuplicateRequestId(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_narrative_is_fatal() {
        let mut req = request("r1");
        req.narrative = None;
        let err = VerificationRuntime::new(RuntimeConfig::default())
            .verify(req, policy())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Verify(VerifyError::MissingNarrative)
        ));
    }

    /// Fails the first `failures` appends with a transient error.
    struct FlakyStore {
        inner: MemoryAuditStore,
        failures: usize,
        attempts: AtomicUsize,
    }

    impl AuditStore for FlakyStore {
        fn append(&self, record: AuditRecord) -> Result<StoredAuditRecord, StoreError> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(StoreError::Io(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "disk busy",
                )));
            }
            self.inner.append(record)
        }

        fn get(&self, request_id: &str) -> Result<Option<StoredAuditRecord>, StoreError> {
            self.inner.get(request_id)
        }

        fn list(&self) -> Result<Vec<IndexEntry>, StoreError> {
            self.inner.list()
        }
    }

    #[tokio::test]
    async fn test_transient_failures_retried() {
        let store = Arc::new(FlakyStore {
            inner: MemoryAuditStore::new(),
            failures: 2,
            attempts: AtomicUsize::new(0),
        });
        let runtime = VerificationRuntime::new(fast_retry()).with_store(store.clone());

        let result = runtime.verify(request("r1"), policy()).await.unwrap();
        assert!(result.stored.is_some());
        assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_bounded() {
        let store = Arc::new(FlakyStore {
            inner: MemoryAuditStore::new(),
            failures: 10,
            attempts: AtomicUsize::new(0),
        });
        let runtime = VerificationRuntime::new(fast_retry()).with_store(store.clone());

        let err = runtime.verify(request("r1"), policy()).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Store(StoreError::Io(_))));
        assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_from_config_opens_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = RuntimeConfig {
            audit_dir: Some(dir.path().to_path_buf()),
            signing_key_env: "ATTEST_TEST_RUNTIME_KEY_UNSET_4242".to_string(),
            ..RuntimeConfig::default()
        };
        let runtime = VerificationRuntime::from_config(config).unwrap();
        let result = runtime.verify(request("r1"), policy()).await.unwrap();

        assert!(!result.outcome.audit.is_signed());
        assert!(dir.path().join("records/r1.json").exists());
        assert_eq!(runtime.store().unwrap().verify().unwrap(), 1);
    }
}
