//! # attest-runtime
//!
//! Async runtime and append-only audit storage for Attest.
//!
//! ## Important
//!
//! This crate is OPTIONAL. `attest-core` already verifies a request
//! synchronously and deterministically; the runtime adds:
//! - Concurrent execution of the four layers on a tokio runtime
//! - A write-once audit store (files or memory) with a verifiable hash chain
//! - Bounded retry with backoff around the audit-store append
//! - Signing-key handling that keeps the key out of logs
//!
//! ## Example
//!
//! ```rust,ignore
//! use attest_runtime::{RuntimeConfig, VerificationRuntime};
//!
//! let config = RuntimeConfig::from_yaml_file("runtime.yaml")?;
//! let runtime = VerificationRuntime::from_config(config)?;
//!
//! let result = runtime.verify(request, Arc::new(policy)).await?;
//! println!("stored as #{}", result.stored.unwrap().link.sequence);
//! ```

pub mod config;
pub mod orchestrator;
pub mod secrets;
pub mod store;

pub use config::{ConfigError, RetryConfig, RuntimeConfig, DEFAULT_SIGNING_KEY_ENV};
pub use orchestrator::{RuntimeError, RuntimeOutcome, VerificationRuntime};
pub use secrets::{KeySource, SigningKey};
pub use store::{
    validate_request_id, AuditStore, FileAuditStore, IndexEntry, MemoryAuditStore, StoreError,
};
