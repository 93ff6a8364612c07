//! Audit signing key handling.
//!
//! The HMAC key is held in a `SecretString` from the moment it is loaded:
//!
//! - **No accidental logging**: the key never appears in Debug/Display output
//! - **Memory safety**: the key is zeroed on drop
//! - **Explicit exposure**: bytes are only reachable through [`SigningKey::expose`]
//!
//! An absent or empty key is not an error; audit records are then marked
//! unsigned.

use secrecy::{ExposeSecret, SecretString};
use std::fmt;

/// Where a signing key was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// Loaded from an environment variable
    Environment,
    /// Provided programmatically
    Programmatic,
}

impl fmt::Display for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySource::Environment => write!(f, "environment"),
            KeySource::Programmatic => write!(f, "programmatic"),
        }
    }
}

/// Operator-held key for signing audit records.
pub struct SigningKey {
    value: SecretString,
    source: KeySource,
}

impl SigningKey {
    pub fn new(value: impl Into<String>, source: KeySource) -> Self {
        Self {
            value: SecretString::from(value.into()),
            source,
        }
    }

    /// Load the key from an environment variable.
    ///
    /// Returns `None` when the variable is unset or empty.
    pub fn from_env(env_var: &str) -> Option<Self> {
        match std::env::var(env_var) {
            Ok(value) if !value.is_empty() => Some(Self::new(value, KeySource::Environment)),
            _ => {
                tracing::debug!(env_var, "No audit signing key configured");
                None
            }
        }
    }

    /// Key bytes for the HMAC. Call at the point of use only.
    pub fn expose(&self) -> &[u8] {
        self.value.expose_secret().as_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.value.expose_secret().is_empty()
    }

    pub fn source(&self) -> KeySource {
        self.source
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("value", &"[REDACTED]")
            .field("source", &self.source)
            .finish()
    }
}

impl fmt::Display for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "audit signing key from {} [REDACTED]", self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_redacted_in_debug() {
        let secret = "hmac-super-secret-12345";
        let key = SigningKey::new(secret, KeySource::Programmatic);

        let debug = format!("{:?}", key);
        assert!(!debug.contains(secret), "Secret exposed in Debug!");
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_key_redacted_in_display() {
        let secret = "hmac-super-secret-12345";
        let key = SigningKey::new(secret, KeySource::Environment);

        let display = format!("{}", key);
        assert!(!display.contains(secret), "Secret exposed in Display!");
        assert!(display.contains("environment"));
    }

    #[test]
    fn test_expose() {
        let key = SigningKey::new("abc", KeySource::Programmatic);
        assert_eq!(key.expose(), b"abc");
        assert!(!key.is_empty());
    }

    #[test]
    fn test_from_env() {
        std::env::set_var("ATTEST_TEST_SIGNING_KEY", "env-key");
        let key = SigningKey::from_env("ATTEST_TEST_SIGNING_KEY").unwrap();
        assert_eq!(key.expose(), b"env-key");
        assert_eq!(key.source(), KeySource::Environment);
        std::env::remove_var("ATTEST_TEST_SIGNING_KEY");

        assert!(SigningKey::from_env("ATTEST_TEST_SIGNING_KEY_UNSET_98765").is_none());

        std::env::set_var("ATTEST_TEST_SIGNING_KEY_EMPTY", "");
        assert!(SigningKey::from_env("ATTEST_TEST_SIGNING_KEY_EMPTY").is_none());
        std::env::remove_var("ATTEST_TEST_SIGNING_KEY_EMPTY");
    }
}
