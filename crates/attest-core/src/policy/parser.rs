//! Policy parsing from YAML/JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use thiserror::Error;

use super::schema::{describe_violations, validate_policy_schema, PolicySchemaError};
use crate::evidence::Evidence;
use crate::types::{codes, ConfidenceWeights, Issue, Layer};

/// Errors that can occur when loading a policy.
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("Failed to read policy file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Policy does not match the policy schema: {}", describe_violations(.0))]
    SchemaError(Vec<PolicySchemaError>),

    #[error("Policy validation failed: {0}")]
    ValidationError(String),
}

/// Citation enforcement settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CitationPolicy {
    pub abs_epsilon: f64,
    pub rel_epsilon: f64,

    /// Minimum `matched / total_claims` before coverage escalates
    pub min_coverage: f64,

    /// Insert ` [UNVERIFIED]` after flagged claims in the released narrative
    pub annotate_unverified: bool,
}

impl Default for CitationPolicy {
    fn default() -> Self {
        Self {
            abs_epsilon: 0.5,
            rel_epsilon: 0.01,
            min_coverage: 0.8,
            annotate_unverified: false,
        }
    }
}

/// Per-metric cross-source tolerance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrosscheckRule {
    pub metric: String,
    pub tolerance_pct: f64,

    /// Source downstream consumers should trust on disagreement
    #[serde(default)]
    pub preferred_source: Option<String>,
}

/// Privacy redaction settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyPolicy {
    /// Minimum group size for a disclosed statistic; 0 disables the check
    pub k_anonymity: u64,

    pub redact_email: bool,

    /// Redact digit runs of at least this length; `null` disables
    pub redact_ids_min_digits: Option<usize>,

    pub redact_names: bool,

    /// Roles that exempt a caller from name redaction
    pub allow_names_when_role: Vec<String>,
}

impl PrivacyPolicy {
    /// Whether a caller holding any of `roles` is exempt from name redaction.
    pub fn names_allowed_for(&self, roles: &[String]) -> bool {
        roles
            .iter()
            .any(|role| self.allow_names_when_role.contains(role))
    }
}

impl Default for PrivacyPolicy {
    fn default() -> Self {
        Self {
            k_anonymity: 5,
            redact_email: true,
            redact_ids_min_digits: Some(8),
            redact_names: true,
            allow_names_when_role: vec!["allow_names".to_string()],
        }
    }
}

/// Range and rate rule for one metric (or a `prefix*` pattern).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SanityRule {
    pub metric: String,

    #[serde(default)]
    pub rate_0_1: bool,

    #[serde(default)]
    pub must_be_non_negative: bool,

    #[serde(default)]
    pub min_value: Option<f64>,

    #[serde(default)]
    pub max_value: Option<f64>,

    /// Violations are errors instead of warnings
    #[serde(default)]
    pub critical: bool,
}

impl SanityRule {
    /// Whether this rule applies to a metric id.
    pub fn applies_to(&self, metric_id: &str) -> bool {
        match self.metric.strip_suffix('*') {
            Some(prefix) => metric_id.starts_with(prefix),
            None => self.metric == metric_id,
        }
    }

    fn problem(&self) -> Option<String> {
        if self.metric.trim().is_empty() || self.metric == "*" {
            return Some("metric must name a metric or a prefix".to_string());
        }
        for (name, bound) in [("min_value", self.min_value), ("max_value", self.max_value)] {
            if bound.map_or(false, |b| !b.is_finite()) {
                return Some(format!("{} must be finite", name));
            }
        }
        if let (Some(min), Some(max)) = (self.min_value, self.max_value) {
            if min > max {
                return Some(format!("min_value {} exceeds max_value {}", min, max));
            }
        }
        None
    }
}

impl CrosscheckRule {
    fn problem(&self) -> Option<String> {
        if self.metric.trim().is_empty() {
            return Some("metric must not be empty".to_string());
        }
        if !self.tolerance_pct.is_finite() || self.tolerance_pct < 0.0 {
            return Some(format!(
                "tolerance_pct must be a non-negative number, got {}",
                self.tolerance_pct
            ));
        }
        None
    }
}

/// Confidence finalizer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceSettings {
    /// Fact count at which sample adequacy saturates
    pub min_facts: usize,
    pub warning_penalty: f64,
    pub error_penalty: f64,
}

impl Default for ConfidenceSettings {
    fn default() -> Self {
        Self {
            min_facts: 3,
            warning_penalty: 0.1,
            error_penalty: 0.5,
        }
    }
}

/// The document as written; entries stay untyped until checked one by one.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct PolicyDocument {
    policy_version: String,
    citation: CitationPolicy,
    crosschecks: Vec<Value>,
    crosscheck_default_tolerance_pct: Option<f64>,
    privacy: PrivacyPolicy,
    sanity: Vec<Value>,
    freshness_max_hours: f64,
    confidence_weights: Option<Value>,
    confidence: ConfidenceSettings,
}

impl Default for PolicyDocument {
    fn default() -> Self {
        Self {
            policy_version: default_policy_version(),
            citation: CitationPolicy::default(),
            crosschecks: Vec::new(),
            crosscheck_default_tolerance_pct: None,
            privacy: PrivacyPolicy::default(),
            sanity: Vec::new(),
            freshness_max_hours: DEFAULT_FRESHNESS_MAX_HOURS,
            confidence_weights: None,
            confidence: ConfidenceSettings::default(),
        }
    }
}

const DEFAULT_FRESHNESS_MAX_HOURS: f64 = 168.0;

fn default_policy_version() -> String {
    "1".to_string()
}

/// A verification policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Policy {
    pub policy_version: String,
    pub citation: CitationPolicy,
    pub crosschecks: Vec<CrosscheckRule>,
    pub crosscheck_default_tolerance_pct: Option<f64>,
    pub privacy: PrivacyPolicy,
    pub sanity: Vec<SanityRule>,
    pub freshness_max_hours: f64,
    pub confidence_weights: ConfidenceWeights,
    pub confidence: ConfidenceSettings,

    /// Warnings about entries dropped while loading
    #[serde(skip)]
    diagnostics: Vec<Issue>,
}

impl Default for Policy {
    fn default() -> Self {
        Self::from_document(PolicyDocument::default())
    }
}

impl Policy {
    /// Parse a policy from a YAML string. An empty document is the default policy.
    pub fn from_yaml(yaml: &str) -> Result<Self, PolicyError> {
        if yaml.trim().is_empty() {
            return Self::from_value(Value::Null);
        }
        let value: Value = serde_yaml::from_str(yaml)?;
        Self::from_value(value)
    }

    /// Parse a policy from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, PolicyError> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    /// Parse a policy from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse a policy from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Parse a policy file, choosing the format by extension (`.json` or YAML).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let path = path.as_ref();
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .map_or(false, |e| e.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_file(path)
        } else {
            Self::from_yaml_file(path)
        }
    }

    /// Build a policy from an already-parsed document.
    pub fn from_value(value: Value) -> Result<Self, PolicyError> {
        let value = match value {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        validate_policy_schema(&value).map_err(PolicyError::SchemaError)?;

        let document: PolicyDocument = serde_json::from_value(value)?;
        let policy = Self::from_document(document);
        policy.validate()?;
        Ok(policy)
    }

    fn from_document(document: PolicyDocument) -> Self {
        let mut diagnostics = Vec::new();
        let mut seen_metrics = HashSet::new();

        let crosschecks = document
            .crosschecks
            .into_iter()
            .enumerate()
            .filter_map(|(i, entry)| {
                let path = format!("policy.crosschecks[{}]", i);
                let parsed = serde_json::from_value::<CrosscheckRule>(entry)
                    .map_err(|e| e.to_string())
                    .and_then(|rule| match rule.problem() {
                        Some(problem) => Err(problem),
                        None => Ok(rule),
                    })
                    .and_then(|rule| {
                        // First entry for a metric wins
                        if seen_metrics.insert(rule.metric.clone()) {
                            Ok(rule)
                        } else {
                            Err(format!("duplicate crosscheck metric '{}'", rule.metric))
                        }
                    });
                match parsed {
                    Ok(rule) => Some(rule),
                    Err(reason) => {
                        diagnostics.push(rejected_entry(
                            Layer::CrossSource,
                            codes::INVALID_CROSSCHECK,
                            &path,
                            reason,
                        ));
                        None
                    }
                }
            })
            .collect();

        let sanity = document
            .sanity
            .into_iter()
            .enumerate()
            .filter_map(|(i, entry)| {
                let path = format!("policy.sanity[{}]", i);
                let parsed = serde_json::from_value::<SanityRule>(entry)
                    .map_err(|e| e.to_string())
                    .and_then(|rule| match rule.problem() {
                        Some(problem) => Err(problem),
                        None => Ok(rule),
                    });
                match parsed {
                    Ok(rule) => Some(rule),
                    Err(reason) => {
                        diagnostics.push(rejected_entry(
                            Layer::Sanity,
                            codes::INVALID_SANITY_RULE,
                            &path,
                            reason,
                        ));
                        None
                    }
                }
            })
            .collect();

        let confidence_weights = match document.confidence_weights {
            None => ConfidenceWeights::default(),
            Some(raw) => match serde_json::from_value::<ConfidenceWeights>(raw) {
                Ok(weights) if weights.is_valid() => weights,
                Ok(_) => {
                    diagnostics.push(rejected_entry(
                        Layer::Sanity,
                        codes::INVALID_CONFIDENCE_WEIGHTS,
                        "policy.confidence_weights",
                        "weights must be finite, non-negative and not all zero; using defaults"
                            .to_string(),
                    ));
                    ConfidenceWeights::default()
                }
                Err(e) => {
                    diagnostics.push(rejected_entry(
                        Layer::Sanity,
                        codes::INVALID_CONFIDENCE_WEIGHTS,
                        "policy.confidence_weights",
                        format!("{}; using defaults", e),
                    ));
                    ConfidenceWeights::default()
                }
            },
        };

        Self {
            policy_version: document.policy_version,
            citation: document.citation,
            crosschecks,
            crosscheck_default_tolerance_pct: document.crosscheck_default_tolerance_pct,
            privacy: document.privacy,
            sanity,
            freshness_max_hours: document.freshness_max_hours,
            confidence_weights,
            confidence: document.confidence,
            diagnostics,
        }
    }

    /// Checks the schema cannot express.
    fn validate(&self) -> Result<(), PolicyError> {
        if self.policy_version.trim().is_empty() {
            return Err(PolicyError::ValidationError(
                "policy_version must not be empty".to_string(),
            ));
        }

        if !self.freshness_max_hours.is_finite() {
            return Err(PolicyError::ValidationError(
                "freshness_max_hours must be finite".to_string(),
            ));
        }

        Ok(())
    }

    /// Warnings about entries that were dropped while loading.
    ///
    /// These are reported in every verification run using this policy.
    pub fn diagnostics(&self) -> &[Issue] {
        &self.diagnostics
    }

    /// Freshness SLA as a duration.
    pub fn freshness_max_age(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.freshness_max_hours * 3_600_000.0) as i64)
    }

    /// Stable SHA-256 digest of the effective policy (hex).
    pub fn digest(&self) -> Result<String, PolicyError> {
        // Struct fields serialize in declaration order, so the bytes are stable
        let canonical = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&canonical)))
    }
}

fn rejected_entry(layer: Layer, code: &str, path: &str, reason: String) -> Issue {
    tracing::warn!(path, reason = %reason, "Dropped invalid policy entry");
    Issue::warning(layer, code, format!("Ignored {}: {}", path, reason))
        .with_detail("path", path)
        .with_detail("reason", reason.clone())
        .with_evidence(Evidence::from_policy(reason, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Severity;

    const VALID_POLICY: &str = r#"
policy_version: "2024.1"
citation:
  abs_epsilon: 0.5
  rel_epsilon: 0.01
  min_coverage: 0.8
crosschecks:
  - metric: qatar_unemployment
    tolerance_pct: 5.0
    preferred_source: GCC-STAT
privacy:
  k_anonymity: 15
  redact_email: true
  redact_ids_min_digits: 8
  allow_names_when_role: [allow_names]
sanity:
  - metric: qatar_unemployment
    rate_0_1: true
  - metric: "wage_*"
    must_be_non_negative: true
    critical: true
freshness_max_hours: 72
"#;

    #[test]
    fn test_parse_valid_policy() {
        let policy = Policy::from_yaml(VALID_POLICY).unwrap();
        assert_eq!(policy.policy_version, "2024.1");
        assert_eq!(policy.crosschecks.len(), 1);
        assert_eq!(policy.sanity.len(), 2);
        assert_eq!(policy.privacy.k_anonymity, 15);
        assert_eq!(policy.freshness_max_hours, 72.0);
        assert!(policy.diagnostics().is_empty());
    }

    #[test]
    fn test_empty_document_is_default() {
        let policy = Policy::from_yaml("").unwrap();
        assert_eq!(policy, Policy::default());
        assert_eq!(policy.freshness_max_hours, 168.0);
        assert_eq!(policy.privacy.redact_ids_min_digits, Some(8));
        assert_eq!(policy.confidence_weights, ConfidenceWeights::default());
    }

    #[test]
    fn test_json_policy() {
        let policy = Policy::from_json(r#"{"freshness_max_hours": 24}"#).unwrap();
        assert_eq!(policy.freshness_max_age(), chrono::Duration::hours(24));
    }

    #[test]
    fn test_schema_violation_is_fatal() {
        let result = Policy::from_yaml("privacy:\n  k_anonymity: lots\n");
        assert!(matches!(result, Err(PolicyError::SchemaError(_))));
    }

    #[test]
    fn test_invalid_sanity_entry_dropped_with_warning() {
        let yaml = r#"
sanity:
  - metric: participation
    min_value: 10
    max_value: 5
  - metric: participation
    rate_0_1: true
  - rate_0_1: true
"#;
        let policy = Policy::from_yaml(yaml).unwrap();
        assert_eq!(policy.sanity.len(), 1);
        assert_eq!(policy.diagnostics().len(), 2);
        assert!(policy
            .diagnostics()
            .iter()
            .all(|i| i.code == codes::INVALID_SANITY_RULE));
        assert_eq!(policy.diagnostics()[0].details["path"], "policy.sanity[0]");
        assert_eq!(policy.diagnostics()[1].details["path"], "policy.sanity[2]");
    }

    #[test]
    fn test_invalid_crosscheck_entry_dropped_with_warning() {
        let yaml = r#"
crosschecks:
  - metric: unemployment
    tolerance_pct: -1
  - metric: participation
    tolerance_pct: "five"
  - metric: wages
    tolerance_pct: 2.5
"#;
        let policy = Policy::from_yaml(yaml).unwrap();
        assert_eq!(policy.crosschecks.len(), 1);
        assert_eq!(policy.crosschecks[0].metric, "wages");
        assert_eq!(policy.diagnostics().len(), 2);
        assert!(policy
            .diagnostics()
            .iter()
            .all(|i| i.code == codes::INVALID_CROSSCHECK && i.layer == Layer::CrossSource));
    }

    #[test]
    fn test_invalid_weights_fall_back() {
        let yaml = r#"
confidence_weights:
  freshness: 0
  issue_penalty: 0
  sample_adequacy: 0
  stability: 0
"#;
        let policy = Policy::from_yaml(yaml).unwrap();
        assert_eq!(policy.confidence_weights, ConfidenceWeights::default());
        assert_eq!(policy.diagnostics()[0].code, codes::INVALID_CONFIDENCE_WEIGHTS);
    }

    #[test]
    fn test_partial_weights_keep_defaults() {
        let policy = Policy::from_yaml("confidence_weights:\n  stability: 0.5\n").unwrap();
        assert_eq!(policy.confidence_weights.stability, 0.5);
        assert_eq!(policy.confidence_weights.freshness, 0.3);
        assert!(policy.diagnostics().is_empty());
    }

    #[test]
    fn test_duplicate_crosscheck_metric_keeps_first() {
        let yaml = r#"
crosschecks:
  - metric: unemployment
    tolerance_pct: 1
  - metric: unemployment
    tolerance_pct: 2
"#;
        let policy = Policy::from_yaml(yaml).unwrap();
        assert_eq!(policy.crosschecks.len(), 1);
        assert_eq!(policy.crosschecks[0].tolerance_pct, 1.0);

        let diagnostics = policy.diagnostics();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].code, codes::INVALID_CROSSCHECK);
        assert_eq!(diagnostics[0].severity, Severity::Warning);
        assert!(diagnostics[0].message.contains("policy.crosschecks[1]"));
    }

    #[test]
    fn test_sanity_prefix_pattern() {
        let policy = Policy::from_yaml(VALID_POLICY).unwrap();
        let matching = |metric: &str| policy.sanity.iter().filter(|r| r.applies_to(metric)).count();
        assert_eq!(matching("wage_median"), 1);
        assert_eq!(matching("qatar_unemployment"), 1);
        assert_eq!(matching("other"), 0);
    }

    #[test]
    fn test_names_allowed_for_roles() {
        let privacy = PrivacyPolicy::default();
        assert!(privacy.names_allowed_for(&["analyst".to_string(), "allow_names".to_string()]));
        assert!(!privacy.names_allowed_for(&["analyst".to_string()]));
    }

    #[test]
    fn test_digest_is_stable_and_sensitive() {
        let a = Policy::from_yaml(VALID_POLICY).unwrap();
        let b = Policy::from_yaml(VALID_POLICY).unwrap();
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());
        assert_eq!(a.digest().unwrap().len(), 64);

        let c = Policy::from_yaml("freshness_max_hours: 1").unwrap();
        assert_ne!(a.digest().unwrap(), c.digest().unwrap());
    }
}
