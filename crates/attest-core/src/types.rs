//! Shared verification types: layers, severities, issues and results.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::evidence::Evidence;

/// Stable issue codes emitted by the layers.
///
/// Codes are part of the output contract: consumers match on them, so they
/// never change once released.
pub mod codes {
    // Citation layer
    pub const MISSING_CITATION: &str = "MISSING_CITATION";
    pub const CITATION_NOT_IN_DATA: &str = "CITATION_NOT_IN_DATA";
    pub const POSSIBLE_FABRICATION: &str = "POSSIBLE_FABRICATION";
    pub const LOW_CITATION_COVERAGE: &str = "LOW_CITATION_COVERAGE";

    // Cross-source layer
    pub const XCHK_TOLERANCE_EXCEEDED: &str = "XCHK_TOLERANCE_EXCEEDED";
    pub const INVALID_CROSSCHECK: &str = "INVALID_CROSSCHECK";

    // Privacy layer
    pub const EMAIL_REDACTED: &str = "EMAIL_REDACTED";
    pub const ID_REDACTED: &str = "ID_REDACTED";
    pub const NAME_REDACTED: &str = "NAME_REDACTED";
    pub const NAME_REDACTION_EXEMPT: &str = "NAME_REDACTION_EXEMPT";
    pub const K_ANONYMITY_VIOLATION: &str = "K_ANONYMITY_VIOLATION";
    pub const PII_IN_FACT: &str = "PII_IN_FACT";

    // Sanity layer
    pub const RATE_OUT_OF_RANGE: &str = "RATE_OUT_OF_RANGE";
    pub const NEGATIVE_VALUE: &str = "NEGATIVE_VALUE";
    pub const BELOW_MIN: &str = "BELOW_MIN";
    pub const ABOVE_MAX: &str = "ABOVE_MAX";
    pub const STALE_DATA: &str = "STALE_DATA";
    pub const FRESHNESS_PARSE_ERROR: &str = "FRESHNESS_PARSE_ERROR";
    pub const FUTURE_TIMESTAMP: &str = "FUTURE_TIMESTAMP";
    pub const MALFORMED_FACT: &str = "MALFORMED_FACT";
    pub const INVALID_SANITY_RULE: &str = "INVALID_SANITY_RULE";
    pub const INVALID_CONFIDENCE_WEIGHTS: &str = "INVALID_CONFIDENCE_WEIGHTS";
}

/// The verification layer that produced an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Citation,
    CrossSource,
    Privacy,
    Sanity,
}

impl Layer {
    /// All layers in the order their issues are reported.
    pub const ALL: [Layer; 4] = [
        Layer::Citation,
        Layer::CrossSource,
        Layer::Privacy,
        Layer::Sanity,
    ];
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layer::Citation => write!(f, "citation"),
            Layer::CrossSource => write!(f, "cross_source"),
            Layer::Privacy => write!(f, "privacy"),
            Layer::Sanity => write!(f, "sanity"),
        }
    }
}

/// Issue severity. Ordered so that `Error` is the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// The unit of verification output.
///
/// Issues are created once and never mutated; the builder methods consume
/// and return the issue so construction reads as a single expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub layer: Layer,

    /// Stable identifier, see [`codes`]
    pub code: String,

    pub severity: Severity,

    /// Human-readable explanation
    pub message: String,

    /// Machine-readable details (sorted keys for stable serialization)
    #[serde(default)]
    pub details: BTreeMap<String, Value>,

    /// Pointers into the narrative, facts or policy backing this issue
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<Evidence>,
}

impl Issue {
    pub fn new(
        layer: Layer,
        code: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            layer,
            code: code.into(),
            severity,
            message: message.into(),
            details: BTreeMap::new(),
            evidence: Vec::new(),
        }
    }

    pub fn info(layer: Layer, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(layer, code, Severity::Info, message)
    }

    pub fn warning(layer: Layer, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(layer, code, Severity::Warning, message)
    }

    pub fn error(layer: Layer, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(layer, code, Severity::Error, message)
    }

    /// Attach a detail value.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Attach a piece of evidence.
    pub fn with_evidence(mut self, evidence: Evidence) -> Self {
        self.evidence.push(evidence);
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// Byte range inside the narrative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, offset: usize) -> bool {
        offset >= self.start && offset < self.end
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Reference to the fact a claim was reconciled against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedFact {
    /// Index into the ingested fact list
    pub index: usize,
    pub metric_id: String,
    pub source_name: String,
}

/// A numeric value extracted from narrative text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericClaim {
    /// Original substring
    pub raw_text: String,

    /// Canonical value (scale words applied, percent sign not applied)
    pub parsed_value: f64,

    /// Whether the claim was written as a percentage
    pub percent: bool,

    pub char_span: Span,

    /// The fact this claim was reconciled against, if any
    pub matched_fact: Option<MatchedFact>,

    /// Source text of the inline citation marker carried by the claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cited_source: Option<String>,
}

/// Issue counts by severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueCounts {
    pub info: usize,
    pub warning: usize,
    pub error: usize,
}

impl IssueCounts {
    pub fn tally(issues: &[Issue]) -> Self {
        issues.iter().fold(Self::default(), |mut counts, issue| {
            match issue.severity {
                Severity::Info => counts.info += 1,
                Severity::Warning => counts.warning += 1,
                Severity::Error => counts.error += 1,
            }
            counts
        })
    }
}

/// Aggregate result of one verification run.
///
/// `ok` is false whenever any issue has `Severity::Error`; callers must not
/// release the narrative in that case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationSummary {
    pub ok: bool,
    pub issues: Vec<Issue>,
    pub counts: IssueCounts,
    pub redactions_applied: usize,
    pub redacted_narrative: String,
}

impl VerificationSummary {
    /// Issues from a single layer.
    pub fn issues_for(&self, layer: Layer) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(move |i| i.layer == layer)
    }

    /// Whether any issue carries the given code.
    pub fn has_code(&self, code: &str) -> bool {
        self.issues.iter().any(|i| i.code == code)
    }
}

/// Qualitative confidence band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceBand {
    /// Below 40
    Low,
    /// 40 to 59
    Medium,
    /// 60 to 80
    High,
    /// Above 80
    VeryHigh,
}

impl ConfidenceBand {
    pub fn from_value(value: u8) -> Self {
        match value {
            0..=39 => ConfidenceBand::Low,
            40..=59 => ConfidenceBand::Medium,
            60..=80 => ConfidenceBand::High,
            _ => ConfidenceBand::VeryHigh,
        }
    }
}

impl fmt::Display for ConfidenceBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfidenceBand::Low => write!(f, "low"),
            ConfidenceBand::Medium => write!(f, "medium"),
            ConfidenceBand::High => write!(f, "high"),
            ConfidenceBand::VeryHigh => write!(f, "very_high"),
        }
    }
}

/// Named sub-scores of the confidence computation, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceFactors {
    pub freshness: f64,
    pub issue_penalty: f64,
    pub sample_adequacy: f64,
    pub stability: f64,
}

/// Weights applied to [`ConfidenceFactors`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceWeights {
    pub freshness: f64,
    pub issue_penalty: f64,
    pub sample_adequacy: f64,
    pub stability: f64,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            freshness: 0.3,
            issue_penalty: 0.3,
            sample_adequacy: 0.2,
            stability: 0.2,
        }
    }
}

impl ConfidenceWeights {
    pub fn sum(&self) -> f64 {
        self.freshness + self.issue_penalty + self.sample_adequacy + self.stability
    }

    /// Weights are usable when none is negative or non-finite and the sum is positive.
    pub fn is_valid(&self) -> bool {
        let all = [
            self.freshness,
            self.issue_penalty,
            self.sample_adequacy,
            self.stability,
        ];
        all.iter().all(|w| w.is_finite() && *w >= 0.0) && self.sum() > 0.0
    }
}

/// Trust score for one verification run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceScore {
    /// 0 to 100
    pub value: u8,
    pub band: ConfidenceBand,
    pub factors: ConfidenceFactors,
    pub weights: ConfidenceWeights,

    /// True when an Error-severity issue forced the score into the Low band
    pub capped_by_error: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_boundaries() {
        assert_eq!(ConfidenceBand::from_value(0), ConfidenceBand::Low);
        assert_eq!(ConfidenceBand::from_value(39), ConfidenceBand::Low);
        assert_eq!(ConfidenceBand::from_value(40), ConfidenceBand::Medium);
        assert_eq!(ConfidenceBand::from_value(59), ConfidenceBand::Medium);
        assert_eq!(ConfidenceBand::from_value(60), ConfidenceBand::High);
        assert_eq!(ConfidenceBand::from_value(80), ConfidenceBand::High);
        assert_eq!(ConfidenceBand::from_value(81), ConfidenceBand::VeryHigh);
        assert_eq!(ConfidenceBand::from_value(100), ConfidenceBand::VeryHigh);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Error > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }

    #[test]
    fn test_issue_builder() {
        let issue = Issue::warning(Layer::Sanity, codes::STALE_DATA, "old")
            .with_detail("metric_id", "qatar_unemployment")
            .with_detail("age_hours", 200.5);

        assert_eq!(issue.code, "STALE_DATA");
        assert_eq!(issue.details["metric_id"], "qatar_unemployment");
        assert!(!issue.is_error());
    }

    #[test]
    fn test_issue_serializes_layer_snake_case() {
        let issue = Issue::info(Layer::CrossSource, "X", "m");
        let json = serde_json::to_value(&issue).unwrap();
        assert_eq!(json["layer"], "cross_source");
        assert_eq!(json["severity"], "info");
    }

    #[test]
    fn test_counts_tally() {
        let issues = vec![
            Issue::info(Layer::Privacy, "A", ""),
            Issue::warning(Layer::Sanity, "B", ""),
            Issue::error(Layer::Citation, "C", ""),
            Issue::error(Layer::Citation, "D", ""),
        ];
        let counts = IssueCounts::tally(&issues);
        assert_eq!(counts, IssueCounts { info: 1, warning: 1, error: 2 });
    }

    #[test]
    fn test_weights_validity() {
        assert!(ConfidenceWeights::default().is_valid());
        let negative = ConfidenceWeights {
            freshness: -0.1,
            ..Default::default()
        };
        assert!(!negative.is_valid());
        let zero = ConfidenceWeights {
            freshness: 0.0,
            issue_penalty: 0.0,
            sample_adequacy: 0.0,
            stability: 0.0,
        };
        assert!(!zero.is_valid());
    }
}
