//! Evidence linking for verification issues.
//!
//! Every issue should point at the location that triggered it: a byte range
//! of the narrative, an ingested fact, or an entry of the policy.

use serde::{Deserialize, Serialize};

use crate::types::Span;

/// Where a piece of evidence comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceSource {
    Narrative,
    Fact,
    Policy,
}

/// A piece of evidence supporting an issue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Evidence {
    /// What this evidence supports
    pub claim: String,

    /// Where the evidence comes from
    pub source: EvidenceSource,

    /// Pointer to the location (e.g., "narrative[47:52]", "facts[3]")
    pub pointer: String,
}

impl Evidence {
    /// Evidence from a byte range of the narrative.
    pub fn from_narrative(claim: impl Into<String>, start: usize, end: usize) -> Self {
        Self {
            claim: claim.into(),
            source: EvidenceSource::Narrative,
            pointer: format!("narrative[{}:{}]", start, end),
        }
    }

    /// Evidence from a narrative span.
    pub fn from_span(claim: impl Into<String>, span: Span) -> Self {
        Self::from_narrative(claim, span.start, span.end)
    }

    /// Evidence from an ingested fact, by index.
    pub fn from_fact(claim: impl Into<String>, index: usize) -> Self {
        Self {
            claim: claim.into(),
            source: EvidenceSource::Fact,
            pointer: format!("facts[{}]", index),
        }
    }

    /// Evidence from a policy path (e.g., "policy.sanity[2]").
    pub fn from_policy(claim: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            claim: claim.into(),
            source: EvidenceSource::Policy,
            pointer: path.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evidence_from_narrative() {
        let evidence = Evidence::from_narrative("0.10%", 23, 28);
        assert_eq!(evidence.source, EvidenceSource::Narrative);
        assert_eq!(evidence.pointer, "narrative[23:28]");
    }

    #[test]
    fn test_evidence_from_fact() {
        let evidence = Evidence::from_fact("stale", 4);
        assert_eq!(evidence.source, EvidenceSource::Fact);
        assert_eq!(evidence.pointer, "facts[4]");
    }

    #[test]
    fn test_evidence_from_policy() {
        let evidence = Evidence::from_policy("min > max", "policy.sanity[1]");
        assert_eq!(evidence.source, EvidenceSource::Policy);
        assert_eq!(evidence.pointer, "policy.sanity[1]");
    }
}
