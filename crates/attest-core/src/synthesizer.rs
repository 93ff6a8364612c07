//! Synthesizer: merges layer outcomes into one verification summary.
//!
//! The merge is fixed and not configurable:
//! 1. Issues are reported in layer order Citation, CrossSource, Privacy,
//!    Sanity, whatever order the layers finished in
//! 2. Within a layer, load-time issues (dropped policy entries, malformed
//!    facts) come before the layer's own findings
//! 3. `ok` is false if and only if some issue has error severity
//!
//! Redactions and annotations are applied once, over the original narrative.

use serde::{Deserialize, Serialize};

use crate::checks::{apply_edits, LayerOutcome, NarrativeEdit};
use crate::types::{Issue, IssueCounts, Layer, NumericClaim, Severity, VerificationSummary};

/// Outcomes of the four layers of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerOutcomes {
    pub citation: LayerOutcome,
    pub cross_source: LayerOutcome,
    pub privacy: LayerOutcome,
    pub sanity: LayerOutcome,
}

impl LayerOutcomes {
    /// Outcomes in reporting order.
    pub fn in_order(&self) -> [&LayerOutcome; 4] {
        [&self.citation, &self.cross_source, &self.privacy, &self.sanity]
    }
}

/// The merged result, before confidence and audit.
#[derive(Debug, Clone, PartialEq)]
pub struct Synthesis {
    pub summary: VerificationSummary,

    /// Claims examined by the citation layer
    pub claims: Vec<NumericClaim>,

    /// Layer notes, prefixed with the layer name
    pub notes: Vec<String>,
}

/// The Synthesizer merges layer outcomes into a final summary.
#[derive(Debug, Clone, Copy, Default)]
pub struct Synthesizer;

impl Synthesizer {
    pub fn new() -> Self {
        Self
    }

    /// Merge layer outcomes.
    ///
    /// # Arguments
    ///
    /// * `narrative` - The original narrative
    /// * `preliminary` - Issues raised while loading the policy and facts
    /// * `outcomes` - Outcomes of all four layers
    pub fn synthesize(
        &self,
        narrative: &str,
        preliminary: &[Issue],
        outcomes: LayerOutcomes,
    ) -> Synthesis {
        let mut issues = Vec::new();
        let mut edits: Vec<NarrativeEdit> = Vec::new();
        let mut notes = Vec::new();

        for (layer, outcome) in Layer::ALL.iter().zip(outcomes.in_order()) {
            issues.extend(preliminary.iter().filter(|i| i.layer == *layer).cloned());
            issues.extend(outcome.issues.iter().cloned());
            edits.extend(outcome.edits.iter().cloned());
            notes.extend(outcome.notes.iter().map(|n| format!("{}: {}", layer, n)));
        }

        let redactions_applied = outcomes.privacy.redactions();
        let redacted_narrative = apply_edits(narrative, &edits);
        let counts = IssueCounts::tally(&issues);
        let ok = !issues.iter().any(|i| i.severity == Severity::Error);

        tracing::debug!(
            ok,
            errors = counts.error,
            warnings = counts.warning,
            infos = counts.info,
            redactions_applied,
            "Synthesized verification summary"
        );

        Synthesis {
            summary: VerificationSummary {
                ok,
                issues,
                counts,
                redactions_applied,
                redacted_narrative,
            },
            claims: outcomes.citation.claims,
            notes,
        }
    }
}
