//! Citation Enforcer
//!
//! Every number in the narrative must be backed by a supplied fact and carry
//! an inline marker naming that fact's source.
//!
//! Classification per claim:
//! - no fact within tolerance: `POSSIBLE_FABRICATION` (error)
//! - a fact within tolerance, no marker in the same sentence: `MISSING_CITATION`
//! - a marker naming a source none of the matching facts come from:
//!   `CITATION_NOT_IN_DATA`
//! - otherwise verified
//!
//! Verified claims over all claims is the coverage ratio; coverage below the
//! configured minimum adds `LOW_CITATION_COVERAGE` (error).

use crate::evidence::Evidence;
use crate::fact::Fact;
use crate::matching::{matching_facts, source_matches, FactMatch, Tolerance};
use crate::numbers::{scan_with, ScanOptions, ScannedNumber};
use crate::policy::{CitationPolicy, Policy};
use crate::types::{codes, Issue, Layer, MatchedFact, NumericClaim, Span};

use super::patterns::{citation_markers, non_claim_spans, sentence_ends_between, CitationMarker};
use super::{Check, CheckInput, LayerOutcome, NarrativeEdit};

/// Text inserted after flagged claims when annotation is enabled.
pub const UNVERIFIED_ANNOTATION: &str = " [UNVERIFIED]";

/// Note recorded when a narrative has nothing to verify.
pub const ZERO_CLAIMS_NOTE: &str = "narrative contains no numeric claims";

/// How a claim was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimStatus {
    Verified,
    MissingCitation,
    CitationNotInData,
    PossibleFabrication,
}

/// A numeric claim located in the narrative, before classification.
#[derive(Debug, Clone)]
pub struct LocatedClaim {
    pub number: ScannedNumber,

    /// Facts within tolerance, closest first
    pub matches: Vec<FactMatch>,

    /// First marker after the claim in the same sentence
    pub marker: Option<CitationMarker>,
}

/// Locate all numeric claims of a narrative and the facts they reconcile with.
///
/// Shared with the sanity layer, which checks matched claims against the
/// same range rules as facts.
pub fn locate_claims(
    narrative: &str,
    facts: &[Fact],
    tolerance: &Tolerance,
    identifier_min_digits: Option<usize>,
) -> Vec<LocatedClaim> {
    let markers = citation_markers(narrative);
    let excluded = non_claim_spans(narrative);
    let options = ScanOptions {
        skip_years: true,
        identifier_min_digits,
    };

    scan_with(narrative, &options, &excluded)
        .into_iter()
        .map(|number| {
            let matches = matching_facts(&number, facts, tolerance);
            let marker = markers
                .iter()
                .find(|m| m.span.start >= number.span.end)
                .filter(|m| {
                    !sentence_ends_between(narrative, number.span.end, m.span.start, &excluded)
                })
                .cloned();
            LocatedClaim {
                number,
                matches,
                marker,
            }
        })
        .collect()
}

/// Enforces citations on numeric claims.
#[derive(Debug, Clone, PartialEq)]
pub struct CitationEnforcer {
    tolerance: Tolerance,
    min_coverage: f64,
    annotate_unverified: bool,
    identifier_min_digits: Option<usize>,
}

impl Default for CitationEnforcer {
    fn default() -> Self {
        Self::new(&CitationPolicy::default())
    }
}

impl CitationEnforcer {
    pub fn new(policy: &CitationPolicy) -> Self {
        Self {
            tolerance: Tolerance::new(policy.abs_epsilon, policy.rel_epsilon),
            min_coverage: policy.min_coverage,
            annotate_unverified: policy.annotate_unverified,
            identifier_min_digits: None,
        }
    }

    pub fn from_policy(policy: &Policy) -> Self {
        Self {
            identifier_min_digits: policy.privacy.redact_ids_min_digits,
            ..Self::new(&policy.citation)
        }
    }

    /// Check a narrative against facts.
    ///
    /// Returns the narrative (annotated when enabled) and citation issues.
    pub fn enforce(&self, narrative: &str, facts: &[Fact]) -> (String, Vec<Issue>) {
        let outcome = self.analyze(narrative, facts);
        let text = super::apply_edits(narrative, &outcome.edits);
        (text, outcome.issues)
    }

    /// Full analysis: classified claims, issues and annotation edits.
    pub fn analyze(&self, narrative: &str, facts: &[Fact]) -> LayerOutcome {
        let mut outcome = LayerOutcome::new(Layer::Citation);
        let located = locate_claims(narrative, facts, &self.tolerance, self.identifier_min_digits);

        if located.is_empty() {
            outcome.notes.push(ZERO_CLAIMS_NOTE.to_string());
            tracing::debug!("Citation layer: no numeric claims");
            return outcome;
        }

        let total = located.len();
        let mut verified = 0usize;

        for claim in located {
            let (status, matched) = classify(&claim, facts);
            let number = &claim.number;

            let matched_fact = matched.map(|m| MatchedFact {
                index: m.index,
                metric_id: facts[m.index].metric_id.clone(),
                source_name: facts[m.index].source_name.clone(),
            });

            if let Some(issue) = claim_issue(status, &claim, matched_fact.as_ref()) {
                outcome.issues.push(issue);
                if self.annotate_unverified {
                    outcome
                        .edits
                        .push(NarrativeEdit::annotate(number.span.end, UNVERIFIED_ANNOTATION));
                }
            } else {
                verified += 1;
            }

            outcome.claims.push(NumericClaim {
                raw_text: number.raw.clone(),
                parsed_value: number.value,
                percent: number.percent,
                char_span: number.span,
                matched_fact,
                cited_source: claim.marker.as_ref().map(|m| m.source.clone()),
            });
        }

        let coverage = verified as f64 / total as f64;
        if coverage < self.min_coverage {
            outcome.issues.push(
                Issue::error(
                    Layer::Citation,
                    codes::LOW_CITATION_COVERAGE,
                    format!(
                        "Only {} of {} numeric claims are backed by cited facts ({:.0}% < {:.0}%)",
                        verified,
                        total,
                        coverage * 100.0,
                        self.min_coverage * 100.0
                    ),
                )
                .with_detail("verified", verified)
                .with_detail("total_claims", total)
                .with_detail("coverage", coverage)
                .with_detail("min_coverage", self.min_coverage),
            );
        }

        tracing::debug!(
            total,
            verified,
            coverage,
            issues = outcome.issues.len(),
            "Citation layer complete"
        );

        outcome
    }
}

impl Check for CitationEnforcer {
    fn layer(&self) -> Layer {
        Layer::Citation
    }

    fn run(&self, input: &CheckInput<'_>) -> LayerOutcome {
        self.analyze(input.narrative, input.facts)
    }
}

/// Classify a located claim and pick the fact it reconciles with.
fn classify<'a>(claim: &'a LocatedClaim, facts: &[Fact]) -> (ClaimStatus, Option<&'a FactMatch>) {
    let Some(closest) = claim.matches.first() else {
        return (ClaimStatus::PossibleFabrication, None);
    };

    let Some(marker) = &claim.marker else {
        return (ClaimStatus::MissingCitation, Some(closest));
    };

    match claim
        .matches
        .iter()
        .find(|m| source_matches(&marker.source, &facts[m.index].source_name))
    {
        Some(cited) => (ClaimStatus::Verified, Some(cited)),
        None => (ClaimStatus::CitationNotInData, Some(closest)),
    }
}

fn claim_issue(
    status: ClaimStatus,
    claim: &LocatedClaim,
    matched: Option<&MatchedFact>,
) -> Option<Issue> {
    let number = &claim.number;
    let issue = match status {
        ClaimStatus::Verified => return None,
        ClaimStatus::PossibleFabrication => Issue::error(
            Layer::Citation,
            codes::POSSIBLE_FABRICATION,
            format!(
                "Claim '{}' does not match any supplied fact",
                number.raw
            ),
        ),
        ClaimStatus::MissingCitation => Issue::warning(
            Layer::Citation,
            codes::MISSING_CITATION,
            format!(
                "Claim '{}' matches a fact but carries no citation",
                number.raw
            ),
        ),
        ClaimStatus::CitationNotInData => Issue::warning(
            Layer::Citation,
            codes::CITATION_NOT_IN_DATA,
            format!(
                "Claim '{}' cites '{}', which is not the source of any matching fact",
                number.raw,
                claim.marker.as_ref().map_or("", |m| m.source.as_str())
            ),
        ),
    };

    let mut issue = issue
        .with_detail("raw_text", number.raw.clone())
        .with_detail("parsed_value", number.value)
        .with_detail("span_start", number.span.start)
        .with_detail("span_end", number.span.end)
        .with_evidence(Evidence::from_span(number.raw.clone(), number.span));

    if let Some(marker) = &claim.marker {
        issue = issue
            .with_detail("cited_source", marker.source.clone())
            .with_evidence(Evidence::from_span(marker.source.clone(), marker.span));
    }
    if let Some(fact) = matched {
        issue = issue
            .with_detail("metric_id", fact.metric_id.clone())
            .with_detail("fact_source", fact.source_name.clone())
            .with_evidence(Evidence::from_fact(fact.metric_id.clone(), fact.index));
    }

    Some(issue)
}

/// Claim spans that produced a citation issue, for callers that highlight text.
pub fn flagged_spans(outcome: &LayerOutcome) -> Vec<Span> {
    outcome
        .issues
        .iter()
        .filter_map(|i| {
            let start = i.details.get("span_start")?.as_u64()? as usize;
            let end = i.details.get("span_end")?.as_u64()? as usize;
            Some(Span::new(start, end))
        })
        .collect()
}
