//! Confidence Finalizer
//!
//! Turns the issue list and fact set of a run into a 0-100 trust score.
//!
//! | Factor | Value |
//! |--------|-------|
//! | freshness | fraction of facts collected within the freshness SLA (and not in the future) |
//! | issue_penalty | `1 - min(1, warnings * warning_penalty + errors * error_penalty)` |
//! | sample_adequacy | `min(1, facts / min_facts)` |
//! | stability | caller-supplied hint, clamped to `[0, 1]` |
//!
//! `score = round(100 * sum(weight * factor) / sum(weight))`, clamped to
//! `[0, 100]`. Any error-severity issue caps the score at 39 (Low band).

use chrono::{DateTime, Duration, Utc};

use crate::fact::Fact;
use crate::policy::{ConfidenceSettings, Policy};
use crate::types::{
    ConfidenceBand, ConfidenceFactors, ConfidenceScore, ConfidenceWeights, Issue, IssueCounts,
};

/// Highest score allowed when any error-severity issue exists.
pub const ERROR_SCORE_CAP: u8 = 39;

/// Stability assumed when the caller supplies no hint.
pub const DEFAULT_STABILITY_HINT: f64 = 0.5;

/// Computes confidence scores.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfidenceFinalizer {
    weights: ConfidenceWeights,
    settings: ConfidenceSettings,
    freshness_max_age: Duration,
    now: DateTime<Utc>,
}

impl ConfidenceFinalizer {
    pub fn new(
        weights: ConfidenceWeights,
        settings: ConfidenceSettings,
        freshness_max_age: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            weights,
            settings,
            freshness_max_age,
            now,
        }
    }

    pub fn from_policy(policy: &Policy, now: DateTime<Utc>) -> Self {
        Self::new(
            policy.confidence_weights,
            policy.confidence.clone(),
            policy.freshness_max_age(),
            now,
        )
    }

    /// Score one run.
    pub fn score(&self, issues: &[Issue], facts: &[Fact], stability_hint: f64) -> ConfidenceScore {
        let factors = ConfidenceFactors {
            freshness: self.freshness_factor(facts),
            issue_penalty: self.issue_penalty(issues),
            sample_adequacy: self.sample_adequacy(facts),
            stability: clamp_unit(stability_hint),
        };

        let weights = if self.weights.is_valid() {
            self.weights
        } else {
            ConfidenceWeights::default()
        };

        let weighted = weights.freshness * factors.freshness
            + weights.issue_penalty * factors.issue_penalty
            + weights.sample_adequacy * factors.sample_adequacy
            + weights.stability * factors.stability;
        let raw = (100.0 * weighted / weights.sum()).round().clamp(0.0, 100.0) as u8;

        let has_error = issues.iter().any(Issue::is_error);
        let value = if has_error { raw.min(ERROR_SCORE_CAP) } else { raw };

        ConfidenceScore {
            value,
            band: ConfidenceBand::from_value(value),
            factors,
            weights,
            capped_by_error: has_error && raw > ERROR_SCORE_CAP,
        }
    }

    fn freshness_factor(&self, facts: &[Fact]) -> f64 {
        if facts.is_empty() {
            return 0.0;
        }
        let fresh = facts
            .iter()
            .filter(|f| {
                f.collected_at_utc().map_or(false, |at| {
                    at <= self.now && self.now - at <= self.freshness_max_age
                })
            })
            .count();
        fresh as f64 / facts.len() as f64
    }

    fn issue_penalty(&self, issues: &[Issue]) -> f64 {
        let counts = IssueCounts::tally(issues);
        let penalty = counts.warning as f64 * self.settings.warning_penalty
            + counts.error as f64 * self.settings.error_penalty;
        1.0 - penalty.min(1.0)
    }

    fn sample_adequacy(&self, facts: &[Fact]) -> f64 {
        let minimum = self.settings.min_facts.max(1);
        (facts.len() as f64 / minimum as f64).min(1.0)
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Score with the default weights and settings (free-function form).
pub fn score(
    issues: &[Issue],
    facts: &[Fact],
    stability_hint: f64,
    freshness_max_age: Duration,
    now: DateTime<Utc>,
) -> ConfidenceScore {
    ConfidenceFinalizer::new(
        ConfidenceWeights::default(),
        ConfidenceSettings::default(),
        freshness_max_age,
        now,
    )
    .score(issues, facts, stability_hint)
}
