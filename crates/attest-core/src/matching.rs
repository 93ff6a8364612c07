//! Fuzzy matching shared by the layers.
//!
//! Two questions come up repeatedly: "is this claimed number the same as that
//! fact value?" and "does this citation name the same source as that fact?".
//! Both are answered here so every layer answers them identically.

use crate::fact::Fact;
use crate::numbers::ScannedNumber;

/// Numeric tolerance: `|claim - fact| <= max(abs_epsilon, rel_epsilon * |fact|)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    pub abs_epsilon: f64,
    pub rel_epsilon: f64,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            abs_epsilon: 0.5,
            rel_epsilon: 0.01,
        }
    }
}

impl Tolerance {
    pub fn new(abs_epsilon: f64, rel_epsilon: f64) -> Self {
        Self {
            abs_epsilon,
            rel_epsilon,
        }
    }

    /// Allowed deviation around a fact value.
    pub fn allowance(&self, fact_value: f64) -> f64 {
        self.abs_epsilon.max(self.rel_epsilon * fact_value.abs())
    }

    pub fn accepts(&self, claim: f64, fact_value: f64) -> bool {
        self.accepts_at_scale(claim, fact_value, 1.0)
    }

    /// Like [`accepts`](Self::accepts), with the absolute floor expressed in
    /// units `scale` times the written ones (0.01 after a percent-to-ratio
    /// conversion).
    pub fn accepts_at_scale(&self, claim: f64, fact_value: f64, scale: f64) -> bool {
        if !claim.is_finite() || !fact_value.is_finite() {
            return false;
        }
        let allowance = (self.abs_epsilon * scale).max(self.rel_epsilon * fact_value.abs());
        (claim - fact_value).abs() <= allowance
    }
}

/// A fact that a claim reconciles with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FactMatch {
    pub index: usize,

    /// Absolute difference between the closest candidate and the fact value
    pub distance: f64,
}

/// All facts whose value a scanned claim reconciles with, closest first.
///
/// The claim is tried as written, as its mantissa when a scale word was
/// used, and as a ratio when written as a percentage. Percentage facts are
/// also tried as ratios, so a narrative `10%` reconciles with a fact stored
/// as `0.10` and vice versa. Converted comparisons shrink the absolute floor
/// by the same factor, so `7.5%` does not reconcile with `0.10`.
pub fn matching_facts(claim: &ScannedNumber, facts: &[Fact], tolerance: &Tolerance) -> Vec<FactMatch> {
    let mut candidates = vec![(claim.value, 1.0)];
    if claim.scale.is_some() {
        candidates.push((claim.mantissa, 1.0));
    }
    if claim.percent {
        candidates.push((claim.value / 100.0, PERCENT_SCALE));
    }

    let mut matches: Vec<FactMatch> = facts
        .iter()
        .enumerate()
        .filter_map(|(index, fact)| {
            let fact_value = fact.value.as_f64();
            let mut targets = vec![(fact_value, 1.0)];
            if fact.is_percent_scaled() {
                targets.push((fact_value / 100.0, PERCENT_SCALE));
            }

            candidates
                .iter()
                .flat_map(|c| targets.iter().map(move |t| (*c, *t)))
                // both converted is the same comparison as neither
                .filter(|((_, cs), (_, ts))| *cs == 1.0 || *ts == 1.0)
                .filter(|((c, cs), (t, ts))| tolerance.accepts_at_scale(*c, *t, cs.min(*ts)))
                .map(|((c, _), (t, _))| (c - t).abs())
                .min_by(|a, b| a.total_cmp(b))
                .map(|distance| FactMatch { index, distance })
        })
        .collect();

    matches.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.index.cmp(&b.index)));
    matches
}

const PERCENT_SCALE: f64 = 0.01;

/// Ratio at or above which two normalized source names are considered the same.
pub const SOURCE_SIMILARITY_THRESHOLD: f64 = 0.8;

/// Whether a cited source name refers to a fact's source.
///
/// Names are normalized (lowercase, punctuation stripped, whitespace
/// collapsed). They match when one contains the other (both at least three
/// characters, so `"a"` cannot match everything), or when the Levenshtein
/// ratio of the whole citation, or of its leading tokens, reaches
/// [`SOURCE_SIMILARITY_THRESHOLD`].
pub fn source_matches(cited: &str, source_name: &str) -> bool {
    let cited = normalize_source(cited);
    let source = normalize_source(source_name);
    if cited.is_empty() || source.is_empty() {
        return false;
    }
    if cited == source {
        return true;
    }

    let compact_cited = cited.replace(' ', "");
    let compact_source = source.replace(' ', "");
    if compact_cited.len() >= 3
        && compact_source.len() >= 3
        && (compact_cited.contains(&compact_source) || compact_source.contains(&compact_cited))
    {
        return true;
    }

    if similarity(&cited, &source) >= SOURCE_SIMILARITY_THRESHOLD {
        return true;
    }

    // "GCC STAT Q1 2024" vs "GCCSTAT": compare the leading tokens of the
    // citation that together are as long as the source name
    let source_width = source.split(' ').count();
    let cited_tokens: Vec<&str> = cited.split(' ').collect();
    for width in 1..=cited_tokens.len().min(source_width + 1) {
        let prefix = cited_tokens[..width].join(" ");
        if similarity(&prefix, &source) >= SOURCE_SIMILARITY_THRESHOLD {
            return true;
        }
    }

    false
}

/// Lowercase, map punctuation to spaces, collapse whitespace.
pub fn normalize_source(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Levenshtein similarity ratio in `[0, 1]`.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(&a, &b) as f64 / longest as f64
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[b.len()]
}

/// Relative difference in percent: `|a - b| / max(|a|, |b|) * 100`.
///
/// Two zeros are identical (0%).
pub fn relative_difference_pct(a: f64, b: f64) -> f64 {
    let denominator = a.abs().max(b.abs());
    if denominator == 0.0 {
        return 0.0;
    }
    (a - b).abs() / denominator * 100.0
}
