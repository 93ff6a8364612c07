//! Cross-Source Consistency Checker
//!
//! Compares the same metric as reported by different sources. The checker
//! only reports disagreement; which value to keep is the caller's decision,
//! expressed through the rule's `preferred_source`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::evidence::Evidence;
use crate::fact::{Fact, FactStore};
use crate::matching::relative_difference_pct;
use crate::policy::{CrosscheckRule, Policy};
use crate::types::{codes, Issue, Layer};

use super::{Check, CheckInput, LayerOutcome};

/// One source's value for a metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportedValue {
    pub source_name: String,
    pub value: f64,

    /// Index of the backing fact, when the value came from one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fact_index: Option<usize>,
}

impl ReportedValue {
    pub fn new(source_name: impl Into<String>, value: f64) -> Self {
        Self {
            source_name: source_name.into(),
            value,
            fact_index: None,
        }
    }
}

/// Compare every pair of sources reporting `metric_id`.
///
/// Emits one `XCHK_TOLERANCE_EXCEEDED` warning per pair whose relative
/// difference exceeds `tolerance_pct`. Fewer than two distinct sources is
/// not an error; there is nothing to compare.
pub fn check(
    metric_id: &str,
    reported_values: &[ReportedValue],
    tolerance_pct: f64,
    preferred_source: Option<&str>,
) -> Vec<Issue> {
    let mut issues = Vec::new();

    let distinct_sources = reported_values
        .iter()
        .map(|r| source_key(&r.source_name))
        .collect::<std::collections::BTreeSet<_>>()
        .len();
    if distinct_sources < 2 {
        return issues;
    }

    for (i, a) in reported_values.iter().enumerate() {
        for b in &reported_values[i + 1..] {
            if source_key(&a.source_name) == source_key(&b.source_name) {
                continue;
            }
            if !a.value.is_finite() || !b.value.is_finite() {
                continue;
            }

            let difference = relative_difference_pct(a.value, b.value);
            if difference <= tolerance_pct {
                continue;
            }

            let trusted = preferred_source.map_or("none", |p| p);
            let mut issue = Issue::warning(
                Layer::CrossSource,
                codes::XCHK_TOLERANCE_EXCEEDED,
                format!(
                    "{}: {} reports {} but {} reports {} ({:.2}% apart, tolerance {}%); preferred source: {}",
                    metric_id, a.source_name, a.value, b.source_name, b.value, difference, tolerance_pct, trusted
                ),
            )
            .with_detail("metric_id", metric_id)
            .with_detail("source_a", a.source_name.clone())
            .with_detail("value_a", a.value)
            .with_detail("source_b", b.source_name.clone())
            .with_detail("value_b", b.value)
            .with_detail("difference_pct", difference)
            .with_detail("tolerance_pct", tolerance_pct)
            .with_detail(
                "preferred_source",
                preferred_source.map_or(Value::Null, |p| Value::from(p)),
            );

            if let Some(preferred) = preferred_source {
                if let Some(value) = reported_values
                    .iter()
                    .find(|r| source_key(&r.source_name) == source_key(preferred))
                    .map(|r| r.value)
                {
                    issue = issue.with_detail("preferred_value", value);
                }
            }

            for side in [a, b] {
                if let Some(index) = side.fact_index {
                    issue = issue.with_evidence(Evidence::from_fact(
                        format!("{} = {}", side.source_name, side.value),
                        index,
                    ));
                }
            }

            issues.push(issue);
        }
    }

    issues
}

/// Runs [`check`] over the facts of a request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CrossSourceChecker {
    rules: Vec<CrosscheckRule>,
    default_tolerance_pct: Option<f64>,
}

impl CrossSourceChecker {
    pub fn new(rules: Vec<CrosscheckRule>, default_tolerance_pct: Option<f64>) -> Self {
        Self {
            rules,
            default_tolerance_pct,
        }
    }

    pub fn from_policy(policy: &Policy) -> Self {
        Self::new(
            policy.crosschecks.clone(),
            policy.crosscheck_default_tolerance_pct,
        )
    }

    /// Group facts by metric and compare sources.
    ///
    /// Each source contributes its most recently collected value. Metrics
    /// without a rule use the default tolerance, or are skipped when there is
    /// none. When a metric mixes percentage and ratio facts, percentages are
    /// compared as ratios.
    pub fn check_facts<S: FactStore + ?Sized>(&self, store: &S) -> Vec<Issue> {
        let mut issues = Vec::new();

        for metric_id in store.metrics() {
            let (tolerance_pct, preferred_source) = match self.rule_for(metric_id) {
                Some(rule) => (rule.tolerance_pct, rule.preferred_source.as_deref()),
                None => match self.default_tolerance_pct {
                    Some(tolerance) => (tolerance, None),
                    None => continue,
                },
            };

            let reported = latest_per_source(&store.by_metric(metric_id));
            issues.extend(check(metric_id, &reported, tolerance_pct, preferred_source));
        }

        tracing::debug!(issues = issues.len(), "Cross-source layer complete");
        issues
    }

    fn rule_for(&self, metric_id: &str) -> Option<&CrosscheckRule> {
        self.rules.iter().find(|r| r.metric == metric_id)
    }
}

impl Check for CrossSourceChecker {
    fn layer(&self) -> Layer {
        Layer::CrossSource
    }

    fn run(&self, input: &CheckInput<'_>) -> LayerOutcome {
        LayerOutcome::with_issues(Layer::CrossSource, self.check_facts(input.facts))
    }
}

/// Case-folded source name; two reports are from the same source when keys match.
fn source_key(name: &str) -> String {
    name.to_lowercase()
}

/// One value per source (case-insensitive), the latest by collection time.
///
/// Unparseable timestamps sort before every parseable one; ties go to the
/// later fact. Output is ordered by source name.
fn latest_per_source(facts: &[(usize, &Fact)]) -> Vec<ReportedValue> {
    let mixed_scales = facts.iter().any(|(_, f)| f.is_percent_scaled())
        && facts.iter().any(|(_, f)| !f.is_percent_scaled());

    let mut latest: BTreeMap<String, (usize, &Fact)> = BTreeMap::new();
    for &(index, fact) in facts {
        let key = source_key(&fact.source_name);
        let replace = match latest.get(&key) {
            None => true,
            Some((_, current)) => fact.collected_at_utc() >= current.collected_at_utc(),
        };
        if replace {
            latest.insert(key, (index, fact));
        }
    }

    latest
        .into_values()
        .map(|(index, fact)| {
            let raw = fact.value.as_f64();
            let value = if mixed_scales && fact.is_percent_scaled() {
                raw / 100.0
            } else {
                raw
            };
            ReportedValue {
                source_name: fact.source_name.clone(),
                value,
                fact_index: Some(index),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::{InMemoryFactStore, RawFact};

    fn fact(metric: &str, value: f64, source: &str, at: &str) -> Fact {
        Fact::ingest(RawFact::numeric(metric, value, source, at)).unwrap()
    }

    #[test]
    fn test_single_source_no_issue() {
        let values = vec![ReportedValue::new("PSA", 4.0)];
        assert!(check("unemployment", &values, 5.0, None).is_empty());
    }

    #[test]
    fn test_same_source_twice_no_issue() {
        let values = vec![ReportedValue::new("PSA", 4.0), ReportedValue::new("psa", 9.0)];
        assert!(check("unemployment", &values, 5.0, None).is_empty());
    }

    #[test]
    fn test_non_ascii_source_case_is_one_source() {
        let values = vec![
            ReportedValue::new("ÉTAT", 100.0),
            ReportedValue::new("état", 50.0),
            ReportedValue::new("ILO", 100.0),
        ];
        let issues = check("employment", &values, 5.0, None);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].details["source_a"], "état");
        assert_eq!(issues[0].details["source_b"], "ILO");
    }

    #[test]
    fn test_within_tolerance() {
        let values = vec![ReportedValue::new("PSA", 100.0), ReportedValue::new("ILO", 96.0)];
        assert!(check("employment", &values, 5.0, None).is_empty());
    }

    #[test]
    fn test_exceeds_tolerance() {
        let values = vec![ReportedValue::new("PSA", 100.0), ReportedValue::new("ILO", 90.0)];
        let issues = check("employment", &values, 5.0, Some("PSA"));
        assert_eq!(issues.len(), 1);
        let issue = &issues[0];
        assert_eq!(issue.code, codes::XCHK_TOLERANCE_EXCEEDED);
        assert_eq!(issue.details["source_a"], "PSA");
        assert_eq!(issue.details["source_b"], "ILO");
        assert_eq!(issue.details["difference_pct"], 10.0);
        assert_eq!(issue.details["preferred_source"], "PSA");
        assert_eq!(issue.details["preferred_value"], 100.0);
        assert!(!issue.is_error());
    }

    #[test]
    fn test_pairwise_across_three_sources() {
        let values = vec![
            ReportedValue::new("A", 100.0),
            ReportedValue::new("B", 100.0),
            ReportedValue::new("C", 50.0),
        ];
        let issues = check("m", &values, 5.0, None);
        assert_eq!(issues.len(), 2);
        assert!(issues.iter().all(|i| i.details["preferred_source"].is_null()));
    }

    #[test]
    fn test_check_facts_uses_rule_and_latest_value() {
        let store = InMemoryFactStore::new(vec![
            fact("unemployment", 9.0, "ILO", "2023-01-01"),
            fact("unemployment", 4.0, "ILO", "2024-04-01"),
            fact("unemployment", 4.1, "PSA", "2024-04-01"),
        ]);
        let checker = CrossSourceChecker::new(
            vec![CrosscheckRule {
                metric: "unemployment".to_string(),
                tolerance_pct: 5.0,
                preferred_source: Some("PSA".to_string()),
            }],
            None,
        );
        // latest ILO value 4.0 vs PSA 4.1 is 2.4% apart
        assert!(checker.check_facts(&store).is_empty());
    }

    #[test]
    fn test_check_facts_reports_with_evidence() {
        let store = InMemoryFactStore::new(vec![
            fact("unemployment", 4.0, "ILO", "2024-04-01"),
            fact("unemployment", 6.0, "PSA", "2024-04-01"),
        ]);
        let checker = CrossSourceChecker::new(Vec::new(), Some(10.0));
        let issues = checker.check_facts(&store);
        assert_eq!(issues.len(), 1);
        let pointers: Vec<&str> = issues[0].evidence.iter().map(|e| e.pointer.as_str()).collect();
        assert_eq!(pointers, vec!["facts[0]", "facts[1]"]);
    }

    #[test]
    fn test_unconfigured_metric_skipped() {
        let store = InMemoryFactStore::new(vec![
            fact("unemployment", 4.0, "ILO", "2024-04-01"),
            fact("unemployment", 60.0, "PSA", "2024-04-01"),
        ]);
        assert!(CrossSourceChecker::default().check_facts(&store).is_empty());
    }

    #[test]
    fn test_mixed_percent_and_ratio() {
        let store = InMemoryFactStore::new(vec![
            Fact::ingest(RawFact::numeric("participation", 88.0, "PSA", "2024-04-01").with_unit("%"))
                .unwrap(),
            fact("participation", 0.88, "ILO", "2024-04-01"),
        ]);
        let checker = CrossSourceChecker::new(Vec::new(), Some(1.0));
        assert!(checker.check_facts(&store).is_empty());
    }
}
