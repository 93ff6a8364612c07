//! Sanity Validator
//!
//! Range, rate and freshness rules over facts, and the same range rules over
//! narrative claims that reconcile with a fact.
//!
//! "Now" is always supplied by the caller. The validator never reads a
//! clock, so a run can be replayed exactly.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;

use crate::evidence::Evidence;
use crate::fact::Fact;
use crate::matching::Tolerance;
use crate::policy::{Policy, SanityRule};
use crate::types::{codes, Issue, Layer, Severity};

use super::citation::locate_claims;
use super::{Check, CheckInput, LayerOutcome};

/// Checks facts and claims against range rules and a freshness SLA.
#[derive(Debug, Clone, PartialEq)]
pub struct SanityValidator {
    rules: Vec<SanityRule>,
    freshness_max_age: Duration,
    tolerance: Tolerance,
    identifier_min_digits: Option<usize>,
}

impl SanityValidator {
    pub fn new(rules: Vec<SanityRule>, freshness_max_age: Duration) -> Self {
        Self {
            rules,
            freshness_max_age,
            tolerance: Tolerance::default(),
            identifier_min_digits: None,
        }
    }

    pub fn from_policy(policy: &Policy) -> Self {
        Self {
            rules: policy.sanity.clone(),
            freshness_max_age: policy.freshness_max_age(),
            tolerance: Tolerance::new(policy.citation.abs_epsilon, policy.citation.rel_epsilon),
            identifier_min_digits: policy.privacy.redact_ids_min_digits,
        }
    }

    /// Range rules and freshness over facts.
    pub fn validate(&self, facts: &[Fact], now: DateTime<Utc>) -> Vec<Issue> {
        let mut issues = Vec::new();

        for (index, fact) in facts.iter().enumerate() {
            let value = fact.value.as_f64();
            for (rule_index, rule) in self.rules_for(&fact.metric_id) {
                for violation in violations(rule, value, fact.is_percent_scaled()) {
                    issues.push(
                        violation
                            .into_issue(&fact.metric_id, value, rule, rule_index)
                            .with_detail("source_name", fact.source_name.clone())
                            .with_evidence(Evidence::from_fact(
                                format!("{} = {}", fact.metric_id, value),
                                index,
                            )),
                    );
                }
            }

            if let Some(issue) = self.freshness(index, fact, now) {
                issues.push(issue);
            }
        }

        issues
    }

    /// Range rules over narrative claims.
    ///
    /// A claim is checked under the metric of the fact it reconciles with.
    /// Violations already reported for that metric and code at fact level are
    /// not repeated.
    pub fn validate_claims(&self, narrative: &str, facts: &[Fact], fact_issues: &[Issue]) -> Vec<Issue> {
        let mut reported: BTreeSet<(String, String)> = fact_issues
            .iter()
            .filter_map(|i| {
                let metric = i.details.get("metric_id")?.as_str()?;
                Some((metric.to_string(), i.code.clone()))
            })
            .collect();

        let mut issues = Vec::new();

        for claim in locate_claims(narrative, facts, &self.tolerance, self.identifier_min_digits) {
            let Some(matched) = claim.matches.first() else {
                continue;
            };
            let metric_id = &facts[matched.index].metric_id;
            let value = claim.number.value;

            for (rule_index, rule) in self.rules_for(metric_id) {
                for violation in violations(rule, value, claim.number.percent) {
                    if !reported.insert((metric_id.clone(), violation.code().to_string())) {
                        continue;
                    }
                    issues.push(
                        violation
                            .into_issue(metric_id, value, rule, rule_index)
                            .with_detail("raw_text", claim.number.raw.clone())
                            .with_evidence(Evidence::from_span(
                                claim.number.raw.clone(),
                                claim.number.span,
                            )),
                    );
                }
            }
        }

        issues
    }

    fn rules_for<'a>(&'a self, metric_id: &'a str) -> impl Iterator<Item = (usize, &'a SanityRule)> + 'a {
        self.rules
            .iter()
            .enumerate()
            .filter(move |(_, r)| r.applies_to(metric_id))
    }

    fn freshness(&self, index: usize, fact: &Fact, now: DateTime<Utc>) -> Option<Issue> {
        let Some(collected_at) = fact.collected_at_utc() else {
            return Some(
                Issue::warning(
                    Layer::Sanity,
                    codes::FRESHNESS_PARSE_ERROR,
                    format!(
                        "Fact '{}' from {} has an unparseable timestamp '{}'",
                        fact.metric_id, fact.source_name, fact.collected_at
                    ),
                )
                .with_detail("metric_id", fact.metric_id.clone())
                .with_detail("collected_at", fact.collected_at.clone())
                .with_evidence(Evidence::from_fact("collected_at", index)),
            );
        };

        if collected_at > now {
            return Some(
                Issue::warning(
                    Layer::Sanity,
                    codes::FUTURE_TIMESTAMP,
                    format!(
                        "Fact '{}' from {} was collected after the reference time",
                        fact.metric_id, fact.source_name
                    ),
                )
                .with_detail("metric_id", fact.metric_id.clone())
                .with_detail("collected_at", collected_at.to_rfc3339())
                .with_detail("now", now.to_rfc3339())
                .with_evidence(Evidence::from_fact("collected_at", index)),
            );
        }

        let age = now - collected_at;
        if age > self.freshness_max_age {
            let age_hours = age.num_seconds() as f64 / 3600.0;
            let max_hours = self.freshness_max_age.num_seconds() as f64 / 3600.0;
            return Some(
                Issue::warning(
                    Layer::Sanity,
                    codes::STALE_DATA,
                    format!(
                        "Fact '{}' from {} is {:.1}h old (limit {:.1}h)",
                        fact.metric_id, fact.source_name, age_hours, max_hours
                    ),
                )
                .with_detail("metric_id", fact.metric_id.clone())
                .with_detail("age_hours", age_hours)
                .with_detail("freshness_max_hours", max_hours)
                .with_evidence(Evidence::from_fact("collected_at", index)),
            );
        }

        None
    }
}

impl Check for SanityValidator {
    fn layer(&self) -> Layer {
        Layer::Sanity
    }

    fn run(&self, input: &CheckInput<'_>) -> LayerOutcome {
        let mut issues = self.validate(input.facts, input.now);
        let claim_issues = self.validate_claims(input.narrative, input.facts, &issues);
        issues.extend(claim_issues);

        tracing::debug!(issues = issues.len(), "Sanity layer complete");
        LayerOutcome::with_issues(Layer::Sanity, issues)
    }
}

/// Validate facts against rules (free-function form).
pub fn validate(
    facts: &[Fact],
    rules: &[SanityRule],
    freshness_max_age: Duration,
    now: DateTime<Utc>,
) -> Vec<Issue> {
    SanityValidator::new(rules.to_vec(), freshness_max_age).validate(facts, now)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Violation {
    RateOutOfRange { upper: f64 },
    Negative,
    BelowMin(f64),
    AboveMax(f64),
}

impl Violation {
    fn code(&self) -> &'static str {
        match self {
            Violation::RateOutOfRange { .. } => codes::RATE_OUT_OF_RANGE,
            Violation::Negative => codes::NEGATIVE_VALUE,
            Violation::BelowMin(_) => codes::BELOW_MIN,
            Violation::AboveMax(_) => codes::ABOVE_MAX,
        }
    }

    fn into_issue(self, metric_id: &str, value: f64, rule: &SanityRule, rule_index: usize) -> Issue {
        let severity = if rule.critical {
            Severity::Error
        } else {
            Severity::Warning
        };
        let message = match self {
            Violation::RateOutOfRange { upper } => {
                format!("{} = {} is outside the rate range [0, {}]", metric_id, value, upper)
            }
            Violation::Negative => format!("{} = {} must not be negative", metric_id, value),
            Violation::BelowMin(min) => format!("{} = {} is below the minimum {}", metric_id, value, min),
            Violation::AboveMax(max) => format!("{} = {} is above the maximum {}", metric_id, value, max),
        };

        let mut issue = Issue::new(Layer::Sanity, self.code(), severity, message)
            .with_detail("metric_id", metric_id)
            .with_detail("value", value)
            .with_detail("rule", rule.metric.clone())
            .with_detail("critical", rule.critical)
            .with_evidence(Evidence::from_policy(
                rule.metric.clone(),
                format!("policy.sanity[{}]", rule_index),
            ));

        match self {
            Violation::RateOutOfRange { upper } => issue = issue.with_detail("upper_bound", upper),
            Violation::BelowMin(min) => issue = issue.with_detail("min_value", min),
            Violation::AboveMax(max) => issue = issue.with_detail("max_value", max),
            Violation::Negative => {}
        }
        issue
    }
}

/// Rule violations for one value. `percent_scale` selects `[0, 100]` for rates.
fn violations(rule: &SanityRule, value: f64, percent_scale: bool) -> Vec<Violation> {
    let mut found = Vec::new();

    if rule.rate_0_1 {
        let upper = if percent_scale { 100.0 } else { 1.0 };
        if !(0.0..=upper).contains(&value) {
            found.push(Violation::RateOutOfRange { upper });
        }
    }
    if rule.must_be_non_negative && value < 0.0 {
        found.push(Violation::Negative);
    }
    if let Some(min) = rule.min_value {
        if value < min {
            found.push(Violation::BelowMin(min));
        }
    }
    if let Some(max) = rule.max_value {
        if value > max {
            found.push(Violation::AboveMax(max));
        }
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::RawFact;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 10, 0, 0, 0).unwrap()
    }

    fn fact(metric: &str, value: f64, at: &str) -> Fact {
        Fact::ingest(RawFact::numeric(metric, value, "PSA", at)).unwrap()
    }

    fn rate_rule(metric: &str) -> SanityRule {
        SanityRule {
            metric: metric.to_string(),
            rate_0_1: true,
            must_be_non_negative: false,
            min_value: None,
            max_value: None,
            critical: false,
        }
    }

    fn validator(rules: Vec<SanityRule>) -> SanityValidator {
        SanityValidator::new(rules, Duration::hours(168))
    }

    #[test]
    fn test_rate_out_of_range() {
        let issues = validator(vec![rate_rule("participation")])
            .validate(&[fact("participation", 1.5, "2024-04-09")], now());
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, codes::RATE_OUT_OF_RANGE);
        assert_eq!(issues[0].severity, Severity::Warning);
    }

    #[test]
    fn test_rate_in_range() {
        let issues = validator(vec![rate_rule("participation")])
            .validate(&[fact("participation", 0.73, "2024-04-09")], now());
        assert!(issues.is_empty());
    }

    #[test]
    fn test_rate_percent_scale() {
        let facts = vec![Fact::ingest(
            RawFact::numeric("participation", 73.0, "PSA", "2024-04-09").with_unit("%"),
        )
        .unwrap()];
        assert!(validator(vec![rate_rule("participation")])
            .validate(&facts, now())
            .is_empty());
    }

    #[test]
    fn test_critical_rule_is_error() {
        let rule = SanityRule {
            metric: "wage_*".to_string(),
            rate_0_1: false,
            must_be_non_negative: true,
            min_value: None,
            max_value: None,
            critical: true,
        };
        let issues = validator(vec![rule]).validate(&[fact("wage_median", -10.0, "2024-04-09")], now());
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, codes::NEGATIVE_VALUE);
        assert!(issues[0].is_error());
        assert_eq!(issues[0].evidence[0].pointer, "policy.sanity[0]");
        assert_eq!(issues[0].evidence[1].pointer, "facts[0]");
    }

    #[test]
    fn test_bounds() {
        let rule = SanityRule {
            metric: "hours".to_string(),
            rate_0_1: false,
            must_be_non_negative: false,
            min_value: Some(10.0),
            max_value: Some(80.0),
            critical: false,
        };
        let v = validator(vec![rule]);
        let low = v.validate(&[fact("hours", 5.0, "2024-04-09")], now());
        assert_eq!(low[0].code, codes::BELOW_MIN);
        let high = v.validate(&[fact("hours", 90.0, "2024-04-09")], now());
        assert_eq!(high[0].code, codes::ABOVE_MAX);
        assert!(v.validate(&[fact("hours", 40.0, "2024-04-09")], now()).is_empty());
    }

    #[test]
    fn test_stale_data() {
        let issues = validator(Vec::new()).validate(&[fact("m", 1.0, "2024-03-01")], now());
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, codes::STALE_DATA);
        assert!(issues[0].details["age_hours"].as_f64().unwrap() > 168.0);
    }

    #[test]
    fn test_freshness_parse_error_does_not_abort() {
        let facts = vec![fact("m", 1.0, "last tuesday"), fact("m", 1.5, "2024-04-09")];
        let issues = validator(vec![rate_rule("m")]).validate(&facts, now());
        let found: Vec<&str> = issues.iter().map(|i| i.code.as_str()).collect();
        assert_eq!(found, vec![codes::FRESHNESS_PARSE_ERROR, codes::RATE_OUT_OF_RANGE]);
    }

    #[test]
    fn test_future_timestamp() {
        let issues = validator(Vec::new()).validate(&[fact("m", 1.0, "2024-05-01")], now());
        assert_eq!(issues[0].code, codes::FUTURE_TIMESTAMP);
    }

    #[test]
    fn test_claims_checked_and_deduplicated() {
        let facts = vec![fact("participation", 0.73, "2024-04-09")];
        let v = validator(vec![rate_rule("participation")]);
        // "73%" reconciles with 0.73 and is within [0, 100]
        assert!(v.validate_claims("Participation was 73%.", &facts, &[]).is_empty());

        let facts = vec![fact("participation", 1.5, "2024-04-09")];
        let fact_issues = v.validate(&facts, now());
        assert_eq!(fact_issues.len(), 1);
        // same metric and code already reported at fact level
        assert!(v
            .validate_claims("Participation was 1.5 overall.", &facts, &fact_issues)
            .is_empty());
        // without the fact-level issue the claim is reported
        let claim_issues = v.validate_claims("Participation was 1.5 overall.", &facts, &[]);
        assert_eq!(claim_issues.len(), 1);
        assert_eq!(claim_issues[0].details["raw_text"], "1.5");
    }

    #[test]
    fn test_free_function_form() {
        let issues = validate(
            &[fact("participation", 1.5, "2024-04-09")],
            &[rate_rule("participation")],
            Duration::hours(168),
            now(),
        );
        assert_eq!(issues[0].code, codes::RATE_OUT_OF_RANGE);
    }
}
