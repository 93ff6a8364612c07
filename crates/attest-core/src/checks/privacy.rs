//! Privacy Redactor
//!
//! Redacts personal data from the narrative and enforces a minimum group
//! size for disclosed statistics.
//!
//! Pattern classes (each can be switched off by policy):
//! - email addresses, replaced with `[REDACTED:EMAIL]`
//! - digit runs of at least `redact_ids_min_digits`, replaced with `[REDACTED:ID]`
//! - names after an honorific or a name label, replaced with `[REDACTED:NAME]`
//!
//! Name detection is a heuristic. It catches common written forms and is
//! not a compliance boundary: a name written without an honorific or label
//! passes through.
//!
//! Redactions are expected behaviour and are reported at info severity. A
//! group smaller than `k_anonymity` is an error.

use crate::evidence::Evidence;
use crate::fact::Fact;
use crate::policy::{Policy, PrivacyPolicy};
use crate::types::{codes, Issue, Layer, Span};

use super::patterns::{
    identifier_spans, placeholder_spans, EMAIL_PATTERN, GROUP_SIZE, HONORIFIC_NAME,
    LABELLED_NAME,
};
use super::{apply_edits, Check, CheckInput, LayerOutcome, NarrativeEdit};

pub const EMAIL_PLACEHOLDER: &str = "[REDACTED:EMAIL]";
pub const ID_PLACEHOLDER: &str = "[REDACTED:ID]";
pub const NAME_PLACEHOLDER: &str = "[REDACTED:NAME]";

/// A class of personal data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PiiKind {
    Email,
    Identifier,
    Name,
}

impl PiiKind {
    fn placeholder(self) -> &'static str {
        match self {
            PiiKind::Email => EMAIL_PLACEHOLDER,
            PiiKind::Identifier => ID_PLACEHOLDER,
            PiiKind::Name => NAME_PLACEHOLDER,
        }
    }

    fn code(self) -> &'static str {
        match self {
            PiiKind::Email => codes::EMAIL_REDACTED,
            PiiKind::Identifier => codes::ID_REDACTED,
            PiiKind::Name => codes::NAME_REDACTED,
        }
    }

    fn label(self) -> &'static str {
        match self {
            PiiKind::Email => "email address",
            PiiKind::Identifier => "numeric identifier",
            PiiKind::Name => "personal name",
        }
    }
}

/// Redacts personal data and enforces k-anonymity.
#[derive(Debug, Clone, PartialEq)]
pub struct PrivacyRedactor {
    policy: PrivacyPolicy,
}

impl Default for PrivacyRedactor {
    fn default() -> Self {
        Self::new(PrivacyPolicy::default())
    }
}

impl PrivacyRedactor {
    pub fn new(policy: PrivacyPolicy) -> Self {
        Self { policy }
    }

    pub fn from_policy(policy: &Policy) -> Self {
        Self::new(policy.privacy.clone())
    }

    /// Redact a text for a caller holding `role_set`.
    ///
    /// Returns the redacted text and the privacy issues found in it.
    pub fn redact(
        &self,
        text: &str,
        role_set: &[String],
        k_anonymity_min: u64,
    ) -> (String, Vec<Issue>) {
        let outcome = self.scan_text(text, role_set, k_anonymity_min);
        (apply_edits(text, &outcome.edits), outcome.issues)
    }

    /// Find redactions and group-size violations in a text.
    pub fn scan_text(&self, text: &str, role_set: &[String], k_anonymity_min: u64) -> LayerOutcome {
        let mut outcome = LayerOutcome::new(Layer::Privacy);
        let mut taken: Vec<Span> = placeholder_spans(text);
        let mut found: Vec<(PiiKind, Span)> = Vec::new();

        if self.policy.redact_email {
            for m in EMAIL_PATTERN.find_iter(text) {
                claim_span(&mut taken, &mut found, PiiKind::Email, Span::new(m.start(), m.end()));
            }
        }

        if let Some(min_digits) = self.policy.redact_ids_min_digits {
            for span in identifier_spans(text, min_digits) {
                claim_span(&mut taken, &mut found, PiiKind::Identifier, span);
            }
        }

        let names = detect_names(text, &taken);
        let names_exempt = self.policy.names_allowed_for(role_set);
        if self.policy.redact_names && !names.is_empty() {
            if names_exempt {
                let matched_roles: Vec<&String> = role_set
                    .iter()
                    .filter(|r| self.policy.allow_names_when_role.contains(r))
                    .collect();
                outcome.issues.push(
                    Issue::info(
                        Layer::Privacy,
                        codes::NAME_REDACTION_EXEMPT,
                        format!(
                            "Name redaction skipped for {} name(s): caller role exemption",
                            names.len()
                        ),
                    )
                    .with_detail("names_detected", names.len())
                    .with_detail(
                        "roles",
                        matched_roles
                            .iter()
                            .map(|r| serde_json::Value::from(r.as_str()))
                            .collect::<Vec<_>>(),
                    ),
                );
            } else {
                for span in names {
                    claim_span(&mut taken, &mut found, PiiKind::Name, span);
                }
            }
        }

        found.sort_by_key(|(_, span)| *span);
        for (kind, span) in found {
            outcome.issues.push(
                Issue::info(
                    Layer::Privacy,
                    kind.code(),
                    format!("Redacted {} at {}..{}", kind.label(), span.start, span.end),
                )
                .with_detail("span_start", span.start)
                .with_detail("span_end", span.end)
                .with_detail("placeholder", kind.placeholder())
                .with_evidence(Evidence::from_span(kind.label(), span)),
            );
            outcome
                .edits
                .push(NarrativeEdit::redact(span, kind.placeholder()));
        }

        outcome
            .issues
            .extend(group_size_violations(text, k_anonymity_min));

        outcome
    }

    /// Issues for facts: k-anonymity on `group_size` and personal data in
    /// fact text. Facts are immutable, so personal data in them is reported
    /// rather than redacted.
    pub fn check_facts(&self, facts: &[Fact], k_anonymity_min: u64) -> Vec<Issue> {
        let mut issues = Vec::new();

        for (index, fact) in facts.iter().enumerate() {
            if let Some(size) = fact.group_size {
                if k_anonymity_min > 0 && size < k_anonymity_min {
                    issues.push(
                        Issue::error(
                            Layer::Privacy,
                            codes::K_ANONYMITY_VIOLATION,
                            format!(
                                "Fact '{}' from {} aggregates {} individual(s), below the minimum of {}",
                                fact.metric_id, fact.source_name, size, k_anonymity_min
                            ),
                        )
                        .with_detail("metric_id", fact.metric_id.clone())
                        .with_detail("group_size", size)
                        .with_detail("k_anonymity_min", k_anonymity_min)
                        .with_evidence(Evidence::from_fact("group_size", index)),
                    );
                }
            }

            for (field, value) in fact.payload_text() {
                // Locators are opaque provenance pointers and routinely carry long query ids
                let id_found = field != "locator"
                    && self
                        .policy
                        .redact_ids_min_digits
                        .map_or(false, |min| !identifier_spans(value, min).is_empty());
                let email_found = self.policy.redact_email && EMAIL_PATTERN.is_match(value);

                if email_found || id_found {
                    let kind = if email_found { "email address" } else { "numeric identifier" };
                    issues.push(
                        Issue::warning(
                            Layer::Privacy,
                            codes::PII_IN_FACT,
                            format!(
                                "Fact '{}' field '{}' contains a possible {}",
                                fact.metric_id, field, kind
                            ),
                        )
                        .with_detail("metric_id", fact.metric_id.clone())
                        .with_detail("field", field)
                        .with_detail("kind", kind)
                        .with_evidence(Evidence::from_fact(field, index)),
                    );
                }
            }
        }

        issues
    }
}

impl Check for PrivacyRedactor {
    fn layer(&self) -> Layer {
        Layer::Privacy
    }

    fn run(&self, input: &CheckInput<'_>) -> LayerOutcome {
        let k = self.policy.k_anonymity;
        let mut outcome = self.scan_text(input.narrative, input.roles, k);
        outcome.issues.extend(self.check_facts(input.facts, k));

        tracing::debug!(
            redactions = outcome.redactions(),
            issues = outcome.issues.len(),
            "Privacy layer complete"
        );
        outcome
    }
}

/// Record a detection unless it overlaps one already taken.
fn claim_span(taken: &mut Vec<Span>, found: &mut Vec<(PiiKind, Span)>, kind: PiiKind, span: Span) {
    if taken.iter().any(|t| t.overlaps(&span)) {
        return;
    }
    taken.push(span);
    found.push((kind, span));
}

fn detect_names(text: &str, taken: &[Span]) -> Vec<Span> {
    let mut spans: Vec<Span> = HONORIFIC_NAME
        .captures_iter(text)
        .chain(LABELLED_NAME.captures_iter(text))
        .filter_map(|caps| caps.name("name"))
        .map(|m| Span::new(m.start(), m.end()))
        .filter(|span| !taken.iter().any(|t| t.overlaps(span)))
        .collect();
    spans.sort();
    spans.dedup();
    spans
}

fn group_size_violations(text: &str, k_anonymity_min: u64) -> Vec<Issue> {
    if k_anonymity_min == 0 {
        return Vec::new();
    }

    let bytes = text.as_bytes();
    GROUP_SIZE
        .captures_iter(text)
        .filter_map(|caps| {
            let number = caps.name("n").or_else(|| caps.name("count"))?;
            // "0.5 workers" or "1,5 workers" is not a head count
            if number.start() > 0 && matches!(bytes[number.start() - 1], b'.' | b',') {
                return None;
            }
            let size: u64 = number.as_str().replace(',', "").parse().ok()?;
            let whole = caps.get(0)?;
            Some((size, Span::new(whole.start(), whole.end())))
        })
        .filter(|(size, _)| *size < k_anonymity_min)
        .map(|(size, span)| {
            Issue::error(
                Layer::Privacy,
                codes::K_ANONYMITY_VIOLATION,
                format!(
                    "Statistic disclosed for a group of {} individual(s), below the minimum of {}",
                    size, k_anonymity_min
                ),
            )
            .with_detail("group_size", size)
            .with_detail("k_anonymity_min", k_anonymity_min)
            .with_detail("span_start", span.start)
            .with_detail("span_end", span.end)
            .with_evidence(Evidence::from_span(&text[span.start..span.end], span))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::RawFact;
    use crate::types::Severity;

    fn redactor() -> PrivacyRedactor {
        PrivacyRedactor::default()
    }

    fn no_roles() -> Vec<String> {
        Vec::new()
    }

    #[test]
    fn test_email_redacted() {
        let (text, issues) = redactor().redact("contact: jane.doe@example.com", &no_roles(), 15);
        assert_eq!(text, "contact: [REDACTED:EMAIL]");
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, codes::EMAIL_REDACTED);
        assert_eq!(issues[0].severity, Severity::Info);
    }

    #[test]
    fn test_redaction_is_idempotent() {
        let (once, _) = redactor().redact("contact: jane.doe@example.com", &no_roles(), 15);
        let (twice, issues) = redactor().redact(&once, &no_roles(), 15);
        assert_eq!(once, twice);
        assert!(issues.is_empty());
    }

    #[test]
    fn test_email_redaction_disabled() {
        let policy = PrivacyPolicy {
            redact_email: false,
            ..Default::default()
        };
        let (text, issues) =
            PrivacyRedactor::new(policy).redact("mail a.b@example.org", &no_roles(), 0);
        assert_eq!(text, "mail a.b@example.org");
        assert!(issues.is_empty());
    }

    #[test]
    fn test_long_identifier_redacted() {
        let (text, issues) = redactor().redact("QID 27401234567 applied", &no_roles(), 0);
        assert_eq!(text, "QID [REDACTED:ID] applied");
        assert_eq!(issues[0].code, codes::ID_REDACTED);
    }

    #[test]
    fn test_short_numbers_and_grouped_values_kept() {
        let (text, issues) =
            redactor().redact("2,145,000 workers across 1234567 sites", &no_roles(), 0);
        assert_eq!(text, "2,145,000 workers across 1234567 sites");
        assert!(issues.is_empty());
    }

    #[test]
    fn test_id_redaction_disabled() {
        let policy = PrivacyPolicy {
            redact_ids_min_digits: None,
            ..Default::default()
        };
        let (text, _) = PrivacyRedactor::new(policy).redact("QID 27401234567", &no_roles(), 0);
        assert_eq!(text, "QID 27401234567");
    }

    #[test]
    fn test_digits_inside_email_redacted_once() {
        let (text, issues) = redactor().redact("write 12345678901@example.com", &no_roles(), 0);
        assert_eq!(text, "write [REDACTED:EMAIL]");
        assert_eq!(issues.len(), 1);
    }

    #[test]
    fn test_names_redacted() {
        let (text, issues) =
            redactor().redact("Interview with Dr. Fatima Al-Kuwari on hiring.", &no_roles(), 0);
        assert_eq!(text, "Interview with Dr. [REDACTED:NAME] on hiring.");
        assert_eq!(issues[0].code, codes::NAME_REDACTED);
    }

    #[test]
    fn test_role_exemption_skips_names_and_logs() {
        let roles = vec!["allow_names".to_string()];
        let (text, issues) = redactor().redact("Briefed by Mr. John Smith.", &roles, 0);
        assert_eq!(text, "Briefed by Mr. John Smith.");
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, codes::NAME_REDACTION_EXEMPT);
        assert_eq!(issues[0].severity, Severity::Info);
        assert_eq!(issues[0].details["roles"][0], "allow_names");
    }

    #[test]
    fn test_role_exemption_does_not_skip_emails() {
        let roles = vec!["allow_names".to_string()];
        let (text, _) = redactor().redact("Mr. John Smith (js@example.com)", &roles, 0);
        assert_eq!(text, "Mr. John Smith ([REDACTED:EMAIL])");
    }

    #[test]
    fn test_k_anonymity_small_group_violates() {
        let (_, issues) = redactor().redact("Average wage of 2 workers rose.", &no_roles(), 15);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, codes::K_ANONYMITY_VIOLATION);
        assert!(issues[0].is_error());
    }

    #[test]
    fn test_k_anonymity_large_group_ok() {
        let (_, issues) = redactor().redact("Average wage of 20 workers rose.", &no_roles(), 15);
        assert!(issues.is_empty());
    }

    #[test]
    fn test_k_anonymity_sample_notation() {
        let (_, issues) = redactor().redact("Mean tenure (n = 4) was long.", &no_roles(), 5);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].details["group_size"], 4);
    }

    #[test]
    fn test_k_anonymity_ignores_decimals() {
        let (_, issues) = redactor().redact("an average of 0.5 workers per firm", &no_roles(), 5);
        assert!(issues.is_empty());
    }

    #[test]
    fn test_fact_group_size_checked() {
        let facts = vec![
            Fact::ingest(RawFact::numeric("wage", 9000.0, "PSA", "2024-04-01").with_group_size(3))
                .unwrap(),
            Fact::ingest(RawFact::numeric("wage", 8000.0, "PSA", "2024-04-01").with_group_size(40))
                .unwrap(),
        ];
        let issues = redactor().check_facts(&facts, 15);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, codes::K_ANONYMITY_VIOLATION);
        assert_eq!(issues[0].evidence[0].pointer, "facts[0]");
    }

    #[test]
    fn test_pii_in_fact_reported() {
        let facts = vec![Fact::ingest(
            RawFact::numeric("wage", 9000.0, "hr.lead@ministry.example", "2024-04-01")
                .with_locator("query-998877665544:row-3"),
        )
        .unwrap()];
        let issues = redactor().check_facts(&facts, 0);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, codes::PII_IN_FACT);
        assert_eq!(issues[0].details["field"], "source_name");
    }
}
