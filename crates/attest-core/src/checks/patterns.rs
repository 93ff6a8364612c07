//! Shared detection patterns for the layers.
//!
//! Citation markers and redaction placeholders must be recognized the same
//! way by every layer: the citation layer skips numbers inside them, the
//! privacy layer must never redact them again.

use lazy_static::lazy_static;
use regex::Regex;

use crate::types::Span;

lazy_static! {
    // =========================================================================
    // NARRATIVE STRUCTURE
    // =========================================================================

    /// Inline citation marker: `[Per X]`, `[Source: X]`, `[Src: X]`, `(Source: X)`
    pub static ref CITATION_MARKER: Regex = Regex::new(
        r"(?i)\[\s*(?:per\b|sources?\s*:|src\s*:)\s*(?P<src>[^\]]+?)\s*\]|\(\s*(?:source|src)\s*:\s*(?P<psrc>[^)]+?)\s*\)"
    ).unwrap();

    /// Placeholder left behind by the privacy layer
    pub static ref REDACTION_PLACEHOLDER: Regex = Regex::new(
        r"\[REDACTED:[A-Z_]+\]"
    ).unwrap();

    /// Any square-bracketed span (footnotes, editorial notes, markers)
    pub static ref BRACKET_SPAN: Regex = Regex::new(
        r"\[[^\[\]\n]*\]"
    ).unwrap();

    /// End of a sentence: terminal punctuation followed by whitespace or end, or a newline
    pub static ref SENTENCE_BOUNDARY: Regex = Regex::new(
        r"[.!?](?:\s|$)|\n"
    ).unwrap();

    // =========================================================================
    // PERSONAL DATA
    // =========================================================================

    /// Email address pattern (RFC 5322 simplified)
    pub static ref EMAIL_PATTERN: Regex = Regex::new(
        r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}"
    ).unwrap();

    /// Unbroken digit run
    pub static ref DIGIT_RUN: Regex = Regex::new(
        r"\d+"
    ).unwrap();

    /// Honorific followed by one to four capitalized words
    pub static ref HONORIFIC_NAME: Regex = Regex::new(
        r"\b(?:Mr|Mrs|Ms|Miss|Dr|Prof|Sheikh|Sheikha|Eng)\.?\s+(?P<name>[A-Z][a-z'\-]+(?:\s+(?:(?:al|bin|bint|Al|Bin|Bint)[\s\-])?[A-Z][a-z'\-]+){0,3})"
    ).unwrap();

    /// Labelled name field: `Name: John Smith`, `employee = Fatima Hassan`
    pub static ref LABELLED_NAME: Regex = Regex::new(
        r"\b(?i:name|employee|worker|applicant|contact person|respondent)\s*[:=]\s*(?P<name>[A-Z][a-z'\-]+(?:\s+(?:(?:al|bin|bint|Al|Bin|Bint)[\s\-])?[A-Z][a-z'\-]+){1,3})"
    ).unwrap();

    // =========================================================================
    // GROUP SIZES
    // =========================================================================

    /// Explicit group size: `n = 12`, `n=12`, `12 workers`
    pub static ref GROUP_SIZE: Regex = Regex::new(
        r"(?i)\bn\s*=\s*(?P<n>\d{1,3}(?:,\d{3})+|\d+)\b|\b(?P<count>\d{1,3}(?:,\d{3})+|\d+)\s+(?:individuals?|people|persons?|workers?|employees?|respondents?|households?|cases|applicants?|nationals)\b"
    ).unwrap();
}

/// An inline citation marker.
#[derive(Debug, Clone, PartialEq)]
pub struct CitationMarker {
    pub span: Span,

    /// Source text as written (`GCC-STAT Q1-2024`)
    pub source: String,
}

/// All citation markers, in order.
pub fn citation_markers(text: &str) -> Vec<CitationMarker> {
    CITATION_MARKER
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let source = caps.name("src").or_else(|| caps.name("psrc"))?;
            Some(CitationMarker {
                span: Span::new(whole.start(), whole.end()),
                source: source.as_str().trim().to_string(),
            })
        })
        .collect()
}

/// Spans of existing redaction placeholders.
pub fn placeholder_spans(text: &str) -> Vec<Span> {
    REDACTION_PLACEHOLDER
        .find_iter(text)
        .map(|m| Span::new(m.start(), m.end()))
        .collect()
}

/// Spans that never contain numeric claims: citation markers (square and
/// round), placeholders and any other square-bracketed note.
pub fn non_claim_spans(text: &str) -> Vec<Span> {
    let mut spans: Vec<Span> = citation_markers(text).into_iter().map(|m| m.span).collect();
    spans.extend(placeholder_spans(text));
    spans.extend(
        BRACKET_SPAN
            .find_iter(text)
            .map(|m| Span::new(m.start(), m.end())),
    );
    spans.sort();
    spans.dedup();
    spans
}

/// Whether a sentence ends between `from` and `to`.
///
/// Punctuation inside one of `ignored` (e.g. a citation marker) does not count.
pub fn sentence_ends_between(text: &str, from: usize, to: usize, ignored: &[Span]) -> bool {
    if from >= to || to > text.len() {
        return false;
    }
    SENTENCE_BOUNDARY
        .find_iter(text)
        .filter(|m| m.start() >= from && m.start() < to)
        .any(|m| !ignored.iter().any(|s| s.contains(m.start())))
}

/// Digit runs of at least `min_digits` that stand alone as identifiers.
///
/// Runs that belong to a grouped or decimal number (`12,345,678.5`) are not
/// identifiers.
pub fn identifier_spans(text: &str, min_digits: usize) -> Vec<Span> {
    let bytes = text.as_bytes();
    DIGIT_RUN
        .find_iter(text)
        .filter(|m| m.as_str().len() >= min_digits)
        .filter(|m| {
            let before = m.start().checked_sub(1).map(|i| bytes[i]);
            let before2 = m.start().checked_sub(2).map(|i| bytes[i]);
            let after = bytes.get(m.end()).copied();
            let after2 = bytes.get(m.end() + 1).copied();

            let glued_letter = before.map_or(false, |b| b.is_ascii_alphabetic() || b == b'_')
                || after.map_or(false, |b| b.is_ascii_alphabetic() || b == b'_');
            let in_number_left = matches!(before, Some(b'.' | b','))
                && before2.map_or(false, |b| b.is_ascii_digit());
            let in_number_right = matches!(after, Some(b'.' | b','))
                && after2.map_or(false, |b| b.is_ascii_digit());

            !glued_letter && !in_number_left && !in_number_right
        })
        .map(|m| Span::new(m.start(), m.end()))
        .collect()
}

/// Check if content contains any email addresses.
pub fn contains_email(content: &str) -> bool {
    EMAIL_PATTERN.is_match(content)
}
