//! Verification layers.
//!
//! Each layer examines the same read-only snapshot of one request and
//! reports independently; no layer sees another layer's output. The
//! synthesizer merges their outcomes in a fixed order.
//!
//! ## Layers
//!
//! | Layer | Checks |
//! |-------|--------|
//! | Citation | every numeric claim is backed by a fact and cites its source |
//! | CrossSource | sources reporting the same metric agree within tolerance |
//! | Privacy | personal data is redacted and group sizes respect k-anonymity |
//! | Sanity | values obey range/rate rules and facts are fresh |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fact::Fact;
use crate::policy::Policy;
use crate::types::{Issue, Layer, NumericClaim, Span};

pub mod citation;
pub mod crosscheck;
pub mod patterns;
pub mod privacy;
pub mod sanity;

pub use citation::CitationEnforcer;
pub use crosscheck::{CrossSourceChecker, ReportedValue};
pub use privacy::PrivacyRedactor;
pub use sanity::SanityValidator;

/// Read-only snapshot shared by all layers of one run.
#[derive(Debug, Clone, Copy)]
pub struct CheckInput<'a> {
    pub narrative: &'a str,
    pub facts: &'a [Fact],
    pub policy: &'a Policy,

    /// Caller roles, for privacy exemptions
    pub roles: &'a [String],

    /// Reference time supplied by the caller; layers never read a clock
    pub now: DateTime<Utc>,
}

/// A verification layer.
pub trait Check {
    fn layer(&self) -> Layer;

    fn run(&self, input: &CheckInput<'_>) -> LayerOutcome;
}

/// What a layer wants changed in the released narrative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditKind {
    /// Insert text at `span.start` (`span` is empty)
    Annotate,

    /// Replace `span` with a placeholder
    Redact,
}

/// One edit against the original narrative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrativeEdit {
    pub kind: EditKind,
    pub span: Span,
    pub text: String,
}

impl NarrativeEdit {
    pub fn redact(span: Span, placeholder: impl Into<String>) -> Self {
        Self {
            kind: EditKind::Redact,
            span,
            text: placeholder.into(),
        }
    }

    pub fn annotate(at: usize, text: impl Into<String>) -> Self {
        Self {
            kind: EditKind::Annotate,
            span: Span::new(at, at),
            text: text.into(),
        }
    }
}

/// Everything one layer produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerOutcome {
    pub layer: Layer,
    pub issues: Vec<Issue>,

    #[serde(default)]
    pub edits: Vec<NarrativeEdit>,

    /// Numeric claims examined (citation layer only)
    #[serde(default)]
    pub claims: Vec<NumericClaim>,

    /// Human-readable remarks that are not issues (e.g. "no numeric claims")
    #[serde(default)]
    pub notes: Vec<String>,
}

impl LayerOutcome {
    pub fn new(layer: Layer) -> Self {
        Self {
            layer,
            issues: Vec::new(),
            edits: Vec::new(),
            claims: Vec::new(),
            notes: Vec::new(),
        }
    }

    pub fn with_issues(layer: Layer, issues: Vec<Issue>) -> Self {
        Self {
            issues,
            ..Self::new(layer)
        }
    }

    /// Number of redaction edits.
    pub fn redactions(&self) -> usize {
        self.edits
            .iter()
            .filter(|e| e.kind == EditKind::Redact)
            .count()
    }
}

/// Apply edits to the original narrative.
///
/// Edits are applied in position order. A redaction that overlaps an earlier
/// redaction is dropped, and so is an annotation that falls strictly inside a
/// redacted span; an annotation right after a redacted span is kept.
pub fn apply_edits(narrative: &str, edits: &[NarrativeEdit]) -> String {
    let mut ordered: Vec<&NarrativeEdit> = edits
        .iter()
        .filter(|e| {
            e.span.start <= e.span.end
                && e.span.end <= narrative.len()
                && narrative.is_char_boundary(e.span.start)
                && narrative.is_char_boundary(e.span.end)
        })
        .collect();
    ordered.sort_by(|a, b| {
        a.span
            .start
            .cmp(&b.span.start)
            .then(a.kind.cmp(&b.kind))
            .then(b.span.end.cmp(&a.span.end))
    });

    let mut out = String::with_capacity(narrative.len());
    let mut cursor = 0;
    for edit in ordered {
        if edit.span.start < cursor {
            continue;
        }
        out.push_str(&narrative[cursor..edit.span.start]);
        out.push_str(&edit.text);
        cursor = edit.span.end;
    }
    out.push_str(&narrative[cursor..]);
    out
}
