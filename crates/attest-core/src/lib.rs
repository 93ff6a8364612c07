//! # attest-core
//!
//! Deterministic verification and audit engine for statistical narratives.
//!
//! This crate sits between "a model wrote a report full of numbers" and
//! "the report is released", answering:
//! - Is every number backed by a fact, and does it cite the right source?
//! - Do sources reporting the same metric agree?
//! - Is personal data redacted, and are disclosed groups large enough?
//! - Are the values plausible and the data fresh?
//!
//! ## Key Guarantees
//!
//! 1. **Deterministic**: Same narrative, facts, policy and "now" produce
//!    byte-identical digests
//! 2. **No model calls**: All checks are rule-based
//! 3. **Traceable**: Every issue carries a stable code and evidence pointers
//! 4. **Parallel-safe**: Layers read the same snapshot and report independently
//!
//! ## Example
//!
//! ```rust,ignore
//! use attest_core::{verify, Policy, RawFact, VerificationRequest};
//!
//! let policy = Policy::from_yaml_file("policy.yaml")?;
//! let request = VerificationRequest::new(
//!     "req-42",
//!     "Qatar unemployment was 0.10% [Per GCC-STAT Q1-2024]",
//!     vec![RawFact::numeric("qatar_unemployment", 0.10, "GCC-STAT", "2024-04-09")],
//!     now,
//! );
//! let outcome = verify(request, &policy)?;
//!
//! if outcome.summary.ok {
//!     publish(&outcome.summary.redacted_narrative);
//! }
//! ```

pub mod audit;
pub mod checks;
pub mod confidence;
pub mod evidence;
pub mod fact;
pub mod matching;
pub mod numbers;
pub mod policy;
pub mod synthesizer;
pub mod types;

// Re-export main types at crate root
pub use audit::{
    build_audit, verify_chain, verify_signature, AuditError, AuditRecord, ChainError, ChainLink,
    Integrity, ReproducibilityNote, StoredAuditRecord,
};
pub use checks::{
    Check, CheckInput, CitationEnforcer, CrossSourceChecker, LayerOutcome, PrivacyRedactor,
    ReportedValue, SanityValidator,
};
pub use confidence::ConfidenceFinalizer;
pub use evidence::{Evidence, EvidenceSource};
pub use fact::{Fact, FactError, FactStore, FactValue, InMemoryFactStore, RawFact};
pub use matching::Tolerance;
pub use policy::{Policy, PolicyError};
pub use synthesizer::{LayerOutcomes, Synthesis, Synthesizer};
pub use types::{
    codes, ConfidenceBand, ConfidenceFactors, ConfidenceScore, ConfidenceWeights, Issue,
    IssueCounts, Layer, MatchedFact, NumericClaim, Severity, Span, VerificationSummary,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Version recorded in every audit reproducibility note.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Errors that stop a verification run before any layer executes.
///
/// Problems with individual facts or policy entries are not errors; they
/// become issues in the summary.
#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("Request has no narrative")]
    MissingNarrative,

    #[error("Request id must not be empty")]
    EmptyRequestId,

    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),
}

/// Input to one verification run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRequest {
    pub request_id: String,

    /// The generated narrative; absence is fatal
    #[serde(default)]
    pub narrative: Option<String>,

    #[serde(default)]
    pub facts: Vec<RawFact>,

    /// Reference time for freshness and the audit timestamp
    pub now: DateTime<Utc>,

    /// Caller roles, for privacy exemptions
    #[serde(default)]
    pub roles: Vec<String>,

    /// Stability factor for the confidence score, defaults to 0.5
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stability_hint: Option<f64>,
}

impl VerificationRequest {
    pub fn new(
        request_id: impl Into<String>,
        narrative: impl Into<String>,
        facts: Vec<RawFact>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            narrative: Some(narrative.into()),
            facts,
            now,
            roles: Vec::new(),
            stability_hint: None,
        }
    }

    pub fn with_roles(mut self, roles: Vec<String>) -> Self {
        self.roles = roles;
        self
    }

    pub fn with_stability_hint(mut self, hint: f64) -> Self {
        self.stability_hint = Some(hint);
        self
    }
}

/// Everything a run produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub summary: VerificationSummary,
    pub audit: AuditRecord,
    pub confidence: ConfidenceScore,

    /// Claims examined by the citation layer
    pub claims: Vec<NumericClaim>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

/// A validated request with its facts ingested.
///
/// Owns everything the layers read, so it can be shared with worker
/// threads while the layers run.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRequest {
    pub request_id: String,
    pub narrative: String,
    pub facts: Vec<Fact>,
    pub roles: Vec<String>,
    pub now: DateTime<Utc>,
    pub stability_hint: f64,

    /// Issues raised while loading the policy and ingesting facts
    pub preliminary: Vec<Issue>,
}

impl PreparedRequest {
    pub fn new(request: VerificationRequest, policy: &Policy) -> Result<Self, VerifyError> {
        if request.request_id.trim().is_empty() {
            return Err(VerifyError::EmptyRequestId);
        }
        let narrative = request.narrative.ok_or(VerifyError::MissingNarrative)?;

        let (facts, malformed) = fact::ingest_all(request.facts);

        let mut preliminary = policy.diagnostics().to_vec();
        preliminary.extend(malformed);

        Ok(Self {
            request_id: request.request_id,
            narrative,
            facts,
            roles: request.roles,
            now: request.now,
            stability_hint: request
                .stability_hint
                .unwrap_or(confidence::DEFAULT_STABILITY_HINT),
            preliminary,
        })
    }

    /// The read-only snapshot handed to every layer.
    pub fn input<'a>(&'a self, policy: &'a Policy) -> CheckInput<'a> {
        CheckInput {
            narrative: &self.narrative,
            facts: &self.facts,
            policy,
            roles: &self.roles,
            now: self.now,
        }
    }
}

/// Run the four layers one after another.
pub fn run_layers(input: &CheckInput<'_>) -> LayerOutcomes {
    LayerOutcomes {
        citation: CitationEnforcer::from_policy(input.policy).run(input),
        cross_source: CrossSourceChecker::from_policy(input.policy).run(input),
        privacy: PrivacyRedactor::from_policy(input.policy).run(input),
        sanity: SanityValidator::from_policy(input.policy).run(input),
    }
}

/// Merge layer outcomes, then build the audit record and score.
///
/// Shared by the sequential path here and the concurrent runtime, so both
/// produce identical results.
pub fn finalize(
    prepared: &PreparedRequest,
    policy: &Policy,
    outcomes: LayerOutcomes,
    secret_key: Option<&[u8]>,
) -> Result<VerificationOutcome, VerifyError> {
    let Synthesis {
        summary,
        claims,
        notes,
    } = Synthesizer::new().synthesize(&prepared.narrative, &prepared.preliminary, outcomes);

    let note = ReproducibilityNote {
        engine_version: ENGINE_VERSION.to_string(),
        policy_version: policy.policy_version.clone(),
        policy_digest: policy.digest()?,
        now: prepared.now,
        roles: prepared.roles.clone(),
        stability_hint: prepared.stability_hint,
    };
    let audit = build_audit(
        &prepared.request_id,
        &prepared.narrative,
        &prepared.facts,
        &summary.issues,
        secret_key,
        note,
        prepared.now,
    )?;

    let confidence = ConfidenceFinalizer::from_policy(policy, prepared.now).score(
        &summary.issues,
        &prepared.facts,
        prepared.stability_hint,
    );

    tracing::debug!(
        request_id = %prepared.request_id,
        ok = summary.ok,
        confidence = confidence.value,
        "Verification complete"
    );

    Ok(VerificationOutcome {
        summary,
        audit,
        confidence,
        claims,
        notes,
    })
}

/// Verify a narrative against facts under a policy.
///
/// This is the main entry point. The audit record is unsigned.
///
/// # Returns
///
/// A `VerificationOutcome` containing:
/// - `summary`: ok flag, ordered issues, redacted narrative
/// - `audit`: digests and reproducibility note of this run
/// - `confidence`: 0-100 score with band and factors
pub fn verify(
    request: VerificationRequest,
    policy: &Policy,
) -> Result<VerificationOutcome, VerifyError> {
    verify_signed(request, policy, None)
}

/// Verify and sign the audit record with an HMAC key.
pub fn verify_signed(
    request: VerificationRequest,
    policy: &Policy,
    secret_key: Option<&[u8]>,
) -> Result<VerificationOutcome, VerifyError> {
    let prepared = PreparedRequest::new(request, policy)?;
    let outcomes = run_layers(&prepared.input(policy));
    finalize(&prepared, policy, outcomes, secret_key)
}
