//! Verification policy parsing and validation.
//!
//! A policy is the rule configuration shared by all layers: citation
//! tolerances, cross-source tolerances, privacy switches, sanity rules,
//! freshness SLA and confidence weights. Policies are YAML or JSON documents
//! validated against `schema/policy.schema.json`.

mod parser;
mod schema;

pub use parser::{
    CitationPolicy, ConfidenceSettings, CrosscheckRule, Policy, PolicyError, PrivacyPolicy,
    SanityRule,
};
pub use schema::{validate_policy_schema, PolicySchemaError};
