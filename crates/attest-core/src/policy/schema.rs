//! JSON Schema validation for policies.
//!
//! The schema checks document structure only. Individual `crosschecks` and
//! `sanity` entries are validated by the parser so that one bad entry is
//! dropped with a warning instead of rejecting the whole policy.

use serde_json::Value;
use std::sync::OnceLock;
use thiserror::Error;

const POLICY_SCHEMA_JSON: &str = include_str!("../../../../schema/policy.schema.json");

static POLICY_VALIDATOR: OnceLock<Result<jsonschema::Validator, PolicySchemaError>> =
    OnceLock::new();

/// A policy document that does not fit the schema, or a broken embedded schema.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PolicySchemaError {
    #[error("embedded policy schema is not valid JSON: {0}")]
    MalformedSchema(String),

    #[error("embedded policy schema does not compile: {0}")]
    UncompilableSchema(String),

    /// `path` is a JSON pointer into the policy document, `/` for the root
    #[error("{path}: {message}")]
    Violation { path: String, message: String },
}

fn policy_validator() -> Result<&'static jsonschema::Validator, PolicySchemaError> {
    POLICY_VALIDATOR
        .get_or_init(compile_policy_schema)
        .as_ref()
        .map_err(Clone::clone)
}

fn compile_policy_schema() -> Result<jsonschema::Validator, PolicySchemaError> {
    let schema: Value = serde_json::from_str(POLICY_SCHEMA_JSON)
        .map_err(|e| PolicySchemaError::MalformedSchema(e.to_string()))?;
    jsonschema::options()
        .build(&schema)
        .map_err(|e| PolicySchemaError::UncompilableSchema(e.to_string()))
}

/// Check a policy document's structure, returning every violation found.
pub fn validate_policy_schema(policy: &Value) -> Result<(), Vec<PolicySchemaError>> {
    let validator = policy_validator().map_err(|e| vec![e])?;

    let violations: Vec<PolicySchemaError> = validator
        .iter_errors(policy)
        .map(|e| {
            let path = e.instance_path.to_string();
            PolicySchemaError::Violation {
                path: if path.is_empty() { "/".to_string() } else { path },
                message: e.to_string(),
            }
        })
        .collect();

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

/// Render violations as one line for error messages.
pub(crate) fn describe_violations(violations: &[PolicySchemaError]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_policy_passes_schema() {
        assert!(validate_policy_schema(&json!({})).is_ok());
    }

    #[test]
    fn test_full_policy_passes_schema() {
        let value = json!({
            "policy_version": "2024.1",
            "citation": {"abs_epsilon": 0.5, "rel_epsilon": 0.01, "min_coverage": 0.8},
            "crosschecks": [{"metric": "unemployment", "tolerance_pct": 5.0}],
            "privacy": {
                "k_anonymity": 15,
                "redact_email": true,
                "redact_ids_min_digits": 8,
                "allow_names_when_role": ["allow_names"]
            },
            "sanity": [{"metric": "unemployment", "rate_0_1": true}],
            "freshness_max_hours": 168,
            "confidence_weights": {"freshness": 0.3}
        });
        assert!(validate_policy_schema(&value).is_ok());
    }

    #[test]
    fn test_unknown_top_level_key_fails_at_root() {
        let errors = validate_policy_schema(&json!({"crosscheck": []})).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, PolicySchemaError::Violation { path, .. } if path == "/")));
    }

    #[test]
    fn test_wrong_type_reports_path() {
        let errors =
            validate_policy_schema(&json!({"privacy": {"k_anonymity": "fifteen"}})).unwrap_err();
        assert!(errors.iter().any(
            |e| matches!(e, PolicySchemaError::Violation { path, .. } if path == "/privacy/k_anonymity")
        ));
        assert!(describe_violations(&errors).starts_with("/privacy/k_anonymity: "));
    }

    #[test]
    fn test_coverage_out_of_range_fails() {
        assert!(validate_policy_schema(&json!({"citation": {"min_coverage": 1.5}})).is_err());
    }

    #[test]
    fn test_entry_contents_are_not_schema_checked() {
        // Entry-level problems are reported per entry by the parser
        let value = json!({"sanity": [{"metric": 42}]});
        assert!(validate_policy_schema(&value).is_ok());
    }
}
