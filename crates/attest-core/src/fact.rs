//! Facts: the structured query results a narrative must be grounded in.
//!
//! Callers hand over [`RawFact`]s whose `value` may be a JSON number or a
//! string-encoded number. Ingestion decides the closed [`FactValue`] variant
//! once; no layer inspects raw payloads afterwards. A fact that cannot be
//! ingested becomes a `MALFORMED_FACT` warning and is left out of every layer.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use thiserror::Error;

use crate::numbers::parse_quantity;
use crate::types::{codes, Issue, Layer};

/// Errors from ingesting a single fact.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FactError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Value is not a number: {0}")]
    UnparseableValue(String),

    #[error("Unsupported value type: {0}")]
    UnsupportedValue(&'static str),

    #[error("Value is not finite")]
    NonFinite,
}

/// A fact value, classified at ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FactValue {
    Numeric { value: f64 },

    /// Expressed on the 0-100 scale
    Percentage { value: f64 },

    WithUnit { value: f64, unit: String },
}

impl FactValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            FactValue::Numeric { value }
            | FactValue::Percentage { value }
            | FactValue::WithUnit { value, .. } => *value,
        }
    }

    pub fn is_percentage(&self) -> bool {
        matches!(self, FactValue::Percentage { .. })
    }
}

/// An immutable, ingested fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub metric_id: String,
    pub value: FactValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub source_name: String,

    /// Collection timestamp as supplied; parsed lazily so that a bad
    /// timestamp degrades to a freshness issue instead of a rejected fact
    pub collected_at: String,

    /// Opaque provenance pointer (e.g. query id + row index)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locator: Option<String>,

    /// Number of individuals contributing to the value, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_size: Option<u64>,
}

impl Fact {
    /// Ingest a raw fact.
    pub fn ingest(raw: RawFact) -> Result<Self, FactError> {
        if raw.metric_id.trim().is_empty() {
            return Err(FactError::MissingField("metric_id"));
        }
        if raw.source_name.trim().is_empty() {
            return Err(FactError::MissingField("source_name"));
        }

        let value = classify_value(&raw.value, raw.unit.as_deref())?;

        Ok(Self {
            metric_id: raw.metric_id.trim().to_string(),
            value,
            unit: raw.unit,
            source_name: raw.source_name.trim().to_string(),
            collected_at: raw.collected_at,
            locator: raw.locator,
            group_size: raw.group_size,
        })
    }

    /// Parsed collection timestamp, if well-formed.
    pub fn collected_at_utc(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.collected_at)
    }

    /// Whether the value is on the 0-100 percent scale.
    pub fn is_percent_scaled(&self) -> bool {
        self.value.is_percentage() || self.unit.as_deref().map_or(false, is_percent_unit)
    }

    /// Text fields that could carry personal data.
    pub fn payload_text(&self) -> Vec<(&'static str, &str)> {
        let mut fields = vec![
            ("metric_id", self.metric_id.as_str()),
            ("source_name", self.source_name.as_str()),
        ];
        if let Some(unit) = &self.unit {
            fields.push(("unit", unit.as_str()));
        }
        if let Some(locator) = &self.locator {
            fields.push(("locator", locator.as_str()));
        }
        if let FactValue::WithUnit { unit, .. } = &self.value {
            fields.push(("value.unit", unit.as_str()));
        }
        fields
    }
}

/// A fact as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFact {
    #[serde(default, alias = "metric")]
    pub metric_id: String,

    #[serde(default)]
    pub value: Value,

    #[serde(default)]
    pub unit: Option<String>,

    #[serde(default, alias = "source")]
    pub source_name: String,

    #[serde(default)]
    pub collected_at: String,

    #[serde(default)]
    pub locator: Option<String>,

    #[serde(default)]
    pub group_size: Option<u64>,
}

impl RawFact {
    /// Convenience constructor for a numeric fact.
    pub fn numeric(
        metric_id: impl Into<String>,
        value: f64,
        source_name: impl Into<String>,
        collected_at: impl Into<String>,
    ) -> Self {
        Self {
            metric_id: metric_id.into(),
            value: Value::from(value),
            unit: None,
            source_name: source_name.into(),
            collected_at: collected_at.into(),
            locator: None,
            group_size: None,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_locator(mut self, locator: impl Into<String>) -> Self {
        self.locator = Some(locator.into());
        self
    }

    pub fn with_group_size(mut self, group_size: u64) -> Self {
        self.group_size = Some(group_size);
        self
    }
}

/// Ingest a batch of raw facts.
///
/// Returns the accepted facts (in input order) and one `MALFORMED_FACT`
/// warning per rejected entry. `input_index` refers to the raw input, since
/// `facts[i]` evidence pointers elsewhere index the accepted facts.
pub fn ingest_all(raw: Vec<RawFact>) -> (Vec<Fact>, Vec<Issue>) {
    let mut facts = Vec::with_capacity(raw.len());
    let mut issues = Vec::new();

    for (index, raw_fact) in raw.into_iter().enumerate() {
        let metric_id = raw_fact.metric_id.clone();
        match Fact::ingest(raw_fact) {
            Ok(fact) => facts.push(fact),
            Err(e) => {
                tracing::warn!(index, metric_id = %metric_id, error = %e, "Rejected malformed fact");
                issues.push(
                    Issue::warning(
                        Layer::Sanity,
                        codes::MALFORMED_FACT,
                        format!("Fact #{} was rejected: {}", index, e),
                    )
                    .with_detail("input_index", index)
                    .with_detail("metric_id", metric_id)
                    .with_detail("reason", e.to_string()),
                );
            }
        }
    }

    (facts, issues)
}

/// Read access to the facts of one request.
pub trait FactStore {
    /// All facts in ingestion order.
    fn facts(&self) -> &[Fact];

    /// Facts for one metric, with their indices.
    fn by_metric(&self, metric_id: &str) -> Vec<(usize, &Fact)> {
        self.facts()
            .iter()
            .enumerate()
            .filter(|(_, f)| f.metric_id == metric_id)
            .collect()
    }

    /// Facts from one source, with their indices.
    fn by_source(&self, source_name: &str) -> Vec<(usize, &Fact)> {
        self.facts()
            .iter()
            .enumerate()
            .filter(|(_, f)| f.source_name.eq_ignore_ascii_case(source_name))
            .collect()
    }

    /// Distinct metric ids, sorted.
    fn metrics(&self) -> BTreeSet<&str> {
        self.facts().iter().map(|f| f.metric_id.as_str()).collect()
    }
}

/// A fact store backed by a vector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InMemoryFactStore {
    facts: Vec<Fact>,
}

impl InMemoryFactStore {
    pub fn new(facts: Vec<Fact>) -> Self {
        Self { facts }
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }
}

impl FactStore for InMemoryFactStore {
    fn facts(&self) -> &[Fact] {
        &self.facts
    }
}

impl FactStore for [Fact] {
    fn facts(&self) -> &[Fact] {
        self
    }
}

impl FromIterator<Fact> for InMemoryFactStore {
    fn from_iter<I: IntoIterator<Item = Fact>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Whether a unit string denotes the 0-100 percent scale.
pub fn is_percent_unit(unit: &str) -> bool {
    matches!(
        unit.trim().to_lowercase().as_str(),
        "%" | "percent" | "per cent" | "pct" | "percentage"
    )
}

/// Parse a timestamp: RFC 3339, `YYYY-MM-DD HH:MM:SS` / `YYYY-MM-DDTHH:MM:SS`
/// (taken as UTC), or a bare date (midnight UTC).
pub fn parse_timestamp(input: &str) -> Option<DateTime<Utc>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn classify_value(value: &Value, declared_unit: Option<&str>) -> Result<FactValue, FactError> {
    let declared_percent = declared_unit.map_or(false, is_percent_unit);

    match value {
        Value::Number(n) => {
            let v = n.as_f64().ok_or(FactError::NonFinite)?;
            if !v.is_finite() {
                return Err(FactError::NonFinite);
            }
            if declared_percent {
                Ok(FactValue::Percentage { value: v })
            } else {
                Ok(FactValue::Numeric { value: v })
            }
        }
        Value::String(s) => {
            let quantity =
                parse_quantity(s).ok_or_else(|| FactError::UnparseableValue(s.clone()))?;
            if !quantity.value.is_finite() {
                return Err(FactError::NonFinite);
            }
            if quantity.percent || declared_percent {
                return Ok(FactValue::Percentage {
                    value: quantity.value,
                });
            }
            match quantity.unit {
                Some(unit) if is_percent_unit(&unit) => Ok(FactValue::Percentage {
                    value: quantity.value,
                }),
                Some(unit) => Ok(FactValue::WithUnit {
                    value: quantity.value,
                    unit,
                }),
                None => Ok(FactValue::Numeric {
                    value: quantity.value,
                }),
            }
        }
        Value::Null => Err(FactError::MissingField("value")),
        Value::Bool(_) => Err(FactError::UnsupportedValue("boolean")),
        Value::Array(_) => Err(FactError::UnsupportedValue("array")),
        Value::Object(_) => Err(FactError::UnsupportedValue("object")),
    }
}
