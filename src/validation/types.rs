//! Data types shared by validators and the pipeline.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::confidence::{ConfidenceAnalysis, ConfidenceTrend};
use crate::resilience::CircuitBreakerStatus;
use crate::utilities::string_utils::parse_number;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// One extracted requirement.
///
/// `value` is kept as text; numbers in incoming JSON are accepted and
/// rendered as strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Specification {
    #[serde(rename = "type", default)]
    pub spec_type: String,
    pub constraint: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub value: String,
    #[serde(default)]
    pub strength: i64,
    #[serde(default)]
    pub reasoning: String,
}

impl Specification {
    pub fn new(constraint: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            spec_type: "performance".to_string(),
            constraint: constraint.into(),
            value: value.into(),
            strength: 1000,
            reasoning: String::new(),
        }
    }

    pub fn numeric_value(&self) -> Option<f64> {
        parse_number(&self.value)
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

/// Per-request context handed to every validator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// `novice`, `intermediate` or `expert`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_expertise: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ValidationContext {
    pub fn with_budget(budget: f64) -> Self {
        Self {
            budget: Some(budget),
            ..Self::default()
        }
    }
}

/// Session payload accepted by `validate_complete_solution`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
    #[serde(default)]
    pub specifications: Vec<Specification>,
    #[serde(default)]
    pub budget: Option<f64>,
    #[serde(default)]
    pub user_expertise: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl SessionData {
    pub fn context(&self) -> ValidationContext {
        ValidationContext {
            budget: self.budget,
            session_id: self.session_id.clone(),
            user_expertise: self.user_expertise.clone(),
            extra: Map::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Phase results
// ---------------------------------------------------------------------------

/// The three validation phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Technical,
    Commercial,
    Csp,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Technical, Phase::Commercial, Phase::Csp];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Technical => "technical",
            Self::Commercial => "commercial",
            Self::Csp => "csp",
        }
    }

    /// Validator id used for breakers and fallback responses.
    pub fn validator_id(&self) -> &'static str {
        match self {
            Self::Technical => "technical_validator",
            Self::Commercial => "commercial_validator",
            Self::Csp => "csp_validator",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one validator. Only `valid` and `confidence` are interpreted
/// by the pipeline; everything else rides along in `details`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub valid: bool,
    pub confidence: f64,
    /// Produced by the fallback handler rather than the validator.
    #[serde(default)]
    pub fallback: bool,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl PhaseResult {
    pub fn new(valid: bool, confidence: f64) -> Self {
        Self {
            valid,
            confidence,
            fallback: false,
            details: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.details.insert(key.to_string(), value);
        self
    }

    /// Read a result from loosely shaped JSON.
    ///
    /// Missing or mistyped `valid`/`confidence` read as `false`/`0.0`.
    pub fn from_value(value: Value) -> Self {
        let mut details = match value {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        let valid = details.remove("valid").and_then(|v| v.as_bool()).unwrap_or(false);
        let confidence = details
            .remove("confidence")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        let fallback = details.remove("fallback").and_then(|v| v.as_bool()).unwrap_or(false);
        Self {
            valid,
            confidence,
            fallback,
            details,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = self.details.clone();
        map.insert("valid".into(), Value::Bool(self.valid));
        map.insert("confidence".into(), serde_json::json!(self.confidence));
        if self.fallback {
            map.insert("fallback".into(), Value::Bool(true));
        }
        Value::Object(map)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.details.get(key)
    }
}

/// A violation reported by the constraint phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CspViolation {
    pub constraint: String,
    /// `exceeds_maximum`, `below_minimum`, `not_exact_match`,
    /// `required_missing`, or a dependency violation name.
    pub violation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_allowed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_required: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub severity: String,
}

impl CspViolation {
    pub fn new(constraint: impl Into<String>, violation: impl Into<String>, severity: &str) -> Self {
        Self {
            constraint: constraint.into(),
            violation: violation.into(),
            value: None,
            max_allowed: None,
            min_required: None,
            required: None,
            message: None,
            severity: severity.to_string(),
        }
    }

    /// Violations listed in a phase result; malformed entries are skipped.
    pub fn list_from(result: &PhaseResult) -> Vec<CspViolation> {
        result
            .get("violations")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| serde_json::from_value(v.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Pipeline results
// ---------------------------------------------------------------------------

/// One pass over the three phases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRoundResult {
    pub round: u32,
    pub technical: Option<PhaseResult>,
    pub commercial: Option<PhaseResult>,
    pub csp: Option<PhaseResult>,
    pub valid: bool,
    pub confidence: f64,
    pub fallback_used: bool,
    /// Specifications this round was run against.
    pub specifications: Vec<Specification>,
}

impl ValidationRoundResult {
    pub fn new(round: u32, specifications: Vec<Specification>) -> Self {
        Self {
            round,
            technical: None,
            commercial: None,
            csp: None,
            valid: false,
            confidence: 0.0,
            fallback_used: false,
            specifications,
        }
    }

    pub fn phase(&self, phase: Phase) -> Option<&PhaseResult> {
        match phase {
            Phase::Technical => self.technical.as_ref(),
            Phase::Commercial => self.commercial.as_ref(),
            Phase::Csp => self.csp.as_ref(),
        }
    }

    pub fn set_phase(&mut self, phase: Phase, result: PhaseResult) {
        match phase {
            Phase::Technical => self.technical = Some(result),
            Phase::Commercial => self.commercial = Some(result),
            Phase::Csp => self.csp = Some(result),
        }
    }
}

/// Outcome of a full `validate` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub rounds: Vec<ValidationRoundResult>,
    pub final_result: ValidationRoundResult,
    pub consensus_achieved: bool,
    pub circuit_breaker_status: BTreeMap<String, CircuitBreakerStatus>,
    pub fallback_used: bool,
    pub confidence_analysis: ConfidenceAnalysis,
    pub confidence_trend: ConfidenceTrend,
}

/// A problem surfaced to the caller of `validate_complete_solution`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SolutionConflict {
    Technical {
        message: String,
        details: Value,
    },
    Budget {
        message: String,
        estimated_cost: f64,
        budget: f64,
        over_budget_amount: f64,
    },
    Constraint {
        message: String,
        details: Value,
    },
}

/// Flattened view of the final round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolutionSummary {
    pub valid: bool,
    pub confidence: f64,
    pub rounds_completed: usize,
    pub consensus_achieved: bool,
    pub fallback_used: bool,
    pub technical: Option<PhaseResult>,
    pub commercial: Option<PhaseResult>,
    pub csp: Option<PhaseResult>,
    pub overall_confidence: f64,
    pub conflicts: Vec<SolutionConflict>,
}
