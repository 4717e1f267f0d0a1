//! Constraint satisfaction: catalog rules and cross-variable dependencies.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::types::{CspViolation, PhaseResult, Specification, ValidationContext};
use super::validator::{specifications_from, Validator, ValidatorError};
use crate::catalog::{Catalog, RuleOperator};

/// Minimum power, in watts, for a system with more than
/// `HIGH_ANALOG_COUNT` analog inputs.
const MIN_POWER_HIGH_ANALOG: i64 = 10;
const HIGH_ANALOG_COUNT: i64 = 16;

pub struct CspValidator {
    catalog: Arc<Catalog>,
}

impl CspValidator {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    pub fn validate(&self, specs: &[Specification]) -> PhaseResult {
        let mut violations = self.check_rules(specs);
        let variables = extract_variables(specs);
        violations.extend(self.check_dependencies(&variables));

        let valid = violations.is_empty();
        let confidence = if valid { 1.0 } else { 0.0 };
        if !valid {
            log::debug!(
                "[CspValidator] {} violation(s): {}",
                violations.len(),
                violations
                    .iter()
                    .map(|v| format!("{}:{}", v.constraint, v.violation))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }

        let best_solution = if valid { json!(variables) } else { Value::Null };
        PhaseResult::new(valid, confidence)
            .with("violations", json!(violations))
            .with("variables", json!(variables))
            .with("solutions_count", json!(if valid { 1 } else { 0 }))
            .with("best_solution", best_solution)
    }

    /// Check each specification against the first matching catalog rule.
    fn check_rules(&self, specs: &[Specification]) -> Vec<CspViolation> {
        let mut out = Vec::new();
        for spec in specs {
            let Some((_, rule)) = self.catalog.find_rule(&spec.constraint) else {
                continue;
            };
            match spec.numeric_value() {
                Some(value) => {
                    let Some(bound) = rule.value else {
                        continue;
                    };
                    let violation = match rule.operator {
                        RuleOperator::Max if value > bound => {
                            let mut v = CspViolation::new(&spec.constraint, "exceeds_maximum", "high");
                            v.max_allowed = Some(bound);
                            Some(v)
                        }
                        RuleOperator::Min if value < bound => {
                            let mut v = CspViolation::new(&spec.constraint, "below_minimum", "high");
                            v.min_required = Some(bound);
                            Some(v)
                        }
                        RuleOperator::Exact if value != bound => {
                            let mut v = CspViolation::new(&spec.constraint, "not_exact_match", "high");
                            v.required = Some(bound);
                            Some(v)
                        }
                        _ => None,
                    };
                    if let Some(mut v) = violation {
                        v.value = Some(value);
                        out.push(v);
                    }
                }
                None => {
                    if rule.operator == RuleOperator::Required && spec.value.trim().is_empty() {
                        out.push(CspViolation::new(&spec.constraint, "required_missing", "high"));
                    }
                }
            }
        }
        out
    }

    fn check_dependencies(&self, vars: &BTreeMap<&'static str, i64>) -> Vec<CspViolation> {
        let mut out = Vec::new();

        if let (Some(power), Some(analog)) = (vars.get("power_watts"), vars.get("analog_inputs")) {
            if *power <= MIN_POWER_HIGH_ANALOG && *analog > HIGH_ANALOG_COUNT {
                let mut v = CspViolation::new("power_vs_io", "power_insufficient_for_io", "absolute");
                v.message = Some(format!(
                    "{} W is insufficient for {} analog inputs",
                    power, analog
                ));
                out.push(v);
            }
        }

        if let Some(total) = vars.get("total_io") {
            let ceiling = i64::from(self.catalog.limits.controller_io_ceiling);
            if *total > ceiling {
                let mut v = CspViolation::new("total_io_limit", "exceeds_controller_capacity", "high");
                v.value = Some(*total as f64);
                v.max_allowed = Some(ceiling as f64);
                out.push(v);
            }
        }
        out
    }
}

/// Map specification constraints onto solver variables. `total_io` is
/// derived when both analog inputs and digital outputs are known.
fn extract_variables(specs: &[Specification]) -> BTreeMap<&'static str, i64> {
    let mut vars = BTreeMap::new();
    for spec in specs {
        let constraint = spec.constraint.to_ascii_lowercase();
        let name = if constraint.contains("analog_input") || constraint.contains("analog_io") {
            "analog_inputs"
        } else if constraint.contains("digital_output") || constraint.contains("digital_io") {
            "digital_outputs"
        } else if constraint.contains("total_io") {
            "total_io"
        } else if constraint.contains("memory") {
            "memory_gb"
        } else if constraint.contains("storage") {
            "storage_gb"
        } else if constraint.contains("power") {
            "power_watts"
        } else {
            continue;
        };
        if let Some(value) = spec.numeric_value() {
            vars.insert(name, value as i64);
        }
    }
    if let (Some(a), Some(d)) = (vars.get("analog_inputs"), vars.get("digital_outputs")) {
        let total = a.saturating_add(*d);
        vars.insert("total_io", total);
    }
    vars
}

#[async_trait]
impl Validator for CspValidator {
    fn id(&self) -> &str {
        "csp_validator"
    }

    async fn process(
        &self,
        input: &Value,
        _context: &ValidationContext,
    ) -> Result<PhaseResult, ValidatorError> {
        let specs = specifications_from(input)?;
        Ok(self.validate(&specs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ConstraintRule;

    fn spec(constraint: &str, value: &str) -> Specification {
        Specification::new(constraint, value)
    }

    fn validator() -> CspValidator {
        CspValidator::new(Arc::new(Catalog::default()))
    }

    #[test]
    fn test_satisfied() {
        let r = validator().validate(&[spec("analog_input", "8"), spec("digital_output", "4")]);
        assert!(r.valid);
        assert_eq!(r.confidence, 1.0);
        assert_eq!(r.get("solutions_count").unwrap(), 1);
        assert_eq!(r.get("best_solution").unwrap()["total_io"], 12);
    }

    #[test]
    fn test_exceeds_maximum() {
        let r = validator().validate(&[spec("analog_input", "32")]);
        assert!(!r.valid);
        assert_eq!(r.confidence, 0.0);
        let violations = CspViolation::list_from(&r);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].constraint, "analog_input");
        assert_eq!(violations[0].violation, "exceeds_maximum");
        assert_eq!(violations[0].max_allowed, Some(16.0));
        assert_eq!(violations[0].value, Some(32.0));
        assert!(r.get("best_solution").unwrap().is_null());
    }

    #[test]
    fn test_dependency_rules() {
        let r = validator().validate(&[
            spec("analog_input", "16"),
            spec("digital_output", "20"),
            spec("power_budget", "5"),
        ]);
        let names: Vec<String> = CspViolation::list_from(&r).into_iter().map(|v| v.violation).collect();
        assert_eq!(names, vec!["exceeds_controller_capacity".to_string()]);

        let mut catalog = Catalog::default();
        catalog.constraints.clear();
        let r = CspValidator::new(Arc::new(catalog))
            .validate(&[spec("analog_input", "20"), spec("power", "8")]);
        let v = CspViolation::list_from(&r);
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].constraint, "power_vs_io");
        assert_eq!(v[0].severity, "absolute");
    }

    #[test]
    fn test_total_io_saturates_on_huge_counts() {
        let r = validator().validate(&[
            spec("analog_input", "9223372036854775807"),
            spec("digital_output", "9223372036854775807"),
        ]);
        assert!(!r.valid);
        assert_eq!(r.get("variables").unwrap()["total_io"], i64::MAX);
        let names: Vec<String> = CspViolation::list_from(&r).into_iter().map(|v| v.violation).collect();
        assert!(names.contains(&"exceeds_controller_capacity".to_string()));
    }

    #[test]
    fn test_controller_ceiling_boundary() {
        let mut catalog = Catalog::default();
        catalog.constraints.clear();
        let v = CspValidator::new(Arc::new(catalog));
        assert!(v.validate(&[spec("analog_input", "16"), spec("digital_output", "16")]).valid);

        let r = v.validate(&[spec("analog_input", "16"), spec("digital_output", "17")]);
        let violations = CspViolation::list_from(&r);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].value, Some(33.0));
        assert_eq!(violations[0].max_allowed, Some(32.0));
    }

    #[test]
    fn test_min_and_required_rules() {
        let mut catalog = Catalog::default();
        let mut sys = BTreeMap::new();
        sys.insert(
            "memory".to_string(),
            ConstraintRule { operator: RuleOperator::Min, value: Some(2.0), description: String::new() },
        );
        sys.insert(
            "certification".to_string(),
            ConstraintRule { operator: RuleOperator::Required, value: None, description: String::new() },
        );
        catalog.constraints.insert("system".to_string(), sys);
        let v = CspValidator::new(Arc::new(catalog));

        let r = v.validate(&[spec("memory", "1"), spec("certification", " ")]);
        let violations = CspViolation::list_from(&r);
        assert_eq!(violations.len(), 2);
        assert_eq!(violations[0].violation, "below_minimum");
        assert_eq!(violations[0].min_required, Some(2.0));
        assert_eq!(violations[1].violation, "required_missing");

        assert!(v.validate(&[spec("certification", "CE")]).valid);
    }
}
