//! Technical feasibility: controller capacity, module sizing and
//! specification sanity.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use super::types::{PhaseResult, Specification, ValidationContext};
use super::validator::{specifications_from, Validator, ValidatorError};
use crate::catalog::Catalog;
use crate::utilities::string_utils::{first_integer, parse_number};

/// Confidence reported by a passing sub-check.
const CONTROLLER_CONFIDENCE: f64 = 0.95;
const MODULE_CONFIDENCE: f64 = 0.9;

/// I/O and environment needs extracted from a list of specifications.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IoRequirements {
    pub analog_input: u32,
    pub analog_output: u32,
    pub digital_input: u32,
    pub digital_output: u32,
    pub total_io: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_operating_temp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_operating_temp: Option<i64>,
}

impl IoRequirements {
    /// Sum I/O counts per channel kind. `analog_io` counts as analog
    /// input and `digital_io` as digital input.
    ///
    /// Non-numeric or negative counts are skipped here and reported by the
    /// sanity check.
    pub fn extract(specs: &[Specification]) -> Self {
        let mut req = Self::default();
        for spec in specs {
            let constraint = spec.constraint.to_ascii_lowercase();
            if constraint.contains("operating_temperature_min") {
                req.min_operating_temp = first_integer(&spec.value);
                continue;
            }
            if constraint.contains("operating_temperature_max") {
                req.max_operating_temp = first_integer(&spec.value);
                continue;
            }
            let Some(kind) = io_kind(&constraint) else {
                continue;
            };
            let Some(count) = io_count(&spec.value) else {
                continue;
            };
            let slot = match kind {
                "analog_input" => &mut req.analog_input,
                "analog_output" => &mut req.analog_output,
                "digital_input" => &mut req.digital_input,
                _ => &mut req.digital_output,
            };
            *slot = slot.saturating_add(count);
        }
        // Saturate so oversized requests still trip the hard I/O limit.
        req.total_io = [req.analog_output, req.digital_input, req.digital_output]
            .into_iter()
            .fold(req.analog_input, u32::saturating_add);
        req
    }

    pub fn count_for(&self, kind: &str) -> u32 {
        match kind {
            "analog_input" => self.analog_input,
            "analog_output" => self.analog_output,
            "digital_input" => self.digital_input,
            "digital_output" => self.digital_output,
            _ => 0,
        }
    }
}

pub(crate) const IO_KINDS: [&str; 4] = ["analog_input", "analog_output", "digital_input", "digital_output"];

fn io_kind(constraint: &str) -> Option<&'static str> {
    if constraint.contains("analog_input") || constraint.contains("analog_io") {
        Some("analog_input")
    } else if constraint.contains("analog_output") {
        Some("analog_output")
    } else if constraint.contains("digital_input") || constraint.contains("digital_io") {
        Some("digital_input")
    } else if constraint.contains("digital_output") {
        Some("digital_output")
    } else {
        None
    }
}

fn io_count(value: &str) -> Option<u32> {
    parse_number(value)
        .filter(|n| *n >= 0.0 && n.fract() == 0.0)
        .and_then(|n| u32::try_from(n as i64).ok())
}

/// Checks a requirement set against the controller and module catalog.
pub struct TechnicalValidator {
    catalog: Arc<Catalog>,
}

impl TechnicalValidator {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    /// Validate specifications directly.
    pub fn validate(&self, specs: &[Specification]) -> PhaseResult {
        let req = IoRequirements::extract(specs);
        let max_total = self.catalog.limits.max_total_io;

        if req.total_io > max_total {
            log::warn!(
                "[TechnicalValidator] {} I/O points exceed the system maximum of {}",
                req.total_io,
                max_total
            );
            let message = format!(
                "Total I/O count {} exceeds maximum supported {}",
                req.total_io, max_total
            );
            return PhaseResult::new(false, 0.0)
                .with("error", json!(message))
                .with("io_requirements", json!(req))
                .with("controller", json!({ "valid": false, "confidence": 0.0, "message": message }))
                .with("modules", json!({ "valid": false, "confidence": 0.0, "modules_required": [] }))
                .with("constraints", json!({ "valid": false, "confidence": 0.0, "violations": [] }))
                .with(
                    "conflicts",
                    json!([{ "type": "technical", "message": message, "severity": "high" }]),
                )
                .with("recommendations", json!([]));
        }

        let controller = self.check_controller(&req);
        let modules = self.check_modules(&req);
        let constraints = check_sanity(specs);

        let sections = [
            ("controller", &controller),
            ("modules", &modules),
            ("constraints", &constraints),
        ];
        let valid = sections.iter().all(|(_, r)| r.valid);
        let confidence = sections
            .iter()
            .map(|(_, r)| r.confidence)
            .fold(f64::INFINITY, f64::min);

        let conflicts: Vec<Value> = sections
            .iter()
            .filter(|(_, r)| !r.valid)
            .map(|(name, r)| {
                let severity = if r.confidence < 0.3 { "high" } else { "medium" };
                json!({
                    "type": "technical",
                    "component": name,
                    "message": r.get("message").cloned().unwrap_or_else(|| json!(format!("{} check failed", name))),
                    "severity": severity,
                })
            })
            .collect();

        let recommendations = self.recommendations(&req);
        log::debug!(
            "[TechnicalValidator] total_io={} valid={} confidence={}",
            req.total_io,
            valid,
            confidence
        );

        PhaseResult::new(valid, confidence)
            .with("io_requirements", json!(req))
            .with("controller", controller.to_value())
            .with("modules", modules.to_value())
            .with("constraints", constraints.to_value())
            .with("conflicts", Value::Array(conflicts))
            .with("recommendations", json!(recommendations))
    }

    fn check_controller(&self, req: &IoRequirements) -> PhaseResult {
        let suitable: Vec<Value> = self
            .catalog
            .controllers
            .iter()
            .filter(|c| c.max_io >= req.total_io)
            .filter(|c| req.min_operating_temp.map_or(true, |t| c.operating_temp_min_c <= t))
            .filter(|c| req.max_operating_temp.map_or(true, |t| c.operating_temp_max_c >= t))
            .map(|c| json!({ "id": c.id, "capacity": c.max_io, "price": c.price }))
            .collect();

        if suitable.is_empty() {
            PhaseResult::new(false, 0.0)
                .with("suitable_controllers", json!([]))
                .with(
                    "message",
                    json!(format!(
                        "No controller supports {} I/O points within the required temperature range",
                        req.total_io
                    )),
                )
        } else {
            PhaseResult::new(true, CONTROLLER_CONFIDENCE).with("suitable_controllers", Value::Array(suitable))
        }
    }

    fn check_modules(&self, req: &IoRequirements) -> PhaseResult {
        let mut required = Vec::new();
        let mut unserved = Vec::new();
        for kind in IO_KINDS {
            let count = req.count_for(kind);
            if count == 0 {
                continue;
            }
            match self.catalog.module_for(kind) {
                Some(module) if module.channels > 0 => {
                    required.push(json!({
                        "type": module.id,
                        "quantity": count.div_ceil(module.channels),
                        "purpose": module.description,
                    }));
                }
                _ => unserved.push(kind),
            }
        }
        PhaseResult::new(true, MODULE_CONFIDENCE)
            .with("modules_required", Value::Array(required))
            .with("unserved_channels", json!(unserved))
    }

    fn recommendations(&self, req: &IoRequirements) -> Vec<String> {
        let mut out = Vec::new();
        let smallest = self.catalog.controllers.iter().map(|c| c.max_io).min();
        if let Some(smallest) = smallest {
            if req.total_io > smallest {
                if let Some(c) = self.catalog.smallest_controller_for(req.total_io) {
                    out.push(format!("Consider {} for higher I/O capacity", c.id));
                }
            }
        }
        if let Some(module) = self.catalog.module_for("analog_input") {
            if req.analog_input > module.channels {
                out.push(format!("Multiple {} modules will be required", module.id));
            }
        }
        out
    }
}

/// I/O and temperature values must be numeric; counts must not be negative.
fn check_sanity(specs: &[Specification]) -> PhaseResult {
    let mut violations = Vec::new();
    for spec in specs {
        let constraint = spec.constraint.to_ascii_lowercase();
        if io_kind(&constraint).is_some() && io_count(&spec.value).is_none() {
            violations.push(format!(
                "{}: '{}' is not a valid I/O count",
                spec.constraint, spec.value
            ));
        } else if constraint.contains("operating_temperature") && first_integer(&spec.value).is_none() {
            violations.push(format!(
                "{}: '{}' is not a temperature",
                spec.constraint, spec.value
            ));
        }
    }
    if violations.is_empty() {
        PhaseResult::new(true, 1.0).with("violations", json!([]))
    } else {
        PhaseResult::new(false, 0.5)
            .with("message", json!(violations.join("; ")))
            .with("violations", json!(violations))
    }
}

#[async_trait]
impl Validator for TechnicalValidator {
    fn id(&self) -> &str {
        "technical_validator"
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

    fn validator() -> TechnicalValidator {
        TechnicalValidator::new(Arc::new(Catalog::default()))
    }

    fn spec(constraint: &str, value: &str) -> Specification {
        Specification::new(constraint, value)
    }

    #[test]
    fn test_extract_requirements() {
        let req = IoRequirements::extract(&[
            spec("analog_input", "8"),
            spec("digital_io", "4"),
            spec("digital_output", "4"),
            spec("operating_temperature_min", "-20C"),
            spec("memory", "4GB"),
        ]);
        assert_eq!(req.analog_input, 8);
        assert_eq!(req.digital_input, 4);
        assert_eq!(req.digital_output, 4);
        assert_eq!(req.total_io, 16);
        assert_eq!(req.min_operating_temp, Some(-20));
        assert_eq!(req.max_operating_temp, None);
    }

    #[test]
    fn test_small_system_picks_modules() {
        let r = validator().validate(&[spec("analog_input", "8"), spec("digital_output", "4")]);
        assert!(r.valid);
        assert!((r.confidence - 0.9).abs() < 1e-9);

        let controllers = r.get("controller").unwrap()["suitable_controllers"].as_array().unwrap();
        assert_eq!(controllers[0]["id"], "UNO-137");
        assert_eq!(controllers.len(), 2);

        let modules = r.get("modules").unwrap()["modules_required"].as_array().unwrap();
        assert_eq!(modules.len(), 2);
        assert_eq!(modules[0]["type"], "ADAM-4017");
        assert_eq!(modules[0]["quantity"], 1);
        assert_eq!(modules[1]["type"], "ADAM-4050");
        assert_eq!(modules[1]["purpose"], "16-channel digital I/O");
        assert!(r.get("recommendations").unwrap().as_array().unwrap().is_empty());
    }

    #[test]
    fn test_larger_system_needs_bigger_controller() {
        let r = validator().validate(&[spec("analog_input", "32")]);
        assert!(r.valid);
        let controllers = r.get("controller").unwrap()["suitable_controllers"].as_array().unwrap();
        assert_eq!(controllers.len(), 1);
        assert_eq!(controllers[0]["id"], "UNO-148");
        let modules = r.get("modules").unwrap()["modules_required"].as_array().unwrap();
        assert_eq!(modules[0]["quantity"], 4);

        let recs: Vec<String> =
            serde_json::from_value(r.get("recommendations").unwrap().clone()).unwrap();
        assert!(recs.contains(&"Consider UNO-148 for higher I/O capacity".to_string()));
        assert!(recs.contains(&"Multiple ADAM-4017 modules will be required".to_string()));
    }

    #[test]
    fn test_no_controller_for_capacity() {
        let r = validator().validate(&[spec("analog_input", "20"), spec("digital_output", "20")]);
        assert!(!r.valid);
        assert_eq!(r.confidence, 0.0);
        let conflicts = r.get("conflicts").unwrap().as_array().unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0]["severity"], "high");
    }

    #[test]
    fn test_temperature_excludes_controllers() {
        let r = validator().validate(&[
            spec("analog_input", "4"),
            spec("operating_temperature_min", "-30"),
        ]);
        let controllers = r.get("controller").unwrap()["suitable_controllers"].as_array().unwrap();
        assert_eq!(controllers.len(), 1);
        assert_eq!(controllers[0]["id"], "UNO-148");
    }

    #[test]
    fn test_over_system_maximum() {
        let r = validator().validate(&[spec("digital_output", "300")]);
        assert!(!r.valid);
        assert_eq!(r.confidence, 0.0);
        assert!(r.get("error").unwrap().as_str().unwrap().contains("300"));
        assert_eq!(r.get("conflicts").unwrap().as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_hard_limit_boundary() {
        let at_limit = validator().validate(&[spec("digital_output", "256")]);
        assert!(at_limit.get("error").is_none());
        assert_eq!(at_limit.get("io_requirements").unwrap()["total_io"], 256);

        let over = validator().validate(&[spec("digital_output", "257")]);
        assert!(!over.valid);
        assert!(over.get("error").unwrap().as_str().unwrap().contains("257"));
    }

    #[test]
    fn test_huge_counts_saturate_instead_of_wrapping() {
        let specs = [spec("analog_input", "4294967295"), spec("digital_output", "1")];
        let req = IoRequirements::extract(&specs);
        assert_eq!(req.analog_input, u32::MAX);
        assert_eq!(req.total_io, u32::MAX);

        let r = validator().validate(&specs);
        assert!(!r.valid);
        assert_eq!(r.confidence, 0.0);
        assert!(r.get("error").is_some());
    }

    #[test]
    fn test_repeated_kind_saturates() {
        let req = IoRequirements::extract(&[
            spec("analog_input", "4294967295"),
            spec("analog_io", "4294967295"),
        ]);
        assert_eq!(req.analog_input, u32::MAX);
        assert_eq!(req.total_io, u32::MAX);
    }

    #[test]
    fn test_non_numeric_count_is_a_violation() {
        let r = validator().validate(&[spec("analog_input", "several")]);
        assert!(!r.valid);
        assert!((r.confidence - 0.5).abs() < 1e-9);
        let conflicts = r.get("conflicts").unwrap().as_array().unwrap();
        assert_eq!(conflicts[0]["severity"], "medium");
        assert_eq!(conflicts[0]["component"], "constraints");
    }

    #[tokio::test]
    async fn test_process_rejects_malformed_input() {
        let v = validator();
        let err = v
            .process(&json!({"specifications": "nope"}), &ValidationContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ValidatorError::InvalidInput(_)));

        let ok = v
            .process(&json!({}), &ValidationContext::default())
            .await
            .unwrap();
        assert!(ok.valid);
    }
}
