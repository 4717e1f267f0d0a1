//! Commercial viability: pricing and budget fit of a technical result.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use super::types::{PhaseResult, ValidationContext};
use super::validator::{Validator, ValidatorError};
use crate::catalog::{round_cents, Catalog};

const COMMERCIAL_CONFIDENCE: f64 = 0.95;

/// One priced line of the bill of materials.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceLine {
    pub item: String,
    pub category: &'static str,
    pub quantity: u32,
    pub unit_price: f64,
    pub subtotal: f64,
}

/// A priced configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Quote {
    pub base_cost: f64,
    pub final_price: f64,
    pub currency: String,
    pub breakdown: Vec<PriceLine>,
    pub discount_applied: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetValidation {
    pub budget_specified: bool,
    pub budget: Option<f64>,
    pub estimated_cost: f64,
    pub within_budget: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub over_budget_amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub under_budget_amount: Option<f64>,
    pub message: String,
}

/// Prices the first suitable controller plus required modules.
pub struct CommercialValidator {
    catalog: Arc<Catalog>,
}

impl CommercialValidator {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    /// Validate a technical result against an optional budget.
    ///
    /// A budget of zero or less counts as unspecified.
    pub fn validate(&self, technical: &Value, budget: Option<f64>) -> PhaseResult {
        if !technical.get("valid").and_then(Value::as_bool).unwrap_or(false) {
            return PhaseResult::new(false, 0.0)
                .with("message", json!("Technical validation must pass first"));
        }
        let Some(controller_id) = technical
            .pointer("/controller/suitable_controllers/0/id")
            .and_then(Value::as_str)
        else {
            return PhaseResult::new(false, 0.0)
                .with("message", json!("No suitable controller to price"));
        };

        let modules: Vec<(String, u32)> = technical
            .pointer("/modules/modules_required")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|m| {
                        let id = m.get("type").and_then(Value::as_str)?;
                        let qty = m.get("quantity").and_then(Value::as_u64).unwrap_or(1);
                        Some((id.to_string(), u32::try_from(qty).unwrap_or(u32::MAX)))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let quote = self.quote(controller_id, &modules);
        let budget = budget.filter(|b| *b > 0.0);
        let budget_check = budget_validation(quote.final_price, budget);

        let mut recommendations = vec![format!("Estimated system cost: ${:.2}", quote.final_price)];
        match (budget_check.over_budget_amount, budget_check.under_budget_amount) {
            (Some(over), _) => recommendations.push(format!(
                "Configuration exceeds budget by ${:.2}. Consider alternatives.",
                over
            )),
            (None, Some(under)) => {
                recommendations.push(format!("Configuration fits budget with ${:.2} to spare", under))
            }
            _ => {}
        }

        let mut alternatives = Vec::new();
        if let (Some(budget), false) = (budget, budget_check.within_budget) {
            let total_io = technical
                .pointer("/io_requirements/total_io")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            let analog = technical
                .pointer("/io_requirements/analog_input")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            if let Some(alt) = self.minimal_alternative(total_io, analog, quote.final_price, budget) {
                alternatives.push(alt);
            }
        }

        let valid = budget.map_or(true, |_| budget_check.within_budget);
        log::debug!(
            "[CommercialValidator] {} priced at {:.2} {} (valid={})",
            controller_id,
            quote.final_price,
            quote.currency,
            valid
        );

        PhaseResult::new(valid, COMMERCIAL_CONFIDENCE)
            .with("pricing", json!(quote))
            .with("budget_validation", json!(budget_check))
            .with("alternatives", Value::Array(alternatives))
            .with("recommendations", json!(recommendations))
    }

    /// Price a controller and module list with the catalog's discount rules.
    pub fn quote(&self, controller_id: &str, modules: &[(String, u32)]) -> Quote {
        let controller_price = self.catalog.price_of(controller_id);
        let mut breakdown = vec![PriceLine {
            item: controller_id.to_string(),
            category: "controller",
            quantity: 1,
            unit_price: controller_price,
            subtotal: controller_price,
        }];
        let mut module_count = 0u32;
        for (id, qty) in modules {
            let unit = self.catalog.price_of(id);
            module_count = module_count.saturating_add(*qty);
            breakdown.push(PriceLine {
                item: id.clone(),
                category: "io_module",
                quantity: *qty,
                unit_price: unit,
                subtotal: round_cents(unit * f64::from(*qty)),
            });
        }
        let base_cost = round_cents(breakdown.iter().map(|l| l.subtotal).sum());
        let final_price = self.catalog.pricing.apply(base_cost, module_count);
        Quote {
            base_cost,
            final_price,
            currency: self.catalog.pricing.currency.clone(),
            breakdown,
            discount_applied: round_cents(base_cost - final_price),
            confidence: 1.0,
        }
    }

    /// Cheapest controller with analog modules only, offered when it fits
    /// the budget and the I/O fits the smallest controller.
    fn minimal_alternative(&self, total_io: u64, analog: u64, current: f64, budget: f64) -> Option<Value> {
        let smallest = self.catalog.controllers.iter().min_by_key(|c| c.max_io)?;
        if total_io > u64::from(smallest.max_io) {
            return None;
        }
        let mut modules = Vec::new();
        if let Some(m) = self.catalog.module_for("analog_input") {
            if analog > 0 && m.channels > 0 {
                let qty = u32::try_from(analog).unwrap_or(u32::MAX).div_ceil(m.channels);
                modules.push((m.id.clone(), qty));
            }
        }
        let estimate = self.quote(&smallest.id, &modules).final_price;
        (estimate <= budget).then(|| {
            json!({
                "description": format!("Use {} with minimal modules", smallest.id),
                "estimated_cost": estimate,
                "savings": round_cents(current - estimate),
            })
        })
    }
}

fn budget_validation(estimated_cost: f64, budget: Option<f64>) -> BudgetValidation {
    match budget {
        None => BudgetValidation {
            budget_specified: false,
            budget: None,
            estimated_cost,
            within_budget: true,
            over_budget_amount: None,
            under_budget_amount: None,
            message: "No budget specified".to_string(),
        },
        Some(budget) if estimated_cost <= budget => BudgetValidation {
            budget_specified: true,
            budget: Some(budget),
            estimated_cost,
            within_budget: true,
            over_budget_amount: None,
            under_budget_amount: Some(round_cents(budget - estimated_cost)),
            message: "Configuration is within budget".to_string(),
        },
        Some(budget) => BudgetValidation {
            budget_specified: true,
            budget: Some(budget),
            estimated_cost,
            within_budget: false,
            over_budget_amount: Some(round_cents(estimated_cost - budget)),
            under_budget_amount: None,
            message: "Configuration exceeds budget".to_string(),
        },
    }
}

#[async_trait]
impl Validator for CommercialValidator {
    fn id(&self) -> &str {
        "commercial_validator"
    }

    async fn process(
        &self,
        input: &Value,
        context: &ValidationContext,
    ) -> Result<PhaseResult, ValidatorError> {
        let technical = input.get("technical_validation").ok_or_else(|| {
            ValidatorError::InvalidInput("missing technical_validation".to_string())
        })?;
        let budget = input
            .get("budget")
            .and_then(Value::as_f64)
            .or(context.budget);
        Ok(self.validate(technical, budget))
    }
}
