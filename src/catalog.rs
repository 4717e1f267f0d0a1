//! Product and constraint catalog.
//!
//! One `Catalog` is built at start-up (from a file or the built-in defaults)
//! and shared by `Arc` with the validators and the fallback handler.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::{load_structured, ConfigError};

/// A controller that hosts I/O modules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Controller {
    pub id: String,
    /// Total I/O points the controller can serve.
    pub max_io: u32,
    pub price: f64,
    #[serde(default)]
    pub operating_temp_min_c: i64,
    #[serde(default = "default_temp_max")]
    pub operating_temp_max_c: i64,
}

fn default_temp_max() -> i64 { 85 }

/// An I/O expansion module serving one kind of channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoModule {
    pub id: String,
    /// Channel kind served, e.g. `analog_input`.
    pub serves: String,
    pub channels: u32,
    pub price: f64,
    #[serde(default)]
    pub description: String,
}

/// Comparison applied by a constraint rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOperator {
    Max,
    Min,
    Exact,
    Required,
}

/// A single rule from the constraint pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintRule {
    pub operator: RuleOperator,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub description: String,
}

impl ConstraintRule {
    pub fn max(value: f64, description: &str) -> Self {
        Self {
            operator: RuleOperator::Max,
            value: Some(value),
            description: description.to_string(),
        }
    }
}

/// Pricing rules applied to a bill of materials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingRules {
    /// Price used for parts with no catalog entry.
    #[serde(default = "default_fallback_price")]
    pub fallback_price: f64,
    #[serde(default = "default_bulk_module_count")]
    pub bulk_module_count: u32,
    #[serde(default = "default_bulk_module_discount")]
    pub bulk_module_discount: f64,
    #[serde(default = "default_large_order_threshold")]
    pub large_order_threshold: f64,
    #[serde(default = "default_large_order_discount")]
    pub large_order_discount: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_fallback_price() -> f64 { 500.0 }
fn default_bulk_module_count() -> u32 { 3 }
fn default_bulk_module_discount() -> f64 { 0.05 }
fn default_large_order_threshold() -> f64 { 3000.0 }
fn default_large_order_discount() -> f64 { 0.10 }
fn default_currency() -> String { "USD".to_string() }

impl Default for PricingRules {
    fn default() -> Self {
        Self {
            fallback_price: default_fallback_price(),
            bulk_module_count: default_bulk_module_count(),
            bulk_module_discount: default_bulk_module_discount(),
            large_order_threshold: default_large_order_threshold(),
            large_order_discount: default_large_order_discount(),
            currency: default_currency(),
        }
    }
}

impl PricingRules {
    /// Apply bulk and large-order discounts, rounded to cents.
    pub fn apply(&self, base_cost: f64, module_count: u32) -> f64 {
        let mut price = base_cost;
        if module_count >= self.bulk_module_count {
            price *= 1.0 - self.bulk_module_discount;
        }
        if base_cost > self.large_order_threshold {
            price *= 1.0 - self.large_order_discount;
        }
        round_cents(price)
    }
}

/// Hard system limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogLimits {
    #[serde(default = "default_max_total_io")]
    pub max_total_io: u32,
    /// Largest I/O count any single controller can serve.
    #[serde(default = "default_controller_io_ceiling")]
    pub controller_io_ceiling: u32,
}

fn default_max_total_io() -> u32 { 256 }
fn default_controller_io_ceiling() -> u32 { 32 }

impl Default for CatalogLimits {
    fn default() -> Self {
        Self {
            max_total_io: default_max_total_io(),
            controller_io_ceiling: default_controller_io_ceiling(),
        }
    }
}

/// Controllers, modules, constraint pool, pricing and limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub controllers: Vec<Controller>,
    #[serde(default)]
    pub modules: Vec<IoModule>,
    /// Category → rule id → rule.
    #[serde(default)]
    pub constraints: BTreeMap<String, BTreeMap<String, ConstraintRule>>,
    #[serde(default)]
    pub pricing: PricingRules,
    #[serde(default)]
    pub limits: CatalogLimits,
}

impl Default for Catalog {
    fn default() -> Self {
        let controllers = vec![
            Controller {
                id: "UNO-137".into(),
                max_io: 16,
                price: 800.0,
                operating_temp_min_c: -20,
                operating_temp_max_c: 60,
            },
            Controller {
                id: "UNO-148".into(),
                max_io: 32,
                price: 1200.0,
                operating_temp_min_c: -40,
                operating_temp_max_c: 70,
            },
        ];
        let modules = vec![
            IoModule {
                id: "ADAM-4017".into(),
                serves: "analog_input".into(),
                channels: 8,
                price: 250.0,
                description: "8-channel analog input".into(),
            },
            IoModule {
                id: "ADAM-4050".into(),
                serves: "digital_output".into(),
                channels: 16,
                price: 200.0,
                description: "16-channel digital I/O".into(),
            },
        ];

        let mut io_limits = BTreeMap::new();
        io_limits.insert("analog_input".into(), ConstraintRule::max(16.0, "analog inputs per system"));
        io_limits.insert("analog_output".into(), ConstraintRule::max(8.0, "analog outputs per system"));
        io_limits.insert("digital_input".into(), ConstraintRule::max(32.0, "digital inputs per system"));
        io_limits.insert("digital_output".into(), ConstraintRule::max(32.0, "digital outputs per system"));
        let mut constraints = BTreeMap::new();
        constraints.insert("io_limits".to_string(), io_limits);

        Self {
            controllers,
            modules,
            constraints,
            pricing: PricingRules::default(),
            limits: CatalogLimits::default(),
        }
    }
}

impl Catalog {
    /// Load a catalog from a YAML or JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let catalog: Self = load_structured(path.as_ref())?;
        log::debug!(
            "[Catalog] loaded {} controllers, {} modules from {}",
            catalog.controllers.len(),
            catalog.modules.len(),
            path.as_ref().display()
        );
        Ok(catalog)
    }

    pub fn controller(&self, id: &str) -> Option<&Controller> {
        self.controllers.iter().find(|c| c.id == id)
    }

    pub fn module(&self, id: &str) -> Option<&IoModule> {
        self.modules.iter().find(|m| m.id == id)
    }

    /// Module serving a channel kind.
    pub fn module_for(&self, kind: &str) -> Option<&IoModule> {
        self.modules.iter().find(|m| m.serves == kind)
    }

    /// Catalog price of any part, or the fallback price.
    pub fn price_of(&self, part_id: &str) -> f64 {
        self.controller(part_id)
            .map(|c| c.price)
            .or_else(|| self.module(part_id).map(|m| m.price))
            .filter(|p| *p > 0.0)
            .unwrap_or(self.pricing.fallback_price)
    }

    /// Smallest controller whose capacity covers `total_io`.
    pub fn smallest_controller_for(&self, total_io: u32) -> Option<&Controller> {
        self.controllers
            .iter()
            .filter(|c| c.max_io >= total_io)
            .min_by_key(|c| c.max_io)
    }

    pub fn largest_controller(&self) -> Option<&Controller> {
        self.controllers.iter().max_by_key(|c| c.max_io)
    }

    /// First rule whose id and `constraint` contain one another
    /// (case-insensitive), scanning categories in order.
    pub fn find_rule(&self, constraint: &str) -> Option<(&str, &ConstraintRule)> {
        let needle = constraint.to_ascii_lowercase();
        if needle.is_empty() {
            return None;
        }
        self.constraints.values().flat_map(|rules| rules.iter()).find_map(|(id, rule)| {
            let id_lower = id.to_ascii_lowercase();
            (id_lower.contains(&needle) || needle.contains(&id_lower)).then(|| (id.as_str(), rule))
        })
    }
}

pub(crate) fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
