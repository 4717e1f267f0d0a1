//! Degraded responses for unavailable validators.
//!
//! When a validator phase is rejected by its breaker or fails outright, the
//! pipeline substitutes a response from here. Responses start from a canned
//! default per validator, are customized from the request where possible,
//! and are cached by `"{validator_id}:{md5(input)}"` so repeated identical
//! failures return the same answer. Cache entries only leave via
//! [`FallbackHandler::clear_cache`].

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use md5::{Digest, Md5};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::catalog::Catalog;
use crate::utilities::string_utils::first_integer;

/// Snapshot of the response cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub cache_size: usize,
    /// Distinct validator ids with at least one cached response, sorted.
    pub validators_cached: Vec<String>,
}

/// Produces and caches fallback responses.
#[derive(Debug)]
pub struct FallbackHandler {
    catalog: Arc<Catalog>,
    defaults: HashMap<&'static str, Value>,
    cache: RwLock<HashMap<String, Value>>,
}

impl Default for FallbackHandler {
    fn default() -> Self {
        Self::new(Arc::new(Catalog::default()))
    }
}

impl FallbackHandler {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self {
            catalog,
            defaults: default_responses(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Fallback response for `validator_id`, customized from `input`.
    ///
    /// Every response carries `fallback: true`, `agent_id` and `timestamp`;
    /// responses served from the cache also carry `cached: true` and
    /// `cache_time` (the original timestamp).
    pub fn get_fallback_response(&self, validator_id: &str, input: Option<&Value>) -> Value {
        let key = cache_key(validator_id, input);

        if let Some(hit) = self.cache.read().get(&key) {
            let mut response = hit.clone();
            if let Value::Object(obj) = &mut response {
                let cache_time = obj.get("timestamp").cloned().unwrap_or(Value::Null);
                obj.insert("cached".into(), Value::Bool(true));
                obj.insert("cache_time".into(), cache_time);
            }
            log::debug!("[FallbackHandler] cache hit for {}", validator_id);
            return response;
        }

        let mut response = self
            .defaults
            .get(validator_id)
            .cloned()
            .unwrap_or_else(|| {
                json!({
                    "valid": false,
                    "confidence": 0.0,
                    "message": format!("Validator {} unavailable", validator_id),
                })
            });

        if let (Some(input), Value::Object(obj)) = (input, &mut response) {
            match validator_id {
                "technical_validator" => self.customize_technical(obj, input),
                "commercial_validator" => self.customize_commercial(obj, input),
                "decision_coordinator" => customize_decision(obj, input),
                _ => {}
            }
        }

        if let Value::Object(obj) = &mut response {
            obj.insert("fallback".into(), Value::Bool(true));
            obj.insert("agent_id".into(), Value::String(validator_id.to_string()));
            obj.insert("timestamp".into(), Value::String(Utc::now().to_rfc3339()));
        }

        self.cache.write().insert(key, response.clone());
        response
    }

    /// Suggest the smallest controller covering the I/O named in the
    /// specifications (the largest when none covers it).
    fn customize_technical(&self, obj: &mut Map<String, Value>, input: &Value) {
        let total_io: i64 = input
            .get("specifications")
            .and_then(Value::as_array)
            .map(|specs| {
                specs
                    .iter()
                    .filter(|spec| {
                        let constraint = spec
                            .get("constraint")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_ascii_lowercase();
                        is_io_constraint(&constraint)
                    })
                    .filter_map(|spec| spec.get("value").and_then(value_integer))
                    .filter(|n| *n > 0)
                    .fold(0i64, i64::saturating_add)
            })
            .unwrap_or(0);

        let needed = u32::try_from(total_io).unwrap_or(u32::MAX);
        let controller = self
            .catalog
            .smallest_controller_for(needed)
            .or_else(|| self.catalog.largest_controller());

        if let Some(controller) = controller {
            let suggestion = json!([{ "id": controller.id, "capacity": controller.max_io }]);
            match obj.get_mut("controller").and_then(Value::as_object_mut) {
                Some(section) => {
                    section.insert("suitable_controllers".into(), suggestion);
                }
                None => {
                    obj.insert(
                        "controller".into(),
                        json!({ "valid": true, "suitable_controllers": suggestion }),
                    );
                }
            }
        }
        obj.insert("io_estimate".into(), json!(total_io));
    }

    /// Price the first suggested controller from the catalog.
    fn customize_commercial(&self, obj: &mut Map<String, Value>, input: &Value) {
        let controller_id = input
            .pointer("/technical_validation/controller/suitable_controllers/0/id")
            .and_then(Value::as_str);
        let estimate = match controller_id {
            Some(id) => self.catalog.price_of(id),
            None => 1000.0,
        };
        if let Some(pricing) = obj.get_mut("pricing").and_then(Value::as_object_mut) {
            pricing.insert("final_price".into(), json!(estimate));
            pricing.insert("currency".into(), json!(self.catalog.pricing.currency));
        }
    }

    /// Drop every cached response.
    pub fn clear_cache(&self) {
        let mut cache = self.cache.write();
        let n = cache.len();
        cache.clear();
        log::debug!("[FallbackHandler] cleared {} cached responses", n);
    }

    pub fn cache_stats(&self) -> CacheStats {
        let cache = self.cache.read();
        let validators: BTreeSet<String> = cache
            .keys()
            .filter_map(|k| k.split_once(':').map(|(id, _)| id.to_string()))
            .collect();
        CacheStats {
            cache_size: cache.len(),
            validators_cached: validators.into_iter().collect(),
        }
    }
}

fn customize_decision(obj: &mut Map<String, Value>, input: &Value) {
    match input.get("action_type").and_then(Value::as_str) {
        Some("generate_abq") => {
            obj.insert(
                "question".into(),
                json!({
                    "question": "Please choose the best option for your needs:",
                    "option_a": { "label": "Option A", "description": "First choice" },
                    "option_b": { "label": "Option B", "description": "Second choice" },
                }),
            );
        }
        Some("check_autofill") => {
            obj.insert("triggered".into(), Value::Bool(false));
            obj.insert(
                "message".into(),
                json!("Autofill unavailable - manual entry required"),
            );
        }
        _ => {}
    }
}

fn is_io_constraint(constraint: &str) -> bool {
    constraint.contains("input")
        || constraint.contains("output")
        || constraint.contains("_io")
        || constraint.starts_with("io")
}

/// Integer from a JSON number or from the first digits in a string.
fn value_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => first_integer(s),
        _ => None,
    }
}

fn cache_key(validator_id: &str, input: Option<&Value>) -> String {
    let canonical = input
        .map(|v| serde_json::to_string(v).unwrap_or_default())
        .unwrap_or_default();
    let mut hasher = Md5::new();
    hasher.update(canonical.as_bytes());
    format!("{}:{:x}", validator_id, hasher.finalize())
}

fn default_responses() -> HashMap<&'static str, Value> {
    let mut defaults = HashMap::new();
    defaults.insert(
        "technical_validator",
        json!({
            "valid": false,
            "confidence": 0.1,
            "message": "Technical validation unavailable - using defaults",
            "controller": {
                "valid": true,
                "suitable_controllers": [{ "id": "UNO-137", "capacity": 16 }],
            },
            "modules": { "valid": true, "modules_required": [] },
        }),
    );
    defaults.insert(
        "commercial_validator",
        json!({
            "valid": true,
            "confidence": 0.5,
            "message": "Commercial validation unavailable - estimated pricing",
            "pricing": { "final_price": 1000, "currency": "USD", "confidence": 0.5 },
        }),
    );
    defaults.insert(
        "csp_validator",
        json!({
            "valid": true,
            "confidence": 0.6,
            "violations": [],
            "message": "constraints unavailable, assume satisfied",
        }),
    );
    defaults.insert(
        "decision_coordinator",
        json!({
            "type": "fallback_response",
            "message": "Decision coordinator unavailable - continue with manual selection",
        }),
    );
    defaults
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
