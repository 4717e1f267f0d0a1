//! Multi-round validation pipeline.
//!
//! Each round runs technical → commercial → constraint validation, each
//! phase behind its own circuit breaker with a fallback response when the
//! breaker rejects or the validator fails. Rounds repeat, with
//! specifications tightened from constraint violations, until the round
//! confidence reaches the consensus threshold or the round limit is hit.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};

use super::commercial::CommercialValidator;
use super::confidence::{round3, ConfidenceAggregator};
use super::csp::CspValidator;
use super::technical::TechnicalValidator;
use super::types::{
    CspViolation, Phase, PhaseResult, PipelineResult, SessionData, SolutionConflict,
    SolutionSummary, Specification, ValidationContext, ValidationRoundResult,
};
use super::validator::Validator;
use crate::catalog::Catalog;
use crate::config::PipelineConfig;
use crate::resilience::{CacheStats, CallError, CircuitBreaker, CircuitBreakerStatus, FallbackHandler};
use crate::utilities::string_utils::format_bound;
use crate::utilities::Shutdown;

/// Snapshot returned by [`ValidationPipeline::get_pipeline_status`].
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub circuit_breakers: BTreeMap<String, CircuitBreakerStatus>,
    pub cache_stats: CacheStats,
    /// When the constraint phase last ran.
    pub last_validation: Option<DateTime<Utc>>,
}

struct Stage {
    validator: Arc<dyn Validator>,
    breaker: CircuitBreaker,
}

impl Stage {
    fn new(validator: Arc<dyn Validator>, phase: Phase, config: &PipelineConfig) -> Self {
        Self {
            validator,
            breaker: CircuitBreaker::with_config(phase.validator_id(), &config.breaker),
        }
    }
}

pub struct ValidationPipeline {
    technical: Stage,
    commercial: Stage,
    csp: Stage,
    fallback: FallbackHandler,
    aggregator: ConfidenceAggregator,
    config: PipelineConfig,
    last_validation: Mutex<Option<DateTime<Utc>>>,
}

impl ValidationPipeline {
    /// Pipeline over the catalog-driven validators.
    pub fn new(catalog: Arc<Catalog>, config: PipelineConfig) -> Self {
        Self::with_validators(
            catalog.clone(),
            config,
            Arc::new(TechnicalValidator::new(catalog.clone())),
            Arc::new(CommercialValidator::new(catalog.clone())),
            Arc::new(CspValidator::new(catalog)),
        )
    }

    /// Pipeline over caller-supplied validators. The catalog only feeds the
    /// fallback handler.
    pub fn with_validators(
        catalog: Arc<Catalog>,
        config: PipelineConfig,
        technical: Arc<dyn Validator>,
        commercial: Arc<dyn Validator>,
        csp: Arc<dyn Validator>,
    ) -> Self {
        Self {
            technical: Stage::new(technical, Phase::Technical, &config),
            commercial: Stage::new(commercial, Phase::Commercial, &config),
            csp: Stage::new(csp, Phase::Csp, &config),
            fallback: FallbackHandler::new(catalog),
            aggregator: ConfidenceAggregator::from_weights(&config.weights),
            config,
            last_validation: Mutex::new(None),
        }
    }

    fn stage(&self, phase: Phase) -> &Stage {
        match phase {
            Phase::Technical => &self.technical,
            Phase::Commercial => &self.commercial,
            Phase::Csp => &self.csp,
        }
    }

    pub fn breaker(&self, phase: Phase) -> &CircuitBreaker {
        &self.stage(phase).breaker
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn weight(&self, phase: Phase) -> f64 {
        match phase {
            Phase::Technical => self.config.weights.technical,
            Phase::Commercial => self.config.weights.commercial,
            Phase::Csp => self.config.weights.csp,
        }
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub async fn validate(
        &self,
        specifications: &[Specification],
        context: &ValidationContext,
    ) -> PipelineResult {
        self.validate_with_shutdown(specifications, context, &Shutdown::new()).await
    }

    /// Like [`validate`](Self::validate), but stops before starting another
    /// round once `shutdown` is triggered.
    pub async fn validate_with_shutdown(
        &self,
        specifications: &[Specification],
        context: &ValidationContext,
        shutdown: &Shutdown,
    ) -> PipelineResult {
        let max_rounds = self.config.max_rounds.max(1);
        let mut specs = specifications.to_vec();
        let mut rounds = Vec::new();
        let mut round_no = 1;

        let (final_result, consensus_achieved) = loop {
            let result = self.run_round(round_no, &specs, context).await;
            log::info!(
                "[ValidationPipeline] round {} valid={} confidence={:.3}{}",
                round_no,
                result.valid,
                result.confidence,
                if result.fallback_used { " (fallback)" } else { "" }
            );

            let consensus = result.confidence >= self.config.consensus_threshold;
            let stop = if consensus {
                log::info!("[ValidationPipeline] consensus reached in round {}", round_no);
                true
            } else if round_no >= max_rounds {
                true
            } else if shutdown.is_triggered() {
                log::info!("[ValidationPipeline] shutdown requested, stopping after round {}", round_no);
                true
            } else {
                false
            };

            if !stop {
                specs = refine_specifications(&specs, &result);
            }
            rounds.push(result.clone());
            if stop {
                break (result, consensus);
            }
            round_no += 1;
        };

        let scores: BTreeMap<String, f64> = Phase::ALL
            .iter()
            .filter_map(|p| final_result.phase(*p).map(|r| (p.as_str().to_string(), r.confidence)))
            .collect();
        let series: Vec<f64> = rounds.iter().map(|r| r.confidence).collect();

        PipelineResult {
            fallback_used: rounds.iter().any(|r| r.fallback_used),
            circuit_breaker_status: self.breaker_statuses(),
            confidence_analysis: self.aggregator.aggregate(&scores),
            confidence_trend: ConfidenceAggregator::temporal_trend(&series),
            consensus_achieved,
            rounds,
            final_result,
        }
    }

    async fn run_round(
        &self,
        round_no: u32,
        specs: &[Specification],
        context: &ValidationContext,
    ) -> ValidationRoundResult {
        let mut round = ValidationRoundResult::new(round_no, specs.to_vec());
        let spec_input = json!({ "specifications": specs });

        let technical = self.run_phase(Phase::Technical, &spec_input, context).await;
        let technical_ok = technical.valid || technical.fallback;
        let technical_value = technical.to_value();
        round.fallback_used |= technical.fallback;
        round.set_phase(Phase::Technical, technical);

        if !technical_ok {
            round.valid = false;
            round.confidence = self.round_confidence(&round);
            log::debug!(
                "[ValidationPipeline] round {} stopped after technical phase",
                round_no
            );
            return round;
        }

        let commercial_input = json!({
            "technical_validation": technical_value,
            "budget": context.budget,
        });
        let commercial = self.run_phase(Phase::Commercial, &commercial_input, context).await;
        round.fallback_used |= commercial.fallback;
        round.set_phase(Phase::Commercial, commercial);

        *self.last_validation.lock() = Some(Utc::now());
        let csp = self.run_phase(Phase::Csp, &spec_input, context).await;
        round.fallback_used |= csp.fallback;
        round.set_phase(Phase::Csp, csp);

        round.valid = Phase::ALL
            .iter()
            .all(|p| round.phase(*p).map_or(false, |r| r.valid));
        round.confidence = self.round_confidence(&round);
        round
    }

    /// Run one phase through its breaker, substituting the fallback
    /// response on rejection or failure.
    async fn run_phase(&self, phase: Phase, input: &Value, context: &ValidationContext) -> PhaseResult {
        let stage = self.stage(phase);
        match stage.breaker.call(|| stage.validator.process(input, context)).await {
            Ok(result) => result,
            Err(err) => {
                match &err {
                    CallError::Rejected { .. } => {
                        log::warn!("[ValidationPipeline] {} breaker open, using fallback", phase)
                    }
                    CallError::Failed(e) => {
                        log::warn!("[ValidationPipeline] {} failed: {}, using fallback", phase, e)
                    }
                }
                let response = self.fallback.get_fallback_response(phase.validator_id(), Some(input));
                let mut result = PhaseResult::from_value(response);
                result.fallback = true;
                result
            }
        }
    }

    /// Weighted confidence over the phases present; fallback phases are
    /// discounted.
    fn round_confidence(&self, round: &ValidationRoundResult) -> f64 {
        let mut total = 0.0;
        let mut weight = 0.0;
        for phase in Phase::ALL {
            if let Some(result) = round.phase(phase) {
                let w = self.weight(phase);
                let confidence = if result.fallback {
                    result.confidence * self.config.fallback_discount
                } else {
                    result.confidence
                };
                total += confidence * w;
                weight += w;
            }
        }
        if weight > 0.0 {
            round3(total / weight)
        } else {
            0.0
        }
    }

    // -----------------------------------------------------------------------
    // Session-level entry point and maintenance
    // -----------------------------------------------------------------------

    /// Validate a session and flatten the final round into a summary with
    /// extracted conflicts.
    pub async fn validate_complete_solution(&self, session: &SessionData) -> SolutionSummary {
        let context = session.context();
        let result = self.validate(&session.specifications, &context).await;
        let conflicts = extract_conflicts(&result.final_result);
        let fin = result.final_result;
        SolutionSummary {
            valid: fin.valid,
            confidence: fin.confidence,
            rounds_completed: result.rounds.len(),
            consensus_achieved: result.consensus_achieved,
            fallback_used: result.fallback_used,
            technical: fin.technical,
            commercial: fin.commercial,
            csp: fin.csp,
            overall_confidence: fin.confidence,
            conflicts,
        }
    }

    fn breaker_statuses(&self) -> BTreeMap<String, CircuitBreakerStatus> {
        Phase::ALL
            .iter()
            .map(|p| (p.as_str().to_string(), self.breaker(*p).status()))
            .collect()
    }

    pub fn get_pipeline_status(&self) -> PipelineStatus {
        PipelineStatus {
            circuit_breakers: self.breaker_statuses(),
            cache_stats: self.fallback.cache_stats(),
            last_validation: *self.last_validation.lock(),
        }
    }

    pub fn reset_circuit_breakers(&self) {
        for phase in Phase::ALL {
            self.breaker(phase).reset();
        }
        log::info!("[ValidationPipeline] circuit breakers reset");
    }

    pub fn clear_caches(&self) {
        self.fallback.clear_cache();
    }
}

/// Apply `max_allowed` / `min_required` bounds from constraint violations
/// to the specifications they name.
fn refine_specifications(specs: &[Specification], round: &ValidationRoundResult) -> Vec<Specification> {
    let Some(csp) = round.csp.as_ref() else {
        return specs.to_vec();
    };
    let violations = CspViolation::list_from(csp);
    let mut refined = specs.to_vec();
    for violation in &violations {
        let bound = match violation.violation.as_str() {
            "exceeds_maximum" => violation.max_allowed,
            "below_minimum" => violation.min_required,
            _ => None,
        };
        let Some(bound) = bound else {
            continue;
        };
        for spec in refined.iter_mut().filter(|s| s.constraint == violation.constraint) {
            let value = format_bound(bound);
            log::debug!(
                "[ValidationPipeline] refining {}: {} -> {}",
                spec.constraint,
                spec.value,
                value
            );
            spec.value = value;
        }
    }
    refined
}

fn extract_conflicts(round: &ValidationRoundResult) -> Vec<SolutionConflict> {
    let mut conflicts = Vec::new();

    if let Some(technical) = round.technical.as_ref().filter(|t| !t.valid) {
        conflicts.push(SolutionConflict::Technical {
            message: "Technical validation failed".to_string(),
            details: technical.get("conflicts").cloned().unwrap_or(Value::Null),
        });
    }

    if let Some(commercial) = round.commercial.as_ref().filter(|c| !c.valid) {
        let budget = commercial.get("budget_validation");
        let over_budget = budget
            .and_then(|b| b.get("within_budget"))
            .and_then(Value::as_bool)
            .map_or(false, |within| !within);
        if over_budget {
            let field = |key: &str| budget.and_then(|b| b.get(key)).and_then(Value::as_f64).unwrap_or(0.0);
            conflicts.push(SolutionConflict::Budget {
                message: "Configuration exceeds budget".to_string(),
                estimated_cost: field("estimated_cost"),
                budget: field("budget"),
                over_budget_amount: field("over_budget_amount"),
            });
        }
    }

    if let Some(csp) = round.csp.as_ref() {
        for violation in CspViolation::list_from(csp) {
            conflicts.push(SolutionConflict::Constraint {
                message: format!("Constraint violation: {}", violation.constraint),
                details: json!(violation),
            });
        }
    }
    conflicts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{BreakerConfig, CircuitState};
    use crate::validation::confidence::Trend;
    use crate::validation::validator::ValidatorError;
    use async_trait::async_trait;

    fn pipeline() -> ValidationPipeline {
        ValidationPipeline::new(Arc::new(Catalog::default()), PipelineConfig::default())
    }

    fn specs(items: &[(&str, &str)]) -> Vec<Specification> {
        items.iter().map(|(c, v)| Specification::new(*c, *v)).collect()
    }

    struct Broken;

    #[async_trait]
    impl Validator for Broken {
        fn id(&self) -> &str {
            "technical_validator"
        }

        async fn process(&self, _: &Value, _: &ValidationContext) -> Result<PhaseResult, ValidatorError> {
            Err(ValidatorError::Failed("catalog offline".into()))
        }
    }

    #[tokio::test]
    async fn test_consensus_in_first_round() {
        let p = pipeline();
        let result = p
            .validate(
                &specs(&[("analog_input", "8"), ("digital_output", "4")]),
                &ValidationContext::with_budget(2000.0),
            )
            .await;

        assert_eq!(result.rounds.len(), 1);
        assert!(result.consensus_achieved);
        assert!(!result.fallback_used);
        assert!(result.final_result.valid);
        assert_eq!(result.final_result.confidence, 0.945);

        let commercial = result.final_result.commercial.as_ref().unwrap();
        assert_eq!(commercial.get("pricing").unwrap()["final_price"], 1250.0);
        assert_eq!(result.circuit_breaker_status["technical"].state, CircuitState::Closed);
        assert!(p.get_pipeline_status().last_validation.is_some());
    }

    #[tokio::test]
    async fn test_refines_from_constraint_violations() {
        let p = pipeline();
        let original = specs(&[("analog_input", "32")]);
        let result = p.validate(&original, &ValidationContext::default()).await;

        assert_eq!(result.rounds.len(), 2);
        assert_eq!(result.rounds[0].confidence, 0.645);
        assert!(!result.rounds[0].valid);
        assert_eq!(result.rounds[0].specifications[0].value, "32");
        assert_eq!(result.rounds[1].specifications[0].value, "16");
        assert!(result.consensus_achieved);
        assert_eq!(result.final_result.confidence, 0.945);
        assert_eq!(result.confidence_trend.trend, Trend::Improving);
        // caller's list is untouched
        assert_eq!(original[0].value, "32");
    }

    #[tokio::test]
    async fn test_forced_open_breaker_uses_fallback() {
        let p = pipeline();
        p.breaker(Phase::Technical).force_open();

        let result = p
            .validate(
                &specs(&[("analog_input", "8"), ("digital_output", "4")]),
                &ValidationContext::with_budget(2000.0),
            )
            .await;

        assert_eq!(result.rounds.len(), 3);
        assert!(result.fallback_used);
        assert!(result.rounds.iter().all(|r| r.fallback_used));
        let technical = result.final_result.technical.as_ref().unwrap();
        assert!(technical.fallback);
        assert_eq!(technical.get("cached"), Some(&json!(true)));
        // technical 0.1 * 0.7 discount, commercial rejects the fallback, csp passes
        assert_eq!(result.final_result.confidence, 0.328);
        assert!(!result.consensus_achieved);

        let status = p.get_pipeline_status();
        assert_eq!(status.circuit_breakers["technical"].state, CircuitState::Open);
        assert!(status.cache_stats.validators_cached.contains(&"technical_validator".to_string()));

        p.reset_circuit_breakers();
        p.clear_caches();
        assert_eq!(p.breaker(Phase::Technical).state(), CircuitState::Closed);
        assert_eq!(p.get_pipeline_status().cache_stats.cache_size, 0);
    }

    #[tokio::test]
    async fn test_fallback_survives_huge_io_counts() {
        let p = pipeline();
        p.breaker(Phase::Technical).force_open();
        let huge = specs(&[
            ("analog_input", "9223372036854775807"),
            ("digital_output", "9223372036854775807"),
        ]);

        let joined = tokio::spawn(async move {
            p.validate(&huge, &ValidationContext::default()).await
        })
        .await;
        let result = joined.expect("validation task panicked");

        assert!(result.fallback_used);
        let technical = result.rounds[0].technical.as_ref().unwrap();
        assert!(technical.fallback);
        assert_eq!(technical.get("io_estimate"), Some(&json!(i64::MAX)));
        let csp = result.rounds[0].csp.as_ref().unwrap();
        assert!(!csp.valid);
        assert_eq!(csp.get("variables").unwrap()["total_io"], i64::MAX);
    }

    #[tokio::test]
    async fn test_overall_confidence_is_final_round() {
        let p = pipeline();
        let session = SessionData {
            specifications: specs(&[("analog_input", "32")]),
            ..SessionData::default()
        };
        let summary = p.validate_complete_solution(&session).await;
        assert_eq!(summary.rounds_completed, 2);
        assert_eq!(summary.confidence, 0.945);
        assert_eq!(summary.overall_confidence, 0.945);
    }

    #[tokio::test]
    async fn test_failing_validator_trips_breaker() {
        let catalog = Arc::new(Catalog::default());
        let config = PipelineConfig {
            breaker: BreakerConfig { failure_threshold: 2, ..BreakerConfig::default() },
            ..PipelineConfig::default()
        };
        let p = ValidationPipeline::with_validators(
            catalog.clone(),
            config,
            Arc::new(Broken),
            Arc::new(CommercialValidator::new(catalog.clone())),
            Arc::new(CspValidator::new(catalog)),
        );

        let result = p
            .validate(&specs(&[("analog_input", "8")]), &ValidationContext::default())
            .await;
        assert_eq!(result.rounds.len(), 3);
        assert!(result.rounds.iter().all(|r| r.technical.as_ref().unwrap().fallback));
        assert_eq!(p.breaker(Phase::Technical).state(), CircuitState::Open);
        assert_eq!(p.breaker(Phase::Technical).failure_count(), 2);
    }

    #[tokio::test]
    async fn test_invalid_technical_stops_round() {
        let p = pipeline();
        let result = p
            .validate(&specs(&[("digital_output", "300")]), &ValidationContext::default())
            .await;
        let round = &result.rounds[0];
        assert!(!round.valid);
        assert!(round.technical.is_some());
        assert!(round.commercial.is_none());
        assert!(round.csp.is_none());
        assert_eq!(round.confidence, 0.0);
        assert_eq!(result.rounds.len(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_stops_between_rounds() {
        let p = pipeline();
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let result = p
            .validate_with_shutdown(&specs(&[("analog_input", "32")]), &ValidationContext::default(), &shutdown)
            .await;
        assert_eq!(result.rounds.len(), 1);
        assert!(!result.consensus_achieved);
    }

    #[tokio::test]
    async fn test_complete_solution_reports_conflicts() {
        let p = pipeline();
        let session: SessionData = serde_json::from_value(json!({
            "specifications": [
                {"type": "performance", "constraint": "analog_input", "value": "8", "strength": 1000},
                {"type": "performance", "constraint": "digital_output", "value": 4, "strength": 1000},
            ],
            "budget": 1100.0,
        }))
        .unwrap();

        let summary = p.validate_complete_solution(&session).await;
        // consensus is judged on confidence alone
        assert!(!summary.valid);
        assert_eq!(summary.rounds_completed, 1);
        assert!(summary.consensus_achieved);
        assert_eq!(summary.overall_confidence, summary.confidence);
        assert_eq!(summary.conflicts.len(), 1);
        match &summary.conflicts[0] {
            SolutionConflict::Budget { over_budget_amount, budget, .. } => {
                assert_eq!(*over_budget_amount, 150.0);
                assert_eq!(*budget, 1100.0);
            }
            other => panic!("unexpected conflict {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_constraint_conflicts_listed() {
        let p = ValidationPipeline::new(
            Arc::new(Catalog::default()),
            PipelineConfig { max_rounds: 1, ..PipelineConfig::default() },
        );
        let session = SessionData {
            specifications: specs(&[("analog_input", "20")]),
            ..SessionData::default()
        };
        let summary = p.validate_complete_solution(&session).await;
        assert_eq!(summary.rounds_completed, 1);
        let messages: Vec<String> = summary
            .conflicts
            .iter()
            .filter_map(|c| match c {
                SolutionConflict::Constraint { message, .. } => Some(message.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(messages, vec!["Constraint violation: analog_input".to_string()]);
    }
}
