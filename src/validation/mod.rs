//! Validation phases and the multi-round pipeline that drives them.
//!
//! - [`TechnicalValidator`]: controller capacity and module sizing
//! - [`CommercialValidator`]: pricing and budget fit
//! - [`CspValidator`]: catalog constraint rules and dependencies
//! - [`ValidationPipeline`]: rounds, breakers, fallbacks and refinement
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use reqmas::catalog::Catalog;
//! use reqmas::config::PipelineConfig;
//! use reqmas::validation::{Specification, ValidationContext, ValidationPipeline};
//!
//! let pipeline = ValidationPipeline::new(Arc::new(Catalog::default()), PipelineConfig::default());
//! let specs = vec![
//!     Specification::new("analog_input", "8"),
//!     Specification::new("digital_output", "4"),
//! ];
//! let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
//! let result = rt.block_on(pipeline.validate(&specs, &ValidationContext::with_budget(2000.0)));
//! assert!(result.consensus_achieved);
//! ```

pub mod commercial;
pub mod confidence;
pub mod csp;
pub mod pipeline;
pub mod technical;
pub mod types;
pub mod validator;

pub use commercial::CommercialValidator;
pub use confidence::{ConfidenceAggregator, ConfidenceAnalysis, ConfidenceTrend};
pub use csp::CspValidator;
pub use pipeline::{PipelineStatus, ValidationPipeline};
pub use technical::{IoRequirements, TechnicalValidator};
pub use types::{
    CspViolation, Phase, PhaseResult, PipelineResult, SessionData, SolutionConflict,
    SolutionSummary, Specification, ValidationContext, ValidationRoundResult,
};
pub use validator::{Validator, ValidatorError};
