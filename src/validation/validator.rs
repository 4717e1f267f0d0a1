//! The validator seam.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use super::types::{PhaseResult, ValidationContext};

/// Errors a validator may raise. Any of them sends the phase to the
/// fallback handler and counts against the phase breaker.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidatorError {
    #[error("validator failed: {0}")]
    Failed(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("validator timed out after {0} ms")]
    Timeout(u64),
}

/// A validation phase.
///
/// `process` receives the phase input and the request context and returns a
/// result carrying at least `valid` and `confidence`.
#[async_trait]
pub trait Validator: Send + Sync {
    /// Stable id, e.g. `technical_validator`.
    fn id(&self) -> &str;

    async fn process(
        &self,
        input: &Value,
        context: &ValidationContext,
    ) -> Result<PhaseResult, ValidatorError>;
}

/// Deserialize the `specifications` array of a phase input.
///
/// A missing array reads as empty.
pub(crate) fn specifications_from(
    input: &Value,
) -> Result<Vec<super::types::Specification>, ValidatorError> {
    match input.get("specifications") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(specs) => serde_json::from_value(specs.clone())
            .map_err(|e| ValidatorError::InvalidInput(format!("specifications: {}", e))),
    }
}
