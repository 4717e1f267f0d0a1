//! Agents and their executor.
//!
//! An [`Agent`] is a stateless participant: it receives its input plus an
//! [`AgentContext`] assembled from the blackboard and returns a JSON result.
//! The [`AgentExecutor`] supplies the context, enforces the timeout, writes
//! the result back to the `processed` space and announces it on the bus.

pub mod executor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::events::BusError;

pub use executor::{AgentExecutor, AgentOutcome};

/// Errors raised while executing an agent.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AgentError {
    #[error("{0} is already processing")]
    Busy(String),

    #[error("{agent_id} timed out after {timeout_ms} ms")]
    Timeout { agent_id: String, timeout_ms: u64 },

    #[error("agent failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// What an agent sees of the shared state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentContext {
    /// The `raw` space.
    pub requirements: Map<String, Value>,
    /// Other agents' entries in `processed`; `None` for the orchestrator.
    pub other_agents: Option<Map<String, Value>>,
    pub user_profile: Option<Value>,
    pub session_id: Option<String>,
}

#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;

    async fn process(&self, input: &Value, context: &AgentContext) -> Result<Value, AgentError>;
}
