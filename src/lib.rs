//! # reqmas
//!
//! Coordination core for a team of independent, fallible validators and
//! agents that must agree on one configuration.
//!
//! - [`blackboard`]: lock-protected knowledge store with four spaces
//! - [`vector_clock`]: causal ordering and concurrent-update detection
//! - [`resilience`]: circuit breakers and fallback responses
//! - [`events`]: FIFO publish/subscribe bus with per-sender isolation
//! - [`validation`]: multi-round technical / commercial / constraint pipeline
//! - [`agents`]: agent trait and timeout-bounded executor
//!
//! Product data lives in an explicit [`catalog::Catalog`] built once and
//! shared by `Arc`; runtime tuning lives in [`config::Settings`].

pub mod agents;
pub mod blackboard;
pub mod catalog;
pub mod config;
pub mod events;
pub mod resilience;
pub mod utilities;
pub mod validation;
pub mod vector_clock;

pub use agents::{Agent, AgentContext, AgentError, AgentExecutor, AgentOutcome};
pub use blackboard::{Blackboard, KnowledgeSpace, MergePolicy};
pub use catalog::Catalog;
pub use config::{ConfigError, Settings};
pub use events::{BusError, Message, MessageBus, Subscriber};
pub use resilience::{CallError, CircuitBreaker, CircuitState, FallbackHandler};
pub use validation::{
    PipelineResult, SessionData, Specification, ValidationContext, ValidationPipeline, Validator,
};
pub use vector_clock::{ClockOrdering, VectorClock};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
