//! Failure isolation and graceful degradation.

pub mod circuit_breaker;
pub mod fallback_handler;

pub use circuit_breaker::{
    BreakerConfig, CallError, CircuitBreaker, CircuitBreakerStatus, CircuitState,
};
pub use fallback_handler::{CacheStats, FallbackHandler};
