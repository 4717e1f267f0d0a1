//! Circuit breaker for isolating a failing dependency.
//!
//! State machine over `Closed → Open → HalfOpen → Closed`:
//!
//! - **Closed**: calls pass through; failures are counted and the breaker
//!   opens once `failure_threshold` is reached.
//! - **Open**: calls are rejected without invoking the callee until
//!   `recovery_timeout` has elapsed since the last failure; the next call then
//!   moves the breaker to half-open and proceeds.
//! - **HalfOpen**: probing. `half_open_quota` consecutive successes close the
//!   breaker; any failure re-opens it.
//!
//! The state lives behind a `parking_lot::Mutex` that is never held across an
//! `.await`, so a breaker can be shared by reference between concurrent
//! callers and read at any time for status reporting.

use std::future::Future;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The three breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tuning for a single breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures (while closed) before opening.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds to wait after the last failure before probing.
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: f64,
    /// Successes required while half-open before closing.
    #[serde(default = "default_half_open_quota")]
    pub half_open_quota: u32,
}

fn default_failure_threshold() -> u32 { 5 }
fn default_recovery_timeout_secs() -> f64 { 60.0 }
fn default_half_open_quota() -> u32 { 3 }

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            half_open_quota: default_half_open_quota(),
        }
    }
}

impl BreakerConfig {
    /// Recovery timeout as a [`Duration`]; negative values clamp to zero.
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.recovery_timeout_secs.max(0.0))
    }
}

/// Outcome of a guarded call that did not succeed.
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// The breaker is open; the callee was not invoked.
    #[error("circuit breaker open for {name}")]
    Rejected { name: String },

    /// The callee ran and returned its own error.
    #[error("{0}")]
    Failed(E),
}

impl<E> CallError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    /// The callee's error, if it ran.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Failed(e) => Some(e),
            Self::Rejected { .. } => None,
        }
    }
}

/// Serializable point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_state_change: DateTime<Utc>,
    pub recovery_timeout_secs: f64,
    pub half_open_successes: u32,
    pub half_open_quota: u32,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    half_open_successes: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    last_state_change: DateTime<Utc>,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            half_open_successes: 0,
            last_failure: None,
            last_failure_at: None,
            last_state_change: Utc::now(),
        }
    }

    fn transition(&mut self, to: CircuitState) {
        self.state = to;
        self.last_state_change = Utc::now();
    }

    fn recovery_elapsed(&self, timeout: Duration) -> bool {
        match self.last_failure {
            None => true,
            Some(at) => at.elapsed() >= timeout,
        }
    }
}

/// A named circuit breaker guarding one dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    half_open_quota: u32,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a closed breaker with default tuning.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, &BreakerConfig::default())
    }

    /// Create a closed breaker with explicit tuning.
    ///
    /// Thresholds of zero are raised to one.
    pub fn with_config(name: impl Into<String>, config: &BreakerConfig) -> Self {
        Self {
            name: name.into(),
            failure_threshold: config.failure_threshold.max(1),
            recovery_timeout: config.recovery_timeout(),
            half_open_quota: config.half_open_quota.max(1),
            inner: Mutex::new(BreakerState::closed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    pub fn recovery_timeout(&self) -> Duration {
        self.recovery_timeout
    }

    /// Run `f` through the breaker.
    ///
    /// Fails fast with [`CallError::Rejected`] while open. Otherwise `f` is
    /// invoked and its result routed through the transition rules; the
    /// callee's value or error is returned unchanged.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.admit::<E>()?;
        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(CallError::Failed(err))
            }
        }
    }

    /// Synchronous counterpart of [`call`](Self::call).
    pub fn call_sync<F, T, E>(&self, f: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        self.admit::<E>()?;
        match f() {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(CallError::Failed(err))
            }
        }
    }

    /// Decide whether a call may proceed, moving Open → HalfOpen when the
    /// recovery window has passed.
    fn admit<E>(&self) -> Result<(), CallError<E>> {
        let mut st = self.inner.lock();
        if st.state != CircuitState::Open {
            return Ok(());
        }
        if st.recovery_elapsed(self.recovery_timeout) {
            st.half_open_successes = 0;
            st.transition(CircuitState::HalfOpen);
            log::debug!("[CircuitBreaker] {} half-open, probing", self.name);
            Ok(())
        } else {
            Err(CallError::Rejected { name: self.name.clone() })
        }
    }

    /// Apply a successful outcome.
    pub fn record_success(&self) {
        let mut st = self.inner.lock();
        match st.state {
            CircuitState::HalfOpen => {
                st.half_open_successes += 1;
                if st.half_open_successes >= self.half_open_quota {
                    st.failure_count = 0;
                    st.half_open_successes = 0;
                    st.transition(CircuitState::Closed);
                    log::info!("[CircuitBreaker] {} closed after recovery", self.name);
                }
            }
            CircuitState::Closed => {
                st.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Apply a failed outcome.
    pub fn record_failure(&self) {
        let mut st = self.inner.lock();
        st.failure_count = st.failure_count.saturating_add(1);
        st.last_failure = Some(Instant::now());
        st.last_failure_at = Some(Utc::now());

        match st.state {
            CircuitState::HalfOpen => {
                st.transition(CircuitState::Open);
                log::info!("[CircuitBreaker] {} re-opened during probe", self.name);
            }
            CircuitState::Closed if st.failure_count >= self.failure_threshold => {
                st.transition(CircuitState::Open);
                log::info!(
                    "[CircuitBreaker] {} opened after {} failures",
                    self.name,
                    st.failure_count
                );
            }
            _ => {}
        }
    }

    /// Move an open breaker to half-open regardless of elapsed time.
    ///
    /// Returns `false` when the breaker was not open.
    pub fn try_half_open(&self) -> bool {
        let mut st = self.inner.lock();
        if st.state != CircuitState::Open {
            return false;
        }
        st.half_open_successes = 0;
        st.transition(CircuitState::HalfOpen);
        log::debug!("[CircuitBreaker] {} half-open after scheduled recovery", self.name);
        true
    }

    /// Whether a call would currently be attempted. Does not mutate state.
    pub fn is_available(&self) -> bool {
        let st = self.inner.lock();
        match st.state {
            CircuitState::Open => st.recovery_elapsed(self.recovery_timeout),
            _ => true,
        }
    }

    /// Force the breaker closed with zeroed counters.
    pub fn reset(&self) {
        let mut st = self.inner.lock();
        *st = BreakerState::closed();
    }

    /// Force the breaker open. The recovery window starts now.
    pub fn force_open(&self) {
        let mut st = self.inner.lock();
        st.last_failure = Some(Instant::now());
        st.last_failure_at = Some(Utc::now());
        st.transition(CircuitState::Open);
        log::info!("[CircuitBreaker] {} forced open", self.name);
    }

    pub fn status(&self) -> CircuitBreakerStatus {
        let st = self.inner.lock();
        CircuitBreakerStatus {
            name: self.name.clone(),
            state: st.state,
            failure_count: st.failure_count,
            failure_threshold: self.failure_threshold,
            last_failure: st.last_failure_at,
            last_state_change: st.last_state_change,
            recovery_timeout_secs: self.recovery_timeout.as_secs_f64(),
            half_open_successes: st.half_open_successes,
            half_open_quota: self.half_open_quota,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
