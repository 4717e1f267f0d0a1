//! Runs agents against the blackboard with a timeout and publishes their
//! completion on the bus.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Map, Value};

use super::{Agent, AgentContext, AgentError};
use crate::blackboard::{Blackboard, KnowledgeSpace};
use crate::config::AgentSettings;
use crate::events::MessageBus;

/// Participant id that does not see peer outputs.
const ORCHESTRATOR_ID: &str = "orchestrator";

/// Result of one [`AgentExecutor::execute`] call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AgentOutcome {
    Completed { result: Value },
    #[serde(rename = "timeout")]
    TimedOut { timeout_ms: u64 },
    #[serde(rename = "error")]
    Failed { error: String },
}

impl AgentOutcome {
    /// The agent's reported confidence; 0 for timeouts and failures.
    pub fn confidence(&self) -> f64 {
        match self {
            Self::Completed { result } => result
                .get("confidence")
                .and_then(Value::as_f64)
                .unwrap_or(0.0),
            _ => 0.0,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    /// Flat JSON form: the agent's result when completed, otherwise a status
    /// object with `confidence: 0.0`.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Completed { result } => result.clone(),
            Self::TimedOut { timeout_ms } => json!({
                "status": "timeout",
                "partial_results": null,
                "timeout_ms": timeout_ms,
                "confidence": 0.0,
            }),
            Self::Failed { error } => json!({
                "status": "error",
                "error": error,
                "confidence": 0.0,
            }),
        }
    }
}

/// Removes an agent id from the running set when dropped.
struct RunningGuard<'a> {
    running: &'a Mutex<HashSet<String>>,
    agent_id: String,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.lock().remove(&self.agent_id);
    }
}

pub struct AgentExecutor {
    blackboard: Arc<Blackboard>,
    bus: MessageBus,
    timeout: Duration,
    confidence_threshold: f64,
    /// Write timeout/error outcomes to `processed` so peers see them.
    record_failures: bool,
    running: Mutex<HashSet<String>>,
}

impl AgentExecutor {
    pub fn new(blackboard: Arc<Blackboard>, bus: MessageBus, settings: &AgentSettings) -> Self {
        Self {
            blackboard,
            bus,
            timeout: settings.timeout(),
            confidence_threshold: settings.confidence_threshold,
            record_failures: settings.fallback_enabled,
            running: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_timeout(blackboard: Arc<Blackboard>, bus: MessageBus, timeout: Duration) -> Self {
        let mut executor = Self::new(blackboard, bus, &AgentSettings::default());
        executor.timeout = timeout;
        executor
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether an outcome is confident enough to act on.
    pub fn is_confident(&self, outcome: &AgentOutcome) -> bool {
        outcome.is_completed() && outcome.confidence() >= self.confidence_threshold
    }

    /// Whether `agent_id` has an execution in flight.
    pub fn is_processing(&self, agent_id: &str) -> bool {
        self.running.lock().contains(agent_id)
    }

    /// Execute `agent` on `input`.
    ///
    /// Returns [`AgentError::Busy`] when the same agent id is already
    /// executing. Timeouts and agent failures are reported as outcomes.
    pub async fn execute(&self, agent: &dyn Agent, input: &Value) -> Result<AgentOutcome, AgentError> {
        let agent_id = agent.id().to_string();
        let _guard = self.acquire(&agent_id)?;

        let outcome = match self.run(agent, &agent_id, input).await {
            Ok(result) => AgentOutcome::Completed { result },
            Err(AgentError::Timeout { timeout_ms, .. }) => {
                log::warn!("[AgentExecutor] {} timed out after {} ms", agent_id, timeout_ms);
                AgentOutcome::TimedOut { timeout_ms }
            }
            Err(err) => {
                log::warn!("[AgentExecutor] {} failed: {}", agent_id, err);
                AgentOutcome::Failed { error: err.to_string() }
            }
        };
        if self.record_failures && !outcome.is_completed() {
            self.blackboard
                .write_entry(&agent_id, KnowledgeSpace::Processed, &agent_id, outcome.to_value())
                .await;
        }
        Ok(outcome)
    }

    fn acquire(&self, agent_id: &str) -> Result<RunningGuard<'_>, AgentError> {
        let mut running = self.running.lock();
        if !running.insert(agent_id.to_string()) {
            return Err(AgentError::Busy(agent_id.to_string()));
        }
        Ok(RunningGuard {
            running: &self.running,
            agent_id: agent_id.to_string(),
        })
    }

    async fn run(&self, agent: &dyn Agent, agent_id: &str, input: &Value) -> Result<Value, AgentError> {
        let context = self.context_for(agent_id).await;
        let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);

        let result = tokio::time::timeout(self.timeout, agent.process(input, &context))
            .await
            .map_err(|_| AgentError::Timeout {
                agent_id: agent_id.to_string(),
                timeout_ms,
            })??;

        self.blackboard
            .write_entry(agent_id, KnowledgeSpace::Processed, agent_id, result.clone())
            .await;
        // A rejected announcement does not undo the stored result.
        if let Err(e) = self.bus.publish(agent_id, "processing_complete", result.clone(), None) {
            log::warn!("[AgentExecutor] {} completed but was not announced: {}", agent_id, e);
        }
        log::debug!("[AgentExecutor] {} completed", agent_id);
        Ok(result)
    }

    /// Build the context an agent sees from the blackboard.
    pub async fn context_for(&self, agent_id: &str) -> AgentContext {
        let requirements = self.blackboard.read_space(KnowledgeSpace::Raw).await;
        let other_agents = if agent_id == ORCHESTRATOR_ID {
            None
        } else {
            let mut peers: Map<String, Value> = self.blackboard.read_space(KnowledgeSpace::Processed).await;
            peers.remove(agent_id);
            Some(peers)
        };
        let user_profile = self
            .blackboard
            .read_key(KnowledgeSpace::Consolidated, "user_profile")
            .await;
        let session_id = self
            .blackboard
            .read_key(KnowledgeSpace::Consolidated, "session_id")
            .await
            .and_then(|v| v.as_str().map(str::to_string));

        AgentContext {
            requirements,
            other_agents,
            user_profile,
            session_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusSettings;
    use crate::events::SubscriberError;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl Agent for Echo {
        fn id(&self) -> &str {
            "io_expert"
        }

        async fn process(&self, input: &Value, context: &AgentContext) -> Result<Value, AgentError> {
            Ok(json!({
                "echo": input,
                "requirements": context.requirements.len(),
                "session": context.session_id,
                "confidence": 0.8,
            }))
        }
    }

    struct Slow(Duration);

    #[async_trait]
    impl Agent for Slow {
        fn id(&self) -> &str {
            "system_expert"
        }

        async fn process(&self, _: &Value, _: &AgentContext) -> Result<Value, AgentError> {
            tokio::time::sleep(self.0).await;
            Ok(json!({"confidence": 1.0}))
        }
    }

    struct Failing;

    #[async_trait]
    impl Agent for Failing {
        fn id(&self) -> &str {
            "communication_expert"
        }

        async fn process(&self, _: &Value, _: &AgentContext) -> Result<Value, AgentError> {
            Err(AgentError::Failed("parser rejected input".into()))
        }
    }

    fn executor(timeout: Duration) -> (AgentExecutor, Arc<Blackboard>, MessageBus) {
        let board = Arc::new(Blackboard::new());
        let bus = MessageBus::default();
        (AgentExecutor::with_timeout(board.clone(), bus.clone(), timeout), board, bus)
    }

    #[tokio::test]
    async fn test_completed_writes_back_and_publishes() {
        let (exec, board, bus) = executor(Duration::from_secs(1));
        board.write("user", "raw", "analog_input", json!("8")).await;
        board.write("user", "consolidated", "session_id", json!("s-1")).await;

        let outcome = exec.execute(&Echo, &json!({"text": "8 analog inputs"})).await.unwrap();
        assert!(outcome.is_completed());
        assert_eq!(outcome.confidence(), 0.8);

        let stored = board.read_key(KnowledgeSpace::Processed, "io_expert").await.unwrap();
        assert_eq!(stored["requirements"], 1);
        assert_eq!(stored["session"], "s-1");

        bus.start().unwrap();
        assert!(bus.flush(Duration::from_secs(1)).await);
        let history = bus.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message_type, "processing_complete");
        assert_eq!(history[0].sender, "io_expert");
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_cut_off_sender_keeps_completed_result() {
        let board = Arc::new(Blackboard::new());
        let bus = MessageBus::new(BusSettings {
            failure_threshold: 1,
            recovery_delay_secs: 60.0,
            poll_interval_ms: 20,
            ..BusSettings::default()
        });
        bus.subscribe_fn("ping", |_| async { Err::<(), _>(SubscriberError::from("down")) });
        bus.start().unwrap();
        bus.publish("io_expert", "ping", json!({}), None).unwrap();
        assert!(bus.flush(Duration::from_secs(1)).await);
        assert_eq!(
            bus.breaker_status("io_expert").unwrap().state,
            crate::resilience::CircuitState::Open
        );

        let exec = AgentExecutor::with_timeout(board.clone(), bus.clone(), Duration::from_secs(1));
        let outcome = exec.execute(&Echo, &json!({})).await.unwrap();
        assert!(outcome.is_completed());
        assert_eq!(outcome.confidence(), 0.8);

        let stored = board.read_key(KnowledgeSpace::Processed, "io_expert").await.unwrap();
        assert_eq!(stored["confidence"], 0.8);
        assert!(stored.get("status").is_none());
        assert_eq!(bus.published_count(), 1);
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_timeout_reports_zero_confidence() {
        let (exec, board, _bus) = executor(Duration::from_millis(20));
        let outcome = exec.execute(&Slow(Duration::from_millis(200)), &json!({})).await.unwrap();
        assert_eq!(outcome, AgentOutcome::TimedOut { timeout_ms: 20 });
        assert_eq!(outcome.confidence(), 0.0);
        assert_eq!(outcome.to_value()["status"], "timeout");
        let stored = board.read_key(KnowledgeSpace::Processed, "system_expert").await.unwrap();
        assert_eq!(stored["status"], "timeout");
        assert!(!exec.is_processing("system_expert"));
    }

    #[tokio::test]
    async fn test_failure_is_an_outcome() {
        let (exec, _board, bus) = executor(Duration::from_secs(1));
        let outcome = exec.execute(&Failing, &json!({})).await.unwrap();
        match &outcome {
            AgentOutcome::Failed { error } => assert!(error.contains("parser rejected input")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(outcome.to_value()["confidence"], 0.0);
        assert_eq!(bus.published_count(), 0);
    }

    #[tokio::test]
    async fn test_failures_not_recorded_when_fallback_disabled() {
        let board = Arc::new(Blackboard::new());
        let settings = AgentSettings {
            fallback_enabled: false,
            ..AgentSettings::default()
        };
        let exec = AgentExecutor::new(board.clone(), MessageBus::default(), &settings);
        exec.execute(&Failing, &json!({})).await.unwrap();
        assert!(board.read_key(KnowledgeSpace::Processed, "communication_expert").await.is_none());
    }

    #[tokio::test]
    async fn test_confidence_threshold() {
        let (exec, _board, _bus) = executor(Duration::from_secs(1));
        let high = exec.execute(&Echo, &json!({})).await.unwrap();
        assert!(exec.is_confident(&high));
        let low = AgentOutcome::Completed { result: json!({"confidence": 0.4}) };
        assert!(!exec.is_confident(&low));
    }

    #[tokio::test]
    async fn test_rejects_reentrant_execution() {
        let (exec, _board, _bus) = executor(Duration::from_secs(1));
        let slow = Slow(Duration::from_millis(100));
        let empty = json!({});
        let (first, second) = tokio::join!(exec.execute(&slow, &empty), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            exec.execute(&slow, &empty).await
        });
        assert!(first.unwrap().is_completed());
        assert_eq!(second.unwrap_err(), AgentError::Busy("system_expert".into()));
        assert!(!exec.is_processing("system_expert"));
    }

    #[tokio::test]
    async fn test_context_hides_own_output_and_orchestrator_sees_no_peers() {
        let (exec, board, _bus) = executor(Duration::from_secs(1));
        board.write("io_expert", "processed", "io_expert", json!({"a": 1})).await;
        board.write("system_expert", "processed", "system_expert", json!({"b": 2})).await;

        let ctx = exec.context_for("io_expert").await;
        let peers = ctx.other_agents.unwrap();
        assert!(peers.contains_key("system_expert"));
        assert!(!peers.contains_key("io_expert"));

        let orchestrator = exec.context_for("orchestrator").await;
        assert!(orchestrator.other_agents.is_none());
    }
}
