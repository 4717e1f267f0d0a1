//! Messages carried by the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::vector_clock::{ClockMap, Clocked};

/// A typed message between participants.
///
/// Built once by [`MessageBus::publish`](super::MessageBus::publish) and
/// handed to subscribers by shared reference; identity is `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier (UUID v4).
    pub id: Uuid,
    pub sender: String,
    /// Routing key; subscribers register per type.
    pub message_type: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    /// Groups related messages; defaults to the message's own id.
    pub correlation_id: Uuid,
    /// Bus clock after the sender's tick.
    #[serde(default)]
    pub vector_clock: ClockMap,
}

impl Message {
    pub fn new(
        sender: impl Into<String>,
        message_type: impl Into<String>,
        payload: Value,
        correlation_id: Option<Uuid>,
    ) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            sender: sender.into(),
            message_type: message_type.into(),
            payload,
            timestamp: Utc::now(),
            correlation_id: correlation_id.unwrap_or(id),
            vector_clock: ClockMap::new(),
        }
    }

    pub fn with_vector_clock(mut self, clock: ClockMap) -> Self {
        self.vector_clock = clock;
        self
    }
}

impl Clocked for Message {
    fn vector_clock(&self) -> ClockMap {
        self.vector_clock.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_clock::VectorClock;
    use serde_json::json;

    #[test]
    fn test_correlation_defaults_to_id() {
        let msg = Message::new("io_expert", "requirements_extracted", json!({}), None);
        assert_eq!(msg.correlation_id, msg.id);

        let parent = Uuid::new_v4();
        let reply = Message::new("system_expert", "analysis", json!({}), Some(parent));
        assert_eq!(reply.correlation_id, parent);
        assert_ne!(reply.id, parent);
    }

    #[test]
    fn test_messages_participate_in_conflict_detection() {
        let mk = |sender: &str, clock: &[(&str, u64)]| {
            Message::new(sender, "update", json!(null), None)
                .with_vector_clock(clock.iter().map(|(k, v)| (k.to_string(), *v)).collect())
        };
        let msgs = vec![
            mk("a", &[("a", 1)]),
            mk("b", &[("b", 1)]),
            mk("a", &[("a", 2), ("b", 1)]),
        ];
        let conflicts = VectorClock::detect_conflicts(&msgs);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].0.sender, "a");
        assert_eq!(conflicts[0].1.sender, "b");
    }

    #[test]
    fn test_serializes_with_clock() {
        let msg = Message::new("x", "t", json!({"k": 1}), None)
            .with_vector_clock([("x".to_string(), 3)].into_iter().collect());
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["vector_clock"]["x"], 3);
        assert_eq!(v["message_type"], "t");
    }
}
