//! Participant precedence for merging parallel outputs.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use super::entry::ConflictRecord;

/// Ordered participant ids; earlier ids take precedence.
///
/// The first participant is the primary: its output is authoritative and
/// later participants are checked against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePolicy {
    order: Vec<String>,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self::new(["io_expert", "system_expert", "communication_expert"])
    }
}

impl MergePolicy {
    pub fn new<I, S>(order: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            order: order.into_iter().map(Into::into).collect(),
        }
    }

    /// Order by descending priority; equal priorities sort by id.
    pub fn from_priorities(priorities: &BTreeMap<String, i64>) -> Self {
        let mut ranked: Vec<(&String, i64)> = priorities.iter().map(|(k, v)| (k, *v)).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        Self::new(ranked.into_iter().map(|(k, _)| k.clone()))
    }

    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn primary(&self) -> Option<&str> {
        self.order.first().map(String::as_str)
    }

    /// Combine parallel outputs by precedence.
    ///
    /// The primary participant's output lands under `primary`; the others are
    /// copied in verbatim under their own id. Participants not named by the
    /// policy are dropped. No conflict detection happens here.
    pub fn merge_parallel_outputs(&self, outputs: &BTreeMap<String, Value>) -> Map<String, Value> {
        let mut merged = Map::new();
        for (rank, participant) in self.order.iter().enumerate() {
            if let Some(output) = outputs.get(participant) {
                let key = if rank == 0 { "primary".to_string() } else { participant.clone() };
                merged.insert(key, output.clone());
            }
        }
        merged
    }

    /// Fold `update` (participant → output) into `current`.
    ///
    /// The primary's `constraints` and `veto_flags` become
    /// `primary_constraints`/`veto_flags`. Another participant is merged
    /// under its id unless one of its constraints shares a `type` with a
    /// primary constraint but differs in `value`; such updates are listed
    /// under `conflicts` as `io_incompatible` and returned as records.
    pub fn merge_with_constraints(
        &self,
        current: &Map<String, Value>,
        update: &Map<String, Value>,
    ) -> (Map<String, Value>, Vec<ConflictRecord>) {
        let mut merged = current.clone();
        let mut records = Vec::new();

        for (rank, participant) in self.order.iter().enumerate() {
            let Some(agent_update) = update.get(participant) else {
                continue;
            };

            if rank == 0 {
                let constraints = agent_update.get("constraints").cloned().unwrap_or_else(|| Value::Array(vec![]));
                let vetoes = agent_update.get("veto_flags").cloned().unwrap_or_else(|| Value::Array(vec![]));
                merged.insert("primary_constraints".into(), constraints);
                merged.insert("veto_flags".into(), vetoes);
                continue;
            }

            if conflicts_with_primary(agent_update, merged.get("primary_constraints")) {
                log::debug!("[MergePolicy] {} conflicts with primary constraints", participant);
                let record = ConflictRecord::new(participant.as_str(), "io_incompatible", agent_update.clone());
                let entry = serde_json::json!({
                    "agent": participant,
                    "conflict_type": "io_incompatible",
                    "details": agent_update,
                });
                match merged.get_mut("conflicts").and_then(Value::as_array_mut) {
                    Some(list) => list.push(entry),
                    None => {
                        merged.insert("conflicts".into(), Value::Array(vec![entry]));
                    }
                }
                records.push(record);
            } else {
                merged.insert(participant.clone(), agent_update.clone());
            }
        }

        (merged, records)
    }
}

fn conflicts_with_primary(update: &Value, primary: Option<&Value>) -> bool {
    let (Some(theirs), Some(ours)) = (
        update.get("constraints").and_then(Value::as_array),
        primary.and_then(Value::as_array),
    ) else {
        return false;
    };
    theirs.iter().any(|c| {
        ours.iter().any(|p| {
            c.get("type").is_some() && c.get("type") == p.get("type") && c.get("value") != p.get("value")
        })
    })
}
