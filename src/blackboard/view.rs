//! The shared knowledge store.
//!
//! All four knowledge spaces sit behind one async mutex. Every read, write
//! and snapshot holds it for its full duration, so operations are totally
//! ordered and no reader ever observes a partially applied write.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use super::entry::{ConflictRecord, KnowledgeEntry, KnowledgeSpace};
use super::policy::MergePolicy;

/// Deep copy of the whole blackboard taken under the lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlackboardSnapshot {
    pub knowledge_spaces: BTreeMap<KnowledgeSpace, BTreeMap<String, KnowledgeEntry>>,
    pub conflicts: Vec<ConflictRecord>,
    pub taken_at: DateTime<Utc>,
}

impl BlackboardSnapshot {
    /// Value stored at `space`/`key` when the snapshot was taken.
    pub fn value(&self, space: KnowledgeSpace, key: &str) -> Option<&Value> {
        self.knowledge_spaces
            .get(&space)
            .and_then(|entries| entries.get(key))
            .map(|e| &e.value)
    }
}

#[derive(Debug)]
struct BoardState {
    spaces: BTreeMap<KnowledgeSpace, HashMap<String, KnowledgeEntry>>,
    conflicts: Vec<ConflictRecord>,
}

impl BoardState {
    fn new() -> Self {
        Self {
            spaces: KnowledgeSpace::ALL
                .into_iter()
                .map(|s| (s, HashMap::new()))
                .collect(),
            conflicts: Vec::new(),
        }
    }
}

/// Shared store for independent readers and writers.
///
/// # Example
///
/// ```
/// # tokio_test_block(async {
/// use reqmas::blackboard::Blackboard;
///
/// let bb = Blackboard::new();
/// assert!(bb.write("io_expert", "raw", "analog_input", serde_json::json!(8)).await);
/// assert_eq!(bb.read("system_expert", "raw", Some("analog_input")).await, Some(serde_json::json!(8)));
/// assert!(!bb.write("io_expert", "archive", "k", serde_json::json!(1)).await);
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
/// # }
/// ```
#[derive(Debug)]
pub struct Blackboard {
    state: Mutex<BoardState>,
    policy: MergePolicy,
}

impl Default for Blackboard {
    fn default() -> Self {
        Self::new()
    }
}

impl Blackboard {
    /// Create an empty blackboard with the default merge policy.
    pub fn new() -> Self {
        Self::with_policy(MergePolicy::default())
    }

    pub fn with_policy(policy: MergePolicy) -> Self {
        Self {
            state: Mutex::new(BoardState::new()),
            policy,
        }
    }

    pub fn policy(&self) -> &MergePolicy {
        &self.policy
    }

    // --- Write operations ---

    /// Store `value` under `space`/`key`, replacing any previous entry.
    ///
    /// Returns `false` without touching state when `space` is not a known
    /// space name.
    pub async fn write(&self, writer_id: &str, space: &str, key: &str, value: Value) -> bool {
        match space.parse::<KnowledgeSpace>() {
            Ok(space) => {
                self.write_entry(writer_id, space, key, value).await;
                true
            }
            Err(e) => {
                log::warn!("[Blackboard] {} rejected write to {}: {}", writer_id, key, e);
                false
            }
        }
    }

    /// Typed counterpart of [`write`](Self::write).
    pub async fn write_entry(&self, writer_id: &str, space: KnowledgeSpace, key: &str, value: Value) {
        let entry = KnowledgeEntry::new(value, writer_id);
        let mut state = self.state.lock().await;
        state
            .spaces
            .entry(space)
            .or_default()
            .insert(key.to_string(), entry);
        log::debug!("[Blackboard] {} wrote {}/{}", writer_id, space, key);
    }

    // --- Read operations ---

    /// Read one value, or the value-only projection of a whole space when
    /// `key` is `None`.
    ///
    /// Unknown spaces and missing keys yield `None`.
    pub async fn read(&self, reader_id: &str, space: &str, key: Option<&str>) -> Option<Value> {
        let space = match space.parse::<KnowledgeSpace>() {
            Ok(space) => space,
            Err(e) => {
                log::debug!("[Blackboard] {} read from {}", reader_id, e);
                return None;
            }
        };
        match key {
            Some(key) => self.read_key(space, key).await,
            None => Some(Value::Object(self.read_space(space).await)),
        }
    }

    pub async fn read_key(&self, space: KnowledgeSpace, key: &str) -> Option<Value> {
        let state = self.state.lock().await;
        state
            .spaces
            .get(&space)
            .and_then(|entries| entries.get(key))
            .map(|e| e.value.clone())
    }

    /// Full entry including writer and timestamp.
    pub async fn read_entry(&self, space: KnowledgeSpace, key: &str) -> Option<KnowledgeEntry> {
        let state = self.state.lock().await;
        state.spaces.get(&space).and_then(|entries| entries.get(key)).cloned()
    }

    pub async fn read_space(&self, space: KnowledgeSpace) -> Map<String, Value> {
        let state = self.state.lock().await;
        state
            .spaces
            .get(&space)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(k, e)| (k.clone(), e.value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    // --- Merging and conflicts ---

    /// See [`MergePolicy::merge_parallel_outputs`].
    pub fn merge_parallel_outputs(&self, outputs: &BTreeMap<String, Value>) -> Map<String, Value> {
        self.policy.merge_parallel_outputs(outputs)
    }

    /// Constraint-aware merge; incompatible contributions are also added to
    /// the conflict registry.
    pub async fn merge_with_constraints(
        &self,
        current: &Map<String, Value>,
        update: &Map<String, Value>,
    ) -> Map<String, Value> {
        let (merged, records) = self.policy.merge_with_constraints(current, update);
        if !records.is_empty() {
            let mut state = self.state.lock().await;
            state.conflicts.extend(records);
        }
        merged
    }

    pub async fn record_conflict(&self, record: ConflictRecord) {
        log::info!(
            "[Blackboard] conflict recorded: {} ({})",
            record.participant,
            record.conflict_type
        );
        self.state.lock().await.conflicts.push(record);
    }

    pub async fn conflicts(&self) -> Vec<ConflictRecord> {
        self.state.lock().await.conflicts.clone()
    }

    /// Deep copy of every space and the conflict registry.
    pub async fn get_state_snapshot(&self) -> BlackboardSnapshot {
        let state = self.state.lock().await;
        BlackboardSnapshot {
            knowledge_spaces: state
                .spaces
                .iter()
                .map(|(space, entries)| {
                    let copied = entries.iter().map(|(k, e)| (k.clone(), e.clone())).collect();
                    (*space, copied)
                })
                .collect(),
            conflicts: state.conflicts.clone(),
            taken_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
