//! Vector clocks for causal ordering between participants.
//!
//! Each participant owns one monotonically non-decreasing counter. Two clocks
//! are compared componentwise; a participant missing from a clock counts as
//! zero. Clocks that are each ahead on some component are concurrent, which
//! is how conflicting updates are detected.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Participant id → counter snapshot.
pub type ClockMap = BTreeMap<String, u64>;

/// Result of comparing two clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockOrdering {
    /// Self happened before the other clock.
    Before,
    /// Self happened after the other clock.
    After,
    /// Neither clock dominates.
    Concurrent,
    /// Identical causal history.
    Equal,
}

impl ClockOrdering {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Before => "before",
            Self::After => "after",
            Self::Concurrent => "concurrent",
            Self::Equal => "equal",
        }
    }
}

impl fmt::Display for ClockOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anything that carries a vector clock snapshot.
pub trait Clocked {
    /// The clock attached to this update.
    fn vector_clock(&self) -> ClockMap;
}

impl Clocked for ClockMap {
    fn vector_clock(&self) -> ClockMap {
        self.clone()
    }
}

/// JSON payloads carry their clock under a `vector_clock` object.
///
/// Missing or malformed clocks read as empty; negative or non-integer
/// counters are ignored.
impl Clocked for Value {
    fn vector_clock(&self) -> ClockMap {
        self.get("vector_clock")
            .and_then(Value::as_object)
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_u64().map(|n| (k.clone(), n)))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A mutable vector clock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    clock: ClockMap,
}

impl VectorClock {
    /// Create an empty clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a clock from an existing snapshot.
    pub fn from_map(clock: ClockMap) -> Self {
        Self { clock }
    }

    /// Advance `participant` by one and return a copy of the new state.
    pub fn increment(&mut self, participant: &str) -> ClockMap {
        *self.clock.entry(participant.to_string()).or_insert(0) += 1;
        self.clock.clone()
    }

    /// Absorb `other` by taking the pointwise maximum.
    pub fn update(&mut self, other: &ClockMap) {
        for (participant, &value) in other {
            let entry = self.clock.entry(participant.clone()).or_insert(0);
            *entry = (*entry).max(value);
        }
    }

    /// Pointwise maximum of self and `other`, without mutating self.
    pub fn merge(&self, other: &ClockMap) -> ClockMap {
        let mut merged = self.clock.clone();
        for (participant, &value) in other {
            let entry = merged.entry(participant.clone()).or_insert(0);
            *entry = (*entry).max(value);
        }
        merged
    }

    /// Causal relation of self to `other`.
    ///
    /// Missing participants read as zero, so `{a: 0}` and `{}` are `Equal`.
    pub fn compare(&self, other: &ClockMap) -> ClockOrdering {
        let (self_ahead, other_ahead) = dominance(&self.clock, other);
        match (self_ahead, other_ahead) {
            (false, false) => ClockOrdering::Equal,
            (false, true) => ClockOrdering::Before,
            (true, false) => ClockOrdering::After,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    pub fn is_concurrent(&self, other: &ClockMap) -> bool {
        self.compare(other) == ClockOrdering::Concurrent
    }

    /// Counter for `participant` (zero when absent).
    pub fn get(&self, participant: &str) -> u64 {
        self.clock.get(participant).copied().unwrap_or(0)
    }

    /// Copy of the current state.
    pub fn to_map(&self) -> ClockMap {
        self.clock.clone()
    }

    /// Whether two raw clocks are concurrent.
    pub fn concurrent(a: &ClockMap, b: &ClockMap) -> bool {
        let (a_ahead, b_ahead) = dominance(a, b);
        a_ahead && b_ahead
    }

    /// Every unordered pair of updates whose clocks are concurrent.
    ///
    /// Pairs are reported in index order `(i, j)` with `i < j`.
    pub fn detect_conflicts<T: Clocked>(updates: &[T]) -> Vec<(&T, &T)> {
        let clocks: Vec<ClockMap> = updates.iter().map(Clocked::vector_clock).collect();
        let mut conflicts = Vec::new();
        for i in 0..updates.len() {
            for j in (i + 1)..updates.len() {
                if Self::concurrent(&clocks[i], &clocks[j]) {
                    conflicts.push((&updates[i], &updates[j]));
                }
            }
        }
        conflicts
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (participant, value)) in self.clock.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", participant, value)?;
        }
        write!(f, "}}")
    }
}

/// `(a exceeds b somewhere, b exceeds a somewhere)` over the union of keys.
fn dominance(a: &ClockMap, b: &ClockMap) -> (bool, bool) {
    let mut a_ahead = false;
    let mut b_ahead = false;
    for key in a.keys().chain(b.keys()) {
        let av = a.get(key).copied().unwrap_or(0);
        let bv = b.get(key).copied().unwrap_or(0);
        if av > bv {
            a_ahead = true;
        } else if bv > av {
            b_ahead = true;
        }
        if a_ahead && b_ahead {
            break;
        }
    }
    (a_ahead, b_ahead)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
