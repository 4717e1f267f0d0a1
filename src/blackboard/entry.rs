//! Blackboard entries, spaces and conflict records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The fixed knowledge spaces, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeSpace {
    /// Unprocessed input (requirements, specifications).
    Raw,
    /// Per-agent outputs.
    Processed,
    /// Validation results.
    Validated,
    /// Session-level consolidated state (profile, decisions).
    Consolidated,
}

impl KnowledgeSpace {
    pub const ALL: [KnowledgeSpace; 4] = [
        KnowledgeSpace::Raw,
        KnowledgeSpace::Processed,
        KnowledgeSpace::Validated,
        KnowledgeSpace::Consolidated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Processed => "processed",
            Self::Validated => "validated",
            Self::Consolidated => "consolidated",
        }
    }
}

impl fmt::Display for KnowledgeSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a space name is not one of the four known spaces.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown knowledge space: {0}")]
pub struct UnknownSpace(pub String);

impl FromStr for KnowledgeSpace {
    type Err = UnknownSpace;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(Self::Raw),
            "processed" => Ok(Self::Processed),
            "validated" => Ok(Self::Validated),
            "consolidated" => Ok(Self::Consolidated),
            other => Err(UnknownSpace(other.to_string())),
        }
    }
}

/// A single value stored under a key, with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub value: Value,
    pub writer_id: String,
    pub timestamp: DateTime<Utc>,
}

impl KnowledgeEntry {
    pub fn new(value: Value, writer_id: impl Into<String>) -> Self {
        Self {
            value,
            writer_id: writer_id.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A detected disagreement between participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Participant whose contribution was held back.
    pub participant: String,
    /// e.g. `io_incompatible`, `concurrent_update`.
    pub conflict_type: String,
    #[serde(default)]
    pub details: Value,
    pub detected_at: DateTime<Utc>,
}

impl ConflictRecord {
    pub fn new(participant: impl Into<String>, conflict_type: impl Into<String>, details: Value) -> Self {
        Self {
            participant: participant.into(),
            conflict_type: conflict_type.into(),
            details,
            detected_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_space_parse_roundtrip() {
        for space in KnowledgeSpace::ALL {
            assert_eq!(space.as_str().parse::<KnowledgeSpace>().unwrap(), space);
        }
        assert_eq!(
            "archive".parse::<KnowledgeSpace>(),
            Err(UnknownSpace("archive".into()))
        );
    }

    #[test]
    fn test_entry_records_writer() {
        let entry = KnowledgeEntry::new(serde_json::json!({"io": 8}), "io_expert");
        assert_eq!(entry.writer_id, "io_expert");
        assert_eq!(entry.value["io"], 8);
    }
}
