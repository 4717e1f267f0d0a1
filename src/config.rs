//! Runtime settings.
//!
//! Settings are loaded once at process start and passed by reference into the
//! components that need them. Sources, in order of precedence:
//!
//! 1. Environment overrides (`REQMAS_*`)
//! 2. A YAML or JSON file named by `REQMAS_CONFIG`
//! 3. Built-in defaults

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use crate::resilience::circuit_breaker::BreakerConfig;

/// Errors raised while loading or validating settings and catalogs.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file content did not deserialize.
    #[error("Parse error in {path}: {message}")]
    Parse { path: PathBuf, message: String },

    /// The file extension is neither YAML nor JSON.
    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(PathBuf),

    /// A value is present but out of range or malformed.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

impl ConfigError {
    fn invalid(key: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Read and deserialize a YAML (`.yaml`/`.yml`) or JSON (`.json`) file.
pub(crate) fn load_structured<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    let is_yaml = match ext.as_deref() {
        Some("yaml") | Some("yml") => true,
        Some("json") => false,
        _ => return Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
    };

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let parsed = if is_yaml {
        serde_yaml::from_str(&content).map_err(|e| e.to_string())
    } else {
        serde_json::from_str(&content).map_err(|e| e.to_string())
    };
    parsed.map_err(|message| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    })
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Blackboard settings: participant precedence for merging parallel outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlackboardSettings {
    #[serde(default = "default_agent_priorities")]
    pub agent_priorities: BTreeMap<String, i64>,
}

fn default_agent_priorities() -> BTreeMap<String, i64> {
    [
        ("io_expert", 1000),
        ("system_expert", 100),
        ("communication_expert", 100),
        ("orchestrator", 10),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

impl Default for BlackboardSettings {
    fn default() -> Self {
        Self {
            agent_priorities: default_agent_priorities(),
        }
    }
}

/// Message bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSettings {
    /// Subscriber failures per sender before that sender is cut off.
    #[serde(default = "default_bus_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds before an opened sender breaker is moved to half-open.
    #[serde(default = "default_recovery_delay_secs")]
    pub recovery_delay_secs: f64,
    /// Dequeue timeout of the dispatch loop.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Messages kept in the history log.
    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

fn default_bus_failure_threshold() -> u32 { 5 }
fn default_recovery_delay_secs() -> f64 { 10.0 }
fn default_poll_interval_ms() -> u64 { 1000 }
fn default_max_history() -> usize { 100 }

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_bus_failure_threshold(),
            recovery_delay_secs: default_recovery_delay_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            max_history: default_max_history(),
        }
    }
}

impl BusSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn recovery_delay(&self) -> Duration {
        Duration::from_secs_f64(self.recovery_delay_secs.max(0.0))
    }

    /// Breaker tuning for one sender. Recovery is driven by the bus's own
    /// scheduled half-open transition, so a single probe success closes it.
    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout_secs: self.recovery_delay_secs,
            half_open_quota: 1,
        }
    }
}

/// Agent execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_agent_timeout_secs")]
    pub timeout_secs: f64,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_true")]
    pub fallback_enabled: bool,
}

fn default_agent_timeout_secs() -> f64 { 3.0 }
fn default_confidence_threshold() -> f64 { 0.7 }
fn default_true() -> bool { true }

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_agent_timeout_secs(),
            confidence_threshold: default_confidence_threshold(),
            fallback_enabled: true,
        }
    }
}

impl AgentSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs.max(0.0))
    }
}

/// Relative weight of each validation phase in a round's confidence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseWeights {
    #[serde(default = "default_technical_weight")]
    pub technical: f64,
    #[serde(default = "default_commercial_weight")]
    pub commercial: f64,
    #[serde(default = "default_csp_weight")]
    pub csp: f64,
}

fn default_technical_weight() -> f64 { 0.4 }
fn default_commercial_weight() -> f64 { 0.3 }
fn default_csp_weight() -> f64 { 0.3 }

impl Default for PhaseWeights {
    fn default() -> Self {
        Self {
            technical: default_technical_weight(),
            commercial: default_commercial_weight(),
            csp: default_csp_weight(),
        }
    }
}

/// Validation pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    #[serde(default = "default_consensus_threshold")]
    pub consensus_threshold: f64,
    #[serde(default)]
    pub weights: PhaseWeights,
    /// Multiplier applied to a fallback-sourced phase confidence.
    #[serde(default = "default_fallback_discount")]
    pub fallback_discount: f64,
    /// Tuning shared by the three phase breakers.
    #[serde(default)]
    pub breaker: BreakerConfig,
}

fn default_max_rounds() -> u32 { 3 }
fn default_consensus_threshold() -> f64 { 0.85 }
fn default_fallback_discount() -> f64 { 0.7 }

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            consensus_threshold: default_consensus_threshold(),
            weights: PhaseWeights::default(),
            fallback_discount: default_fallback_discount(),
            breaker: BreakerConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Top-level settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub blackboard: BlackboardSettings,
    #[serde(default)]
    pub message_bus: BusSettings,
    #[serde(default)]
    pub agents: AgentSettings,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Product catalog file; the built-in catalog is used when unset.
    #[serde(default)]
    pub catalog_path: Option<PathBuf>,
}

impl Settings {
    /// Parse settings from a YAML or JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        load_structured(path.as_ref())
    }

    /// `REQMAS_CONFIG` file if set, else defaults; then environment
    /// overrides; then validation.
    pub fn load() -> Result<Self, ConfigError> {
        let mut settings = match std::env::var("REQMAS_CONFIG") {
            Ok(path) if !path.trim().is_empty() => {
                log::debug!("[Settings] loading {}", path);
                Self::from_file(path.trim())?
            }
            _ => Self::default(),
        };
        settings.apply_env()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Overlay `REQMAS_*` environment variables.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("REQMAS_MAX_ROUNDS") {
            self.pipeline.max_rounds = parse_env("REQMAS_MAX_ROUNDS", &raw)?;
        }
        if let Some(raw) = lookup("REQMAS_CONSENSUS_THRESHOLD") {
            self.pipeline.consensus_threshold = parse_env("REQMAS_CONSENSUS_THRESHOLD", &raw)?;
        }
        if let Some(raw) = lookup("REQMAS_AGENT_TIMEOUT_SECS") {
            self.agents.timeout_secs = parse_env("REQMAS_AGENT_TIMEOUT_SECS", &raw)?;
        }
        if let Some(raw) = lookup("REQMAS_CATALOG") {
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                self.catalog_path = Some(PathBuf::from(trimmed));
            }
        }
        Ok(())
    }

    /// Reject settings the components cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.pipeline;
        if p.max_rounds == 0 {
            return Err(ConfigError::invalid("pipeline.max_rounds", "must be at least 1"));
        }
        check_unit("pipeline.consensus_threshold", p.consensus_threshold)?;
        check_unit("pipeline.fallback_discount", p.fallback_discount)?;
        check_unit("agents.confidence_threshold", self.agents.confidence_threshold)?;

        let w = &p.weights;
        for (key, value) in [
            ("pipeline.weights.technical", w.technical),
            ("pipeline.weights.commercial", w.commercial),
            ("pipeline.weights.csp", w.csp),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ConfigError::invalid(key, "must be a non-negative number"));
            }
        }
        if w.technical + w.commercial + w.csp <= 0.0 {
            return Err(ConfigError::invalid("pipeline.weights", "must not all be zero"));
        }

        if p.breaker.failure_threshold == 0 {
            return Err(ConfigError::invalid("pipeline.breaker.failure_threshold", "must be at least 1"));
        }
        if p.breaker.half_open_quota == 0 {
            return Err(ConfigError::invalid("pipeline.breaker.half_open_quota", "must be at least 1"));
        }
        if self.message_bus.failure_threshold == 0 {
            return Err(ConfigError::invalid("message_bus.failure_threshold", "must be at least 1"));
        }
        if !(self.agents.timeout_secs.is_finite() && self.agents.timeout_secs > 0.0) {
            return Err(ConfigError::invalid("agents.timeout_secs", "must be positive"));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::invalid(key, format!("{:?}: {}", raw, e)))
}

fn check_unit(key: &str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::invalid(key, format!("{} is outside [0, 1]", value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.pipeline.max_rounds, 3);
        assert_eq!(s.pipeline.consensus_threshold, 0.85);
        assert_eq!(s.pipeline.weights.technical, 0.4);
        assert_eq!(s.pipeline.breaker.failure_threshold, 5);
        assert_eq!(s.message_bus.max_history, 100);
        assert_eq!(s.message_bus.poll_interval(), Duration::from_secs(1));
        assert_eq!(s.blackboard.agent_priorities["io_expert"], 1000);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_yaml_partial_file_keeps_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "pipeline:\n  max_rounds: 5\n  breaker:\n    failure_threshold: 2").unwrap();

        let s = Settings::from_file(file.path()).unwrap();
        assert_eq!(s.pipeline.max_rounds, 5);
        assert_eq!(s.pipeline.breaker.failure_threshold, 2);
        assert_eq!(s.pipeline.breaker.half_open_quota, 3);
        assert_eq!(s.pipeline.consensus_threshold, 0.85);
        assert_eq!(s.agents.timeout_secs, 3.0);
    }

    #[test]
    fn test_json_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"message_bus": {{"max_history": 10}}}}"#).unwrap();
        let s = Settings::from_file(file.path()).unwrap();
        assert_eq!(s.message_bus.max_history, 10);
    }

    #[test]
    fn test_unsupported_and_malformed() {
        let file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        assert!(matches!(
            Settings::from_file(file.path()),
            Err(ConfigError::UnsupportedFormat(_))
        ));

        let mut bad = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(bad, "{{ not json").unwrap();
        assert!(matches!(Settings::from_file(bad.path()), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("REQMAS_MAX_ROUNDS", "4"),
            ("REQMAS_CONSENSUS_THRESHOLD", "0.9"),
            ("REQMAS_CATALOG", "/tmp/catalog.yaml"),
        ]
        .into_iter()
        .collect();
        let mut s = Settings::default();
        s.apply_overrides(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(s.pipeline.max_rounds, 4);
        assert_eq!(s.pipeline.consensus_threshold, 0.9);
        assert_eq!(s.catalog_path, Some(PathBuf::from("/tmp/catalog.yaml")));
    }

    #[test]
    fn test_env_override_malformed() {
        let mut s = Settings::default();
        let err = s
            .apply_overrides(|k| (k == "REQMAS_AGENT_TIMEOUT_SECS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "REQMAS_AGENT_TIMEOUT_SECS"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut s = Settings::default();
        s.pipeline.max_rounds = 0;
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.pipeline.consensus_threshold = 1.5;
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.pipeline.breaker.half_open_quota = 0;
        assert!(s.validate().is_err());
    }
}
