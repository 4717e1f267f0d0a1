//! Confidence aggregation across phases and rounds.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::PhaseWeights;

/// Agreement between component scores, judged by the coefficient of
/// variation (standard deviation over mean).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusLevel {
    /// Variation below 0.1.
    High,
    /// Variation below 0.25.
    Medium,
    Low,
    SingleSource,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMethod {
    WeightedAverage,
    Median,
    ConservativeMin,
    NoData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceStatistics {
    pub weighted_average: f64,
    pub simple_average: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    pub std_dev: f64,
}

/// Result of [`ConfidenceAggregator::aggregate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceAnalysis {
    pub aggregate_confidence: f64,
    pub method: AggregationMethod,
    pub consensus_level: ConsensusLevel,
    pub component_scores: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statistics: Option<ConfidenceStatistics>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Declining,
    Stable,
    InsufficientData,
    NoData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceTrend {
    pub trend: Trend,
    pub current_confidence: f64,
    pub trend_magnitude: f64,
    pub series_length: usize,
}

/// Minimum change in average confidence that counts as a trend.
const TREND_EPSILON: f64 = 0.05;

/// Combines per-phase scores. Components without a configured weight
/// count with weight 1.0.
#[derive(Debug, Clone)]
pub struct ConfidenceAggregator {
    weights: BTreeMap<String, f64>,
}

impl Default for ConfidenceAggregator {
    fn default() -> Self {
        Self::from_weights(&PhaseWeights::default())
    }
}

impl ConfidenceAggregator {
    pub fn new(weights: BTreeMap<String, f64>) -> Self {
        Self { weights }
    }

    pub fn from_weights(weights: &PhaseWeights) -> Self {
        let mut map = BTreeMap::new();
        map.insert("technical".to_string(), weights.technical);
        map.insert("commercial".to_string(), weights.commercial);
        map.insert("csp".to_string(), weights.csp);
        Self::new(map)
    }

    fn weight_of(&self, component: &str) -> f64 {
        self.weights.get(component).copied().unwrap_or(1.0)
    }

    /// Aggregate component scores.
    ///
    /// High consensus uses the weighted average, medium the median, and
    /// anything else the minimum.
    pub fn aggregate(&self, scores: &BTreeMap<String, f64>) -> ConfidenceAnalysis {
        if scores.is_empty() {
            return ConfidenceAnalysis {
                aggregate_confidence: 0.0,
                method: AggregationMethod::NoData,
                consensus_level: ConsensusLevel::None,
                component_scores: BTreeMap::new(),
                statistics: None,
            };
        }

        let values: Vec<f64> = scores.values().copied().collect();
        let n = values.len() as f64;

        let total_weight: f64 = scores.keys().map(|k| self.weight_of(k)).sum();
        let weighted_average = if total_weight > 0.0 {
            scores.iter().map(|(k, v)| v * self.weight_of(k)).sum::<f64>() / total_weight
        } else {
            0.0
        };
        let simple_average = values.iter().sum::<f64>() / n;
        let median = median(&values);
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let std_dev = if values.len() > 1 {
            let var = values.iter().map(|v| (v - simple_average).powi(2)).sum::<f64>() / (n - 1.0);
            var.sqrt()
        } else {
            0.0
        };

        let variation = if simple_average > 0.0 { std_dev / simple_average } else { f64::INFINITY };
        let consensus_level = if values.len() == 1 {
            ConsensusLevel::SingleSource
        } else if variation < 0.1 {
            ConsensusLevel::High
        } else if variation < 0.25 {
            ConsensusLevel::Medium
        } else {
            ConsensusLevel::Low
        };

        let (method, aggregate) = match consensus_level {
            ConsensusLevel::High => (AggregationMethod::WeightedAverage, weighted_average),
            ConsensusLevel::Medium => (AggregationMethod::Median, median),
            _ => (AggregationMethod::ConservativeMin, min),
        };

        ConfidenceAnalysis {
            aggregate_confidence: round3(aggregate),
            method,
            consensus_level,
            component_scores: scores.clone(),
            statistics: Some(ConfidenceStatistics {
                weighted_average: round3(weighted_average),
                simple_average: round3(simple_average),
                median: round3(median),
                min: round3(min),
                max: round3(max),
                std_dev: round3(std_dev),
            }),
        }
    }

    /// Compare the mean of the last three values with the mean of the
    /// values before them.
    pub fn temporal_trend(series: &[f64]) -> ConfidenceTrend {
        let len = series.len();
        let current = series.last().copied().unwrap_or(0.0);
        let report = |trend, magnitude| ConfidenceTrend {
            trend,
            current_confidence: round3(current),
            trend_magnitude: round3(magnitude),
            series_length: len,
        };
        match len {
            0 => return report(Trend::NoData, 0.0),
            1 => return report(Trend::InsufficientData, 0.0),
            _ => {}
        }

        let recent = &series[len.saturating_sub(3)..];
        let earlier = if len > 3 { &series[..len - 3] } else { &series[..len - 1] };
        let delta = mean(recent) - mean(earlier);
        let direction = if delta > TREND_EPSILON {
            Trend::Improving
        } else if delta < -TREND_EPSILON {
            Trend::Declining
        } else {
            Trend::Stable
        };
        report(direction, delta.abs())
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.is_empty() {
        0.0
    } else if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

pub(crate) fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
