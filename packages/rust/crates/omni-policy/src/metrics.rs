//! Rolling-window learning metrics.
//!
//! Every recorded value also becomes a timestamped [`MetricPoint`] queued
//! for persistence; the engine drains the queue into its backend.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const MAX_PENDING_POINTS: usize = 10_000;

/// Metric names recorded by the engine.
pub mod names {
    /// Reward of each recorded outcome.
    pub const REWARD: &str = "reward";
    /// `reward - previous value` of each policy update.
    pub const TD_ERROR: &str = "td_error";
    /// Exploration rate after each selection.
    pub const EXPLORATION_RATE: &str = "exploration_rate";
    /// Total reward of each logged episode.
    pub const EPISODE_REWARD: &str = "episode_reward";
    /// Action count of each logged episode.
    pub const EPISODE_LENGTH: &str = "episode_length";
    /// TD error of replayed experiences.
    pub const REPLAY_TD_ERROR: &str = "replay_td_error";
}

/// Statistics over one metric window. All zero for unknown metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MetricSummary {
    /// Values in the window.
    pub count: usize,
    /// Arithmetic mean.
    pub mean: f64,
    /// Most recent value.
    pub latest: f64,
    /// Smallest value.
    pub min: f64,
    /// Largest value.
    pub max: f64,
    /// Population standard deviation.
    pub std: f64,
}

/// One recorded metric value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MetricPoint {
    /// Metric name.
    pub name: String,
    /// Recorded value.
    pub value: f64,
    /// When the value was recorded.
    pub recorded_at: DateTime<Utc>,
    /// Free-form context, e.g. the action or session involved.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

/// Per-name bounded windows of recent values.
#[derive(Debug)]
pub struct LearningMetrics {
    window: usize,
    series: DashMap<String, VecDeque<f64>>,
    pending: Mutex<VecDeque<MetricPoint>>,
}

impl LearningMetrics {
    /// Keep the last `window` values per metric (at least one).
    #[must_use]
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            series: DashMap::new(),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, VecDeque<MetricPoint>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a value; non-finite values are dropped.
    pub fn record(&self, name: &str, value: f64) {
        self.record_with_metadata(name, value, BTreeMap::new());
    }

    /// Append a value with context kept on the persisted point.
    pub fn record_with_metadata(&self, name: &str, value: f64, metadata: BTreeMap<String, Value>) {
        if !value.is_finite() {
            tracing::debug!(metric = name, value, "dropping non-finite metric value");
            return;
        }
        {
            let mut values = self.series.entry(name.to_string()).or_default();
            if values.len() == self.window {
                values.pop_front();
            }
            values.push_back(value);
        }

        let mut pending = self.lock_pending();
        if pending.len() == MAX_PENDING_POINTS {
            pending.pop_front();
        }
        pending.push_back(MetricPoint {
            name: name.to_string(),
            value,
            recorded_at: Utc::now(),
            metadata,
        });
    }

    /// Points not yet handed to a backend, oldest first.
    #[must_use]
    pub fn pending(&self) -> Vec<MetricPoint> {
        self.lock_pending().iter().cloned().collect()
    }

    /// Number of points not yet handed to a backend.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.lock_pending().len()
    }

    /// Remove and return every pending point.
    pub fn take_pending(&self) -> Vec<MetricPoint> {
        self.lock_pending().drain(..).collect()
    }

    /// Put points back at the front of the queue after a failed flush.
    pub fn restore_pending(&self, points: Vec<MetricPoint>) {
        let mut pending = self.lock_pending();
        for point in points.into_iter().rev() {
            if pending.len() == MAX_PENDING_POINTS {
                break;
            }
            pending.push_front(point);
        }
    }

    /// Summary of `name`'s window.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn summary(&self, name: &str) -> MetricSummary {
        let Some(values) = self.series.get(name) else {
            return MetricSummary::default();
        };
        let Some(&latest) = values.back() else {
            return MetricSummary::default();
        };
        let count = values.len();
        let n = count as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        MetricSummary {
            count,
            mean,
            latest,
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            std: variance.sqrt(),
        }
    }

    /// Summaries of every recorded metric, by name.
    #[must_use]
    pub fn summaries(&self) -> BTreeMap<String, MetricSummary> {
        let names: Vec<String> = self.series.iter().map(|row| row.key().clone()).collect();
        names
            .into_iter()
            .map(|name| {
                let summary = self.summary(&name);
                (name, summary)
            })
            .collect()
    }

    /// Window length.
    #[must_use]
    pub fn window(&self) -> usize {
        self.window
    }
}

impl Default for LearningMetrics {
    fn default() -> Self {
        Self::new(100)
    }
}
