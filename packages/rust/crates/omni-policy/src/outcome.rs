//! Seams to the outcome log and action catalog collaborators.
//!
//! The engine never produces success/latency/rating itself. It consumes
//! validated [`ExecutionOutcome`] records and per-action aggregates through
//! [`OutcomeMetrics`], and asks an [`ActionCatalog`] which actions exist.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{PolicyError, PolicyResult};

/// One action invocation as recorded by the outcome log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionOutcome {
    /// Invoked action.
    pub action_id: String,
    /// Whether the invocation succeeded.
    pub success: bool,
    /// Wall-clock latency in milliseconds (>= 0).
    pub latency_ms: f64,
    /// Optional 1-5 user rating.
    pub user_rating: Option<u8>,
    /// When the invocation finished.
    pub timestamp: DateTime<Utc>,
}

impl ExecutionOutcome {
    /// Validate and build an outcome record stamped now.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidInput`] for an empty action id, a
    /// negative or non-finite latency, or a rating outside 1-5.
    pub fn new(
        action_id: impl Into<String>,
        success: bool,
        latency_ms: f64,
        user_rating: Option<u8>,
    ) -> PolicyResult<Self> {
        let outcome = Self {
            action_id: action_id.into(),
            success,
            latency_ms,
            user_rating,
            timestamp: Utc::now(),
        };
        outcome.validate()?;
        Ok(outcome)
    }

    /// Re-check invariants on a record received from elsewhere.
    ///
    /// # Errors
    ///
    /// Same conditions as [`ExecutionOutcome::new`].
    pub fn validate(&self) -> PolicyResult<()> {
        if self.action_id.trim().is_empty() {
            return Err(PolicyError::invalid("action_id must not be empty"));
        }
        if !self.latency_ms.is_finite() || self.latency_ms < 0.0 {
            return Err(PolicyError::invalid(format!(
                "latency_ms must be finite and >= 0, got {}",
                self.latency_ms
            )));
        }
        if let Some(rating) = self.user_rating
            && !(1..=5).contains(&rating)
        {
            return Err(PolicyError::invalid(format!(
                "user_rating must be within 1-5, got {rating}"
            )));
        }
        Ok(())
    }

    /// Strictly parse an outcome record from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidInput`] for empty or malformed JSON and
    /// for records that fail [`ExecutionOutcome::validate`].
    pub fn from_json(raw: &str) -> PolicyResult<Self> {
        if raw.trim().is_empty() {
            return Err(PolicyError::invalid("empty outcome payload"));
        }
        let outcome: Self = serde_json::from_str(raw)
            .map_err(|error| PolicyError::invalid(format!("invalid outcome json: {error}")))?;
        outcome.validate()?;
        Ok(outcome)
    }
}

/// Aggregate outcome statistics for one action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ActionMetrics {
    /// Number of recorded invocations.
    pub total_calls: u64,
    /// Fraction of successful invocations.
    pub success_rate: f64,
    /// Mean user rating over rated invocations.
    pub avg_rating: Option<f64>,
    /// Mean latency over all invocations.
    pub avg_latency_ms: Option<f64>,
}

/// Read side of the outcome log.
pub trait OutcomeMetrics: Send + Sync {
    /// Aggregates for an action, `None` if it was never recorded.
    fn action_metrics(&self, action_id: &str) -> Option<ActionMetrics>;

    /// Mean latency for an action, used by the efficiency bonus.
    fn avg_latency_ms(&self, action_id: &str) -> Option<f64> {
        self.action_metrics(action_id)
            .and_then(|metrics| metrics.avg_latency_ms)
    }
}

#[derive(Debug, Default, Clone)]
struct OutcomeTotals {
    calls: u64,
    successes: u64,
    latency_sum_ms: f64,
    rating_sum: f64,
    rated_calls: u64,
}

/// In-process outcome log aggregating [`ExecutionOutcome`]s per action.
#[derive(Debug, Default)]
pub struct InMemoryOutcomeLog {
    totals: DashMap<String, OutcomeTotals>,
}

impl InMemoryOutcomeLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold an outcome into the per-action aggregates.
    pub fn record(&self, outcome: &ExecutionOutcome) {
        let mut totals = self.totals.entry(outcome.action_id.clone()).or_default();
        totals.calls += 1;
        if outcome.success {
            totals.successes += 1;
        }
        totals.latency_sum_ms += outcome.latency_ms;
        if let Some(rating) = outcome.user_rating {
            totals.rating_sum += f64::from(rating);
            totals.rated_calls += 1;
        }
    }

    /// Number of actions with at least one record.
    #[must_use]
    pub fn len(&self) -> usize {
        self.totals.len()
    }

    /// Whether nothing was recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }
}

impl OutcomeMetrics for InMemoryOutcomeLog {
    #[allow(clippy::cast_precision_loss)]
    fn action_metrics(&self, action_id: &str) -> Option<ActionMetrics> {
        let totals = self.totals.get(action_id)?;
        if totals.calls == 0 {
            return None;
        }
        let calls = totals.calls as f64;
        Some(ActionMetrics {
            total_calls: totals.calls,
            success_rate: totals.successes as f64 / calls,
            avg_rating: (totals.rated_calls > 0)
                .then(|| totals.rating_sum / totals.rated_calls as f64),
            avg_latency_ms: Some(totals.latency_sum_ms / calls),
        })
    }
}

/// Outcome metrics source that knows nothing; every action is unmeasured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOutcomeMetrics;

impl OutcomeMetrics for NoOutcomeMetrics {
    fn action_metrics(&self, _action_id: &str) -> Option<ActionMetrics> {
        None
    }
}

/// Source of the actions available at a call site.
pub trait ActionCatalog: Send + Sync {
    /// Action ids offered at `call_site`, in preference order.
    fn available_actions(&self, call_site: &str) -> Vec<String>;
}

/// Catalog backed by a fixed map with a fallback list.
#[derive(Debug, Default)]
pub struct StaticActionCatalog {
    default_actions: Vec<String>,
    by_call_site: RwLock<HashMap<String, Vec<String>>>,
}

impl StaticActionCatalog {
    /// Catalog offering the same actions everywhere unless overridden.
    #[must_use]
    pub fn new(default_actions: Vec<String>) -> Self {
        Self {
            default_actions,
            by_call_site: RwLock::new(HashMap::new()),
        }
    }

    /// Restrict a call site to a specific action list.
    pub fn set_call_site(&self, call_site: impl Into<String>, actions: Vec<String>) {
        self.by_call_site
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(call_site.into(), actions);
    }
}

impl ActionCatalog for StaticActionCatalog {
    fn available_actions(&self, call_site: &str) -> Vec<String> {
        self.by_call_site
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(call_site)
            .cloned()
            .unwrap_or_else(|| self.default_actions.clone())
    }
}
