//! Deterministic candidate ranking from outcome metrics and learned values.

use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{PolicyError, PolicyResult};
use crate::fingerprint::ContextFingerprint;
use crate::outcome::OutcomeMetrics;
use crate::policy_store::PolicyStore;

const BASELINE_CONFIDENCE: f64 = 0.5;
const UNMEASURED_SUCCESS_RATE: f64 = 0.5;
const HIGH_SUCCESS_RATE: f64 = 0.8;
const LOW_SUCCESS_RATE: f64 = 0.5;
const SUCCESS_WEIGHT: f64 = 0.2;
const HIGH_RATING: f64 = 4.0;
const LOW_RATING: f64 = 3.0;
const RATING_WEIGHT: f64 = 0.15;
const FAST_LATENCY_MS: f64 = 1000.0;
const FAST_WEIGHT: f64 = 0.1;
const POLICY_WEIGHT: f64 = 0.2;
const POLICY_SCALE: f64 = 5.0;
const POLICY_VISIBLE: f64 = 0.01;
const SAMPLES_WEIGHT: f64 = 0.05;
const CONFIDENCE_SCALE: f64 = 3.0;

/// Inputs that produced a recommendation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MetricsSnapshot {
    /// Success rate, 0.5 when the action was never measured.
    pub success_rate: f64,
    /// Mean user rating, if any.
    pub avg_rating: Option<f64>,
    /// Mean latency, if any.
    pub avg_latency_ms: Option<f64>,
    /// Recorded invocations.
    pub total_calls: u64,
    /// Learned value for the action in this context.
    pub policy_value: f64,
}

/// One ranked candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Recommendation {
    /// Candidate action.
    pub action_id: String,
    /// Confidence in `[0, 1]`, rounded to 3 decimals.
    pub confidence: f64,
    /// Factors that moved the confidence, comma separated.
    pub rationale: String,
    /// Inputs used.
    pub metrics: MetricsSnapshot,
}

/// Ranks candidates for a context.
pub struct RecommendationRanker {
    store: Arc<PolicyStore>,
    outcomes: Arc<dyn OutcomeMetrics>,
    min_samples: u64,
}

pub(crate) fn logistic(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

impl RecommendationRanker {
    /// Create a ranker over `store` and the outcome aggregates.
    #[must_use]
    pub fn new(store: Arc<PolicyStore>, outcomes: Arc<dyn OutcomeMetrics>, min_samples: u64) -> Self {
        Self {
            store,
            outcomes,
            min_samples,
        }
    }

    /// Learned value of `action_id` in `context`, 0 when unseen.
    #[must_use]
    pub fn policy_value(&self, action_id: &str, context: &ContextFingerprint) -> f64 {
        self.store.read(action_id, context)
    }

    /// Logistic confidence `1 / (1 + e^(-q/3))` of the learned value.
    #[must_use]
    pub fn confidence(&self, action_id: &str, context: &ContextFingerprint) -> f64 {
        logistic(self.policy_value(action_id, context) / CONFIDENCE_SCALE)
    }

    fn score(&self, action_id: &str, context: &ContextFingerprint) -> Recommendation {
        let measured = self.outcomes.action_metrics(action_id);
        let metrics = MetricsSnapshot {
            success_rate: measured
                .as_ref()
                .map_or(UNMEASURED_SUCCESS_RATE, |m| m.success_rate),
            avg_rating: measured.as_ref().and_then(|m| m.avg_rating),
            avg_latency_ms: measured.as_ref().and_then(|m| m.avg_latency_ms),
            total_calls: measured.as_ref().map_or(0, |m| m.total_calls),
            policy_value: self.policy_value(action_id, context),
        };

        let mut confidence = BASELINE_CONFIDENCE;
        let mut factors: Vec<&'static str> = Vec::new();

        if metrics.success_rate > HIGH_SUCCESS_RATE {
            confidence += SUCCESS_WEIGHT;
            factors.push("high success rate");
        } else if metrics.success_rate < LOW_SUCCESS_RATE {
            confidence -= SUCCESS_WEIGHT;
            factors.push("low success rate");
        }

        if let Some(rating) = metrics.avg_rating {
            if rating >= HIGH_RATING {
                confidence += RATING_WEIGHT;
                factors.push("high user rating");
            } else if rating < LOW_RATING {
                confidence -= RATING_WEIGHT;
                factors.push("low user rating");
            }
        }

        if let Some(latency) = metrics.avg_latency_ms
            && latency > 0.0
            && latency < FAST_LATENCY_MS
        {
            confidence += FAST_WEIGHT;
            factors.push("fast execution");
        }

        let policy_term = POLICY_WEIGHT * (metrics.policy_value / POLICY_SCALE).tanh();
        confidence += policy_term;
        if policy_term >= POLICY_VISIBLE {
            factors.push("learned preference");
        } else if policy_term <= -POLICY_VISIBLE {
            factors.push("learned avoidance");
        }

        if metrics.total_calls >= self.min_samples {
            confidence += SAMPLES_WEIGHT;
            factors.push("sufficient samples");
        }

        let rationale = if factors.is_empty() {
            "baseline recommendation".to_string()
        } else {
            factors.join(", ")
        };

        Recommendation {
            action_id: action_id.to_string(),
            confidence: round3(confidence.clamp(0.0, 1.0)),
            rationale,
            metrics,
        }
    }

    /// Rank `candidates` by confidence, highest first; equal confidence
    /// keeps input order.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidInput`] for an empty candidate list.
    pub fn recommend(
        &self,
        context: &ContextFingerprint,
        candidates: &[String],
    ) -> PolicyResult<Vec<Recommendation>> {
        if candidates.is_empty() {
            return Err(PolicyError::invalid("candidates must not be empty"));
        }
        let mut ranked: Vec<Recommendation> = candidates
            .iter()
            .map(|action_id| self.score(action_id, context))
            .collect();
        ranked.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        Ok(ranked)
    }

    /// Top-ranked candidate.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidInput`] for an empty candidate list.
    pub fn best(&self, context: &ContextFingerprint, candidates: &[String]) -> PolicyResult<String> {
        self.recommend(context, candidates)?
            .into_iter()
            .next()
            .map(|recommendation| recommendation.action_id)
            .ok_or_else(|| PolicyError::invalid("candidates must not be empty"))
    }
}
