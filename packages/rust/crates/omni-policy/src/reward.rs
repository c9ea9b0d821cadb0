//! Reward shaping for action outcomes.
//!
//! Components:
//! - Success: +10 if succeeded, -5 if failed
//! - User rating: `(rating - 3) * 2`
//! - Latency: `-0.1 * (latency_ms / 1000)`
//! - Efficiency: +2 if latency is under 80% of the action's average
//!
//! Total lands roughly in `[-9, +16.2]`. Inputs are assumed validated by
//! [`ExecutionOutcome::validate`](crate::ExecutionOutcome::validate).

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::outcome::ExecutionOutcome;

const SUCCESS_REWARD: f64 = 10.0;
const FAILURE_REWARD: f64 = -5.0;
const NEUTRAL_RATING: f64 = 3.0;
const RATING_WEIGHT: f64 = 2.0;
const LATENCY_PENALTY_PER_SECOND: f64 = 0.1;
const EFFICIENCY_RATIO: f64 = 0.8;
const EFFICIENCY_BONUS: f64 = 2.0;

/// Individual reward terms, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RewardBreakdown {
    /// +10 / -5 success term.
    pub base: f64,
    /// Rating term, 0 when unrated.
    pub rating: f64,
    /// Non-positive latency term.
    pub latency_penalty: f64,
    /// 0 or +2.
    pub efficiency_bonus: f64,
}

impl RewardBreakdown {
    /// Sum of all terms.
    #[must_use]
    pub fn total(&self) -> f64 {
        self.base + self.rating + self.latency_penalty + self.efficiency_bonus
    }
}

/// Break an outcome down into reward terms.
#[must_use]
pub fn reward_breakdown(outcome: &ExecutionOutcome, avg_latency_ms: Option<f64>) -> RewardBreakdown {
    let base = if outcome.success {
        SUCCESS_REWARD
    } else {
        FAILURE_REWARD
    };
    let rating = outcome
        .user_rating
        .map_or(0.0, |rating| (f64::from(rating) - NEUTRAL_RATING) * RATING_WEIGHT);

    let mut latency_penalty = 0.0;
    let mut efficiency_bonus = 0.0;
    // Zero latency means "not measured" in the outcome log.
    if outcome.latency_ms > 0.0 {
        latency_penalty = -LATENCY_PENALTY_PER_SECOND * (outcome.latency_ms / 1000.0);
        if let Some(avg) = avg_latency_ms
            && avg > 0.0
            && outcome.latency_ms < avg * EFFICIENCY_RATIO
        {
            efficiency_bonus = EFFICIENCY_BONUS;
        }
    }

    RewardBreakdown {
        base,
        rating,
        latency_penalty,
        efficiency_bonus,
    }
}

/// Scalar reward for an outcome.
#[must_use]
pub fn calculate_reward(outcome: &ExecutionOutcome, avg_latency_ms: Option<f64>) -> f64 {
    reward_breakdown(outcome, avg_latency_ms).total()
}
