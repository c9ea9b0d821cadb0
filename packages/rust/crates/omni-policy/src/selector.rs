//! Explore/exploit action selection.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{PolicyError, PolicyResult};
use crate::fingerprint::ContextFingerprint;
use crate::observability::PolicyEvent;
use crate::ranker::{RecommendationRanker, logistic};

const UCB_VALUE_SCALE: f64 = 5.0;

/// How [`ActionSelector::select`] trades exploration for exploitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Random candidate with probability epsilon, otherwise the top-ranked one.
    EpsilonGreedy,
    /// Upper confidence bound over squashed learned values.
    Ucb,
}

impl SelectionStrategy {
    /// String form used in settings and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EpsilonGreedy => "epsilon_greedy",
            Self::Ucb => "ucb",
        }
    }
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionStrategy {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "epsilon_greedy" | "epsilon" | "greedy" => Ok(Self::EpsilonGreedy),
            "ucb" => Ok(Self::Ucb),
            other => Err(PolicyError::invalid(format!(
                "unknown selection strategy `{other}` (expected epsilon_greedy or ucb)"
            ))),
        }
    }
}

/// Outcome of one selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Selection {
    /// Chosen action.
    pub action_id: String,
    /// Whether the pick came from exploration rather than exploitation.
    pub was_exploration: bool,
}

/// Snapshot of [`ExplorationState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExplorationStats {
    /// Current epsilon.
    pub exploration_rate: f64,
    /// Epsilon restored by a reset.
    pub initial_rate: f64,
    /// Selections since the last reset.
    pub total_selections: u64,
    /// Per-action selection counts since the last reset.
    pub action_counts: BTreeMap<String, u64>,
}

/// Process-scoped exploration bookkeeping.
#[derive(Debug, Clone)]
pub struct ExplorationState {
    rate: f64,
    initial_rate: f64,
    counts: BTreeMap<String, u64>,
    total: u64,
}

impl ExplorationState {
    fn new(initial_rate: f64) -> Self {
        Self {
            rate: initial_rate,
            initial_rate,
            counts: BTreeMap::new(),
            total: 0,
        }
    }

    fn count(&self, action_id: &str) -> u64 {
        self.counts.get(action_id).copied().unwrap_or(0)
    }

    fn record(&mut self, action_id: &str, decay: f64, floor: f64) {
        *self.counts.entry(action_id.to_string()).or_insert(0) += 1;
        self.total = self.total.saturating_add(1);
        // Decay shrinks toward the floor but never lifts a rate below it.
        self.rate = (self.rate * decay).max(floor.min(self.rate));
    }

    fn stats(&self) -> ExplorationStats {
        ExplorationStats {
            exploration_rate: self.rate,
            initial_rate: self.initial_rate,
            total_selections: self.total,
            action_counts: self.counts.clone(),
        }
    }
}

/// Chooses one action from a candidate list.
pub struct ActionSelector {
    state: Mutex<ExplorationState>,
    rng: Mutex<StdRng>,
    decay: f64,
    floor: f64,
    ucb_c: f64,
}

impl ActionSelector {
    /// Create a selector. A `seed` makes exploration draws reproducible.
    #[must_use]
    pub fn new(
        exploration_rate: f64,
        decay: f64,
        floor: f64,
        ucb_c: f64,
        seed: Option<u64>,
    ) -> Self {
        Self {
            state: Mutex::new(ExplorationState::new(exploration_rate)),
            rng: Mutex::new(seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64)),
            decay,
            floor,
            ucb_c,
        }
    }

    fn state(&self) -> MutexGuard<'_, ExplorationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn validate(candidates: &[String]) -> PolicyResult<()> {
        if candidates.is_empty() {
            return Err(PolicyError::invalid("candidates must not be empty"));
        }
        if candidates.iter().any(|action| action.trim().is_empty()) {
            return Err(PolicyError::invalid("candidates must not contain blank action ids"));
        }
        Ok(())
    }

    /// Pick one of `candidates` for `context`.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidInput`] for an empty or blank candidate.
    pub fn select(
        &self,
        context: &ContextFingerprint,
        candidates: &[String],
        strategy: SelectionStrategy,
        ranker: &RecommendationRanker,
    ) -> PolicyResult<Selection> {
        Self::validate(candidates)?;
        let selection = match strategy {
            SelectionStrategy::EpsilonGreedy => self.epsilon_greedy(context, candidates, ranker)?,
            SelectionStrategy::Ucb => self.ucb(context, candidates, ranker),
        };

        let rate = {
            let mut state = self.state();
            state.record(&selection.action_id, self.decay, self.floor);
            state.rate
        };
        tracing::debug!(
            event = PolicyEvent::SelectionMade.as_str(),
            strategy = strategy.as_str(),
            action_id = %selection.action_id,
            was_exploration = selection.was_exploration,
            exploration_rate = rate,
            context = %context,
            "action selected"
        );
        Ok(selection)
    }

    fn epsilon_greedy(
        &self,
        context: &ContextFingerprint,
        candidates: &[String],
        ranker: &RecommendationRanker,
    ) -> PolicyResult<Selection> {
        let rate = self.state().rate;
        let explore_pick = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            (rng.r#gen::<f64>() < rate).then(|| rng.gen_range(0..candidates.len()))
        };
        if let Some(index) = explore_pick {
            return Ok(Selection {
                action_id: candidates[index].clone(),
                was_exploration: true,
            });
        }
        Ok(Selection {
            action_id: ranker.best(context, candidates)?,
            was_exploration: false,
        })
    }

    #[allow(clippy::cast_precision_loss)]
    fn ucb(
        &self,
        context: &ContextFingerprint,
        candidates: &[String],
        ranker: &RecommendationRanker,
    ) -> Selection {
        let state = self.state();
        let log_total = ((state.total + 1) as f64).ln();

        let mut best_ucb = (0, f64::NEG_INFINITY);
        let mut best_value = (0, f64::NEG_INFINITY);
        for (index, action_id) in candidates.iter().enumerate() {
            let avg_value = logistic(ranker.policy_value(action_id, context) / UCB_VALUE_SCALE);
            let bonus =
                self.ucb_c * (log_total / (state.count(action_id) + 1) as f64).sqrt();
            let score = avg_value + bonus;
            if score > best_ucb.1 {
                best_ucb = (index, score);
            }
            if avg_value > best_value.1 {
                best_value = (index, avg_value);
            }
        }

        Selection {
            action_id: candidates[best_ucb.0].clone(),
            was_exploration: best_ucb.0 != best_value.0,
        }
    }

    /// Restore the initial exploration rate and clear selection counters.
    pub fn reset_exploration(&self) {
        let mut state = self.state();
        let previous_rate = state.rate;
        let initial_rate = state.initial_rate;
        *state = ExplorationState::new(initial_rate);
        tracing::info!(
            event = PolicyEvent::ExplorationReset.as_str(),
            previous_rate,
            exploration_rate = state.rate,
            "exploration state reset"
        );
    }

    /// Current exploration rate.
    #[must_use]
    pub fn exploration_rate(&self) -> f64 {
        self.state().rate
    }

    /// Snapshot of the exploration state.
    #[must_use]
    pub fn exploration_stats(&self) -> ExplorationStats {
        self.state().stats()
    }
}
