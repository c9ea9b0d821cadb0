//! N-gram patterns mined from successful episodes.
//!
//! Every contiguous run of 2..=n actions in a successful episode is counted
//! together with the episode reward. A candidate is scored against the
//! longest suffix of the recent actions that, followed by the candidate,
//! has been seen before.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::episode::Episode;
use crate::error::{PolicyError, PolicyResult};

/// Aggregate for one n-gram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SequencePattern {
    /// Consecutive actions.
    pub actions: Vec<String>,
    /// Times the run appeared in successful episodes.
    pub occurrences: u64,
    /// Mean reward of the episodes it appeared in (per occurrence).
    pub avg_reward: f64,
}

/// Next-action suggestion derived from patterns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SequenceRecommendation {
    /// Suggested next action.
    pub action_id: String,
    /// `(prefix_len / (n - 1)) * occurrences * avg_reward`.
    pub score: f64,
    /// Occurrences of prefix + action.
    pub occurrences: u64,
    /// Mean episode reward over those occurrences.
    pub avg_reward: f64,
    /// Recent actions the match was made on.
    pub matched_prefix: Vec<String>,
    /// Human-readable explanation.
    pub rationale: String,
}

#[derive(Debug, Clone, Copy, Default)]
struct PatternTotals {
    occurrences: u64,
    reward_sum: f64,
}

impl PatternTotals {
    #[allow(clippy::cast_precision_loss)]
    fn avg_reward(self) -> f64 {
        if self.occurrences == 0 {
            0.0
        } else {
            self.reward_sum / self.occurrences as f64
        }
    }
}

/// Incremental n-gram index.
#[derive(Debug)]
pub struct SequenceLearner {
    max_ngram: usize,
    patterns: RwLock<HashMap<Vec<String>, PatternTotals>>,
}

impl SequenceLearner {
    /// Create a learner mining runs of length 2..=`max_ngram`.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidInput`] when `max_ngram < 2`.
    pub fn new(max_ngram: usize) -> PolicyResult<Self> {
        if max_ngram < 2 {
            return Err(PolicyError::invalid(format!(
                "max_ngram must be >= 2, got {max_ngram}"
            )));
        }
        Ok(Self {
            max_ngram,
            patterns: RwLock::new(HashMap::new()),
        })
    }

    /// Longest mined run length.
    #[must_use]
    pub fn max_ngram(&self) -> usize {
        self.max_ngram
    }

    /// Fold one episode into the index. Non-successful episodes are ignored.
    pub fn observe(&self, episode: &Episode) {
        if !episode.is_success() || episode.len() < 2 {
            return;
        }
        let mut patterns = self
            .patterns
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for len in 2..=self.max_ngram.min(episode.len()) {
            for window in episode.action_sequence.windows(len) {
                let totals = patterns.entry(window.to_vec()).or_default();
                totals.occurrences += 1;
                totals.reward_sum += episode.episode_reward;
            }
        }
    }

    /// Rebuild the index from a full episode log.
    pub fn rebuild<'a>(&self, episodes: impl IntoIterator<Item = &'a Episode>) {
        self.patterns
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        for episode in episodes {
            self.observe(episode);
        }
    }

    /// Rank `candidates` as continuations of `recent`.
    ///
    /// Candidates never seen after any suffix of `recent` are omitted; an
    /// empty `recent` yields no suggestions.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn recommend(
        &self,
        recent: &[String],
        candidates: &[String],
        top_k: usize,
    ) -> Vec<SequenceRecommendation> {
        if recent.is_empty() || top_k == 0 {
            return Vec::new();
        }
        let patterns = self
            .patterns
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let max_prefix = self.max_ngram - 1;
        let longest = recent.len().min(max_prefix);

        let mut seen = Vec::<&str>::new();
        let mut ranked = Vec::new();
        for candidate in candidates {
            if seen.contains(&candidate.as_str()) {
                continue;
            }
            seen.push(candidate);

            for prefix_len in (1..=longest).rev() {
                let prefix = &recent[recent.len() - prefix_len..];
                let mut key = prefix.to_vec();
                key.push(candidate.clone());
                let Some(totals) = patterns.get(&key).copied() else {
                    continue;
                };
                if totals.occurrences == 0 {
                    continue;
                }
                let avg_reward = totals.avg_reward();
                let score = (prefix_len as f64 / max_prefix as f64)
                    * totals.occurrences as f64
                    * avg_reward;
                ranked.push(SequenceRecommendation {
                    action_id: candidate.clone(),
                    score,
                    occurrences: totals.occurrences,
                    avg_reward,
                    matched_prefix: prefix.to_vec(),
                    rationale: format!(
                        "follows {} ({}x, avg reward {avg_reward:.2})",
                        prefix.join(" -> "),
                        totals.occurrences
                    ),
                });
                break;
            }
        }

        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranked.truncate(top_k);
        ranked
    }

    /// All mined patterns, most frequent first.
    #[must_use]
    pub fn patterns(&self) -> Vec<SequencePattern> {
        let mut patterns: Vec<SequencePattern> = self
            .patterns
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(actions, totals)| SequencePattern {
                actions: actions.clone(),
                occurrences: totals.occurrences,
                avg_reward: totals.avg_reward(),
            })
            .collect();
        patterns.sort_by(|a, b| {
            b.occurrences
                .cmp(&a.occurrences)
                .then_with(|| a.actions.cmp(&b.actions))
        });
        patterns
    }

    /// Number of distinct patterns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing was mined yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
