//! Episode records: one finished session's action sequence and result.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{PolicyError, PolicyResult};

/// Aggregate result of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeOutcome {
    /// The session reached its goal.
    Success,
    /// Some but not all of the goal was met.
    Partial,
    /// The session failed.
    Failure,
}

impl EpisodeOutcome {
    /// String form used in payloads and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failure => "failure",
        }
    }
}

impl fmt::Display for EpisodeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EpisodeOutcome {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "success" => Ok(Self::Success),
            "partial" => Ok(Self::Partial),
            "failure" => Ok(Self::Failure),
            other => Err(PolicyError::invalid(format!(
                "unknown episode outcome `{other}` (expected success, partial or failure)"
            ))),
        }
    }
}

/// A completed session. Append-only once logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Episode {
    /// Session the episode belongs to.
    pub session_id: String,
    /// Actions in execution order.
    pub action_sequence: Vec<String>,
    /// Total reward collected in the session.
    pub episode_reward: f64,
    /// Aggregate outcome.
    pub outcome: EpisodeOutcome,
    /// When the episode was logged.
    pub created_at: DateTime<Utc>,
}

impl Episode {
    /// Validate and build an episode stamped now.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidInput`] for an empty session id, blank
    /// action ids or a non-finite reward.
    pub fn new(
        session_id: impl Into<String>,
        action_sequence: Vec<String>,
        episode_reward: f64,
        outcome: EpisodeOutcome,
    ) -> PolicyResult<Self> {
        let session_id = session_id.into();
        if session_id.trim().is_empty() {
            return Err(PolicyError::invalid("session_id must not be empty"));
        }
        if action_sequence.iter().any(|action| action.trim().is_empty()) {
            return Err(PolicyError::invalid(
                "action_sequence must not contain blank action ids",
            ));
        }
        if !episode_reward.is_finite() {
            return Err(PolicyError::invalid(format!(
                "episode_reward must be finite, got {episode_reward}"
            )));
        }
        Ok(Self {
            session_id,
            action_sequence,
            episode_reward,
            outcome,
            created_at: Utc::now(),
        })
    }

    /// Whether the episode counts as successful.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome == EpisodeOutcome::Success
    }

    /// Whether `action_id` appears anywhere in the sequence.
    #[must_use]
    pub fn contains_action(&self, action_id: &str) -> bool {
        self.action_sequence.iter().any(|action| action == action_id)
    }

    /// Number of actions taken.
    #[must_use]
    pub fn len(&self) -> usize {
        self.action_sequence.len()
    }

    /// Whether no action was taken.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.action_sequence.is_empty()
    }
}
