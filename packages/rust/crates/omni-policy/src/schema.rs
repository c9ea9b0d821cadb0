//! JSON Schemas for the payloads the engine accepts and returns.
//!
//! Rust types are the source of truth; schemas are generated with
//! `schemars` so external callers can validate before sending.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::engine::LearningStats;
use crate::episode::Episode;
use crate::error::{PolicyError, PolicyResult};
use crate::metrics::MetricPoint;
use crate::outcome::ExecutionOutcome;
use crate::q_table::PolicyEntry;
use crate::ranker::Recommendation;
use crate::selector::Selection;
use crate::sequence::SequenceRecommendation;

/// Payload types with a published schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// [`ExecutionOutcome`].
    ExecutionOutcome,
    /// [`Episode`].
    Episode,
    /// [`PolicyEntry`].
    PolicyEntry,
    /// [`Selection`].
    Selection,
    /// [`Recommendation`].
    Recommendation,
    /// [`SequenceRecommendation`].
    SequenceRecommendation,
    /// [`LearningStats`].
    LearningStats,
    /// [`MetricPoint`].
    MetricPoint,
}

impl PayloadKind {
    /// Every kind, in a stable order.
    pub const ALL: [Self; 8] = [
        Self::ExecutionOutcome,
        Self::Episode,
        Self::PolicyEntry,
        Self::Selection,
        Self::Recommendation,
        Self::SequenceRecommendation,
        Self::LearningStats,
        Self::MetricPoint,
    ];

    /// Snake-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ExecutionOutcome => "execution_outcome",
            Self::Episode => "episode",
            Self::PolicyEntry => "policy_entry",
            Self::Selection => "selection",
            Self::Recommendation => "recommendation",
            Self::SequenceRecommendation => "sequence_recommendation",
            Self::LearningStats => "learning_stats",
            Self::MetricPoint => "metric_point",
        }
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayloadKind {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| PolicyError::invalid(format!("unknown payload kind `{s}`")))
    }
}

/// JSON Schema for `kind`.
///
/// # Errors
///
/// Returns [`PolicyError::InvalidInput`] if the schema cannot be rendered
/// as JSON.
pub fn payload_schema(kind: PayloadKind) -> PolicyResult<Value> {
    let schema = match kind {
        PayloadKind::ExecutionOutcome => schemars::schema_for!(ExecutionOutcome),
        PayloadKind::Episode => schemars::schema_for!(Episode),
        PayloadKind::PolicyEntry => schemars::schema_for!(PolicyEntry),
        PayloadKind::Selection => schemars::schema_for!(Selection),
        PayloadKind::Recommendation => schemars::schema_for!(Recommendation),
        PayloadKind::SequenceRecommendation => schemars::schema_for!(SequenceRecommendation),
        PayloadKind::LearningStats => schemars::schema_for!(LearningStats),
        PayloadKind::MetricPoint => schemars::schema_for!(MetricPoint),
    };
    serde_json::to_value(schema)
        .map_err(|error| PolicyError::invalid(format!("failed to render {kind} schema: {error}")))
}
