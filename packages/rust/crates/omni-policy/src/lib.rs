//! omni-policy - Online decision engine for adaptive action selection.
//!
//! Learns, from observed execution outcomes, which action works best in a
//! given situation:
//! - Context fingerprints (SHA-256 over keywords + session position)
//! - Reward shaping from success, rating and latency
//! - Persisted action values with per-key atomic updates
//! - Epsilon-greedy and UCB selection with decaying exploration
//! - Prioritized experience replay
//! - Episode log with n-gram sequence suggestions
//! - Rolling learning metrics, persisted with metadata
//!
//! # Architecture
//!
//! ```text
//! intent ──► ContextFingerprinter ──► ContextFingerprint
//!                                         │
//!            ┌──────────── select / recommend (cache reads only)
//!            ▼
//!   ActionSelector ──► RecommendationRanker ──► PolicyStore (cache)
//!                                                   │
//! outcome ──► reward ──► PolicyStore::upsert ──► PolicyBackend (local | valkey)
//!                    └─► ReplayBuffer, LearningMetrics
//!
//! episode ──► EpisodeLog ──► PolicyBackend
//!                        └─► SequenceLearner
//! ```
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use omni_policy::{
//!     EngineConfig, ExecutionOutcome, InMemoryOutcomeLog, LocalPolicyBackend, PolicyEngine,
//! };
//!
//! # async fn demo() -> omni_policy::PolicyResult<()> {
//! let engine = PolicyEngine::open(
//!     EngineConfig::default(),
//!     Arc::new(LocalPolicyBackend::in_memory()),
//!     Arc::new(InMemoryOutcomeLog::new()),
//! )
//! .await?;
//! let context = engine.fingerprint("export journal report", None, 0);
//! let candidates = vec!["export_report".to_string(), "run_job".to_string()];
//! let choice = engine.select(&context, &candidates, None)?;
//! let outcome = ExecutionOutcome::new(&choice.action_id, true, 420.0, Some(5))?;
//! engine.record_outcome(&context, &outcome, None).await?;
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Core modules
// ============================================================================

mod backend;
mod config;
mod engine;
mod episode;
mod episode_log;
mod error;
mod fingerprint;
mod metrics;
mod observability;
mod outcome;
mod persistence;
mod policy_store;
mod q_table;
mod ranker;
mod replay;
mod retry;
mod reward;
mod schema;
mod selector;
mod sequence;

// ============================================================================
// Public exports
// ============================================================================

#[cfg(feature = "valkey")]
pub use backend::ValkeyPolicyBackend;
pub use backend::{LocalPolicyBackend, PolicyBackend, default_valkey_key_prefix};
pub use config::{
    EngineConfig, LearningSettings, PersistenceSettings, PolicySettings, RetryConfig,
    default_policy_store_path, load_policy_settings, load_policy_settings_from_paths,
    policy_settings_paths,
};
pub use engine::{LearningStats, PolicyEngine, RecordedOutcome, ReplayReport};
pub use episode::{Episode, EpisodeOutcome};
pub use episode_log::EpisodeLog;
pub use error::{PolicyError, PolicyResult};
pub use fingerprint::{
    ContextFingerprint, ContextFingerprinter, DEFAULT_DOMAIN_VOCABULARY, FINGERPRINT_LEN,
};
pub use metrics::{LearningMetrics, MetricPoint, MetricSummary, names as metric_names};
pub use outcome::{
    ActionCatalog, ActionMetrics, ExecutionOutcome, InMemoryOutcomeLog, NoOutcomeMetrics,
    OutcomeMetrics, StaticActionCatalog,
};
pub use policy_store::PolicyStore;
pub use q_table::{PolicyEntry, PolicyKey, PolicyUpdate, QTable};
pub use ranker::{MetricsSnapshot, Recommendation, RecommendationRanker};
pub use replay::{Experience, ReplayBuffer, SampledExperience};
pub use reward::{RewardBreakdown, calculate_reward, reward_breakdown};
pub use schema::{PayloadKind, payload_schema};
pub use selector::{ActionSelector, ExplorationState, ExplorationStats, Selection, SelectionStrategy};
pub use sequence::{SequenceLearner, SequencePattern, SequenceRecommendation};
