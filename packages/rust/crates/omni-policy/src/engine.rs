//! Engine facade wiring every component behind one handle.
//!
//! Construction is explicit ([`PolicyEngine::open`]) and so is teardown
//! ([`PolicyEngine::shutdown`]); engines share nothing, so several can live
//! in one process.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::backend::PolicyBackend;
use crate::config::EngineConfig;
use crate::episode::{Episode, EpisodeOutcome};
use crate::episode_log::EpisodeLog;
use crate::error::{PolicyError, PolicyResult};
use crate::fingerprint::{ContextFingerprint, ContextFingerprinter};
use crate::metrics::{LearningMetrics, MetricPoint, MetricSummary, names};
use crate::observability::PolicyEvent;
use crate::outcome::{ActionCatalog, ExecutionOutcome, OutcomeMetrics};
use crate::policy_store::PolicyStore;
use crate::q_table::{PolicyEntry, PolicyUpdate};
use crate::ranker::{Recommendation, RecommendationRanker};
use crate::replay::{Experience, ReplayBuffer};
use crate::retry::with_retry;
use crate::reward::{RewardBreakdown, reward_breakdown};
use crate::selector::{ActionSelector, ExplorationStats, Selection, SelectionStrategy};
use crate::sequence::{SequenceLearner, SequencePattern, SequenceRecommendation};

const TOP_ENTRIES_IN_STATS: usize = 10;

/// Result of [`PolicyEngine::record_outcome`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RecordedOutcome {
    /// Scalar reward applied.
    pub reward: f64,
    /// Reward terms.
    pub breakdown: RewardBreakdown,
    /// Policy row update.
    pub update: PolicyUpdate,
}

/// Result of [`PolicyEngine::replay`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ReplayReport {
    /// Experiences drawn.
    pub sampled: usize,
    /// Experiences re-applied to the policy.
    pub applied: usize,
    /// Mean absolute TD error over applied experiences.
    pub mean_abs_td_error: f64,
}

/// Engine-wide snapshot for dashboards and the CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LearningStats {
    /// Durable backend name.
    pub backend: String,
    /// Cached policy rows.
    pub policy_entries: usize,
    /// Logged episodes.
    pub episodes: usize,
    /// Logged successful episodes.
    pub successful_episodes: usize,
    /// Distinct mined n-grams.
    pub sequence_patterns: usize,
    /// Experiences held for replay.
    pub replay_size: usize,
    /// Replay capacity.
    pub replay_capacity: usize,
    /// Learning rate (α).
    pub learning_rate: f64,
    /// Configured discount factor (reported only).
    pub discount_factor: f64,
    /// Exploration bookkeeping.
    pub exploration: ExplorationStats,
    /// Rolling metric summaries by name.
    pub metrics: BTreeMap<String, MetricSummary>,
    /// Highest-valued policy rows.
    pub top_entries: Vec<PolicyEntry>,
}

/// Online decision engine.
pub struct PolicyEngine {
    config: EngineConfig,
    fingerprinter: ContextFingerprinter,
    backend: Arc<dyn PolicyBackend>,
    store: Arc<PolicyStore>,
    refresher: Option<JoinHandle<()>>,
    ranker: RecommendationRanker,
    selector: ActionSelector,
    replay: ReplayBuffer,
    episodes: EpisodeLog,
    sequences: SequenceLearner,
    metrics: LearningMetrics,
    outcomes: Arc<dyn OutcomeMetrics>,
    catalog: Option<Arc<dyn ActionCatalog>>,
    updates_since_replay: AtomicUsize,
}

impl PolicyEngine {
    /// Validate `config`, build every component and warm the caches.
    ///
    /// An unreachable backend does not fail the open: the engine starts
    /// with empty caches and later writes surface the outage.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PolicyError::InvalidInput`] for an invalid config.
    pub async fn open(
        config: EngineConfig,
        backend: Arc<dyn PolicyBackend>,
        outcomes: Arc<dyn OutcomeMetrics>,
    ) -> PolicyResult<Self> {
        config.validate()?;

        let store = Arc::new(PolicyStore::new(
            Arc::clone(&backend),
            config.learning_rate,
            config.cache_ttl,
            config.retry.clone(),
        ));
        let refresher = (!config.cache_ttl.is_zero())
            .then(|| store.spawn_refresh(config.cache_ttl));
        let engine = Self {
            fingerprinter: ContextFingerprinter::new(
                config.vocabulary.clone(),
                config.leading_tokens,
            ),
            ranker: RecommendationRanker::new(
                Arc::clone(&store),
                Arc::clone(&outcomes),
                config.min_samples,
            ),
            selector: ActionSelector::new(
                config.exploration_rate,
                config.exploration_decay,
                config.min_exploration_rate,
                config.ucb_c,
                config.seed,
            ),
            replay: ReplayBuffer::new(config.replay_capacity, config.replay_alpha, config.seed)?,
            episodes: EpisodeLog::new(Arc::clone(&backend), config.retry.clone()),
            sequences: SequenceLearner::new(config.max_ngram)?,
            metrics: LearningMetrics::new(config.metrics_window),
            backend: Arc::clone(&backend),
            store,
            refresher,
            outcomes,
            catalog: None,
            updates_since_replay: AtomicUsize::new(0),
            config,
        };

        // Failures are logged by the store and the log themselves.
        let _ = engine.store.refresh().await;
        if let Ok(history) = engine.episodes.load().await {
            engine.sequences.rebuild(&history);
        }

        tracing::info!(
            event = PolicyEvent::EngineOpened.as_str(),
            backend = backend.backend_name(),
            policy_entries = engine.store.len(),
            episodes = engine.episodes.len(),
            sequence_patterns = engine.sequences.len(),
            strategy = engine.config.default_strategy.as_str(),
            "policy engine opened"
        );
        Ok(engine)
    }

    /// Attach the catalog used by [`Self::candidates_for`].
    #[must_use]
    pub fn with_catalog(mut self, catalog: Arc<dyn ActionCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Persist pending metrics, flush the backend and drop the engine.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PolicyError::PersistenceUnavailable`] when the
    /// final flush fails.
    pub async fn shutdown(mut self) -> PolicyResult<()> {
        if let Some(refresher) = self.refresher.take() {
            refresher.abort();
        }
        // Failures are logged by flush_metrics itself.
        let _ = self.flush_metrics().await;
        let flushed = self.store.flush().await;
        tracing::info!(
            event = PolicyEvent::EngineShutdown.as_str(),
            backend = self.store.backend_name(),
            flushed = flushed.is_ok(),
            "policy engine shut down"
        );
        flushed
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Underlying policy store.
    #[must_use]
    pub fn store(&self) -> &PolicyStore {
        &self.store
    }

    /// Context key for a situation.
    #[must_use]
    pub fn fingerprint(
        &self,
        intent: &str,
        previous_action: Option<&str>,
        session_length: u64,
    ) -> ContextFingerprint {
        self.fingerprinter
            .fingerprint(intent, previous_action, session_length)
    }

    /// Actions the catalog offers at `call_site`; empty without a catalog.
    #[must_use]
    pub fn candidates_for(&self, call_site: &str) -> Vec<String> {
        self.catalog
            .as_ref()
            .map(|catalog| catalog.available_actions(call_site))
            .unwrap_or_default()
    }

    /// Choose an action. `None` uses the configured default strategy.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PolicyError::InvalidInput`] for empty candidates.
    pub fn select(
        &self,
        context: &ContextFingerprint,
        candidates: &[String],
        strategy: Option<SelectionStrategy>,
    ) -> PolicyResult<Selection> {
        let strategy = strategy.unwrap_or(self.config.default_strategy);
        let selection = self
            .selector
            .select(context, candidates, strategy, &self.ranker)?;
        self.metrics
            .record(names::EXPLORATION_RATE, self.selector.exploration_rate());
        Ok(selection)
    }

    /// Rank candidates by confidence.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PolicyError::InvalidInput`] for empty candidates.
    pub fn recommend(
        &self,
        context: &ContextFingerprint,
        candidates: &[String],
    ) -> PolicyResult<Vec<Recommendation>> {
        self.ranker.recommend(context, candidates)
    }

    /// Logistic confidence of the learned value.
    #[must_use]
    pub fn confidence(&self, action_id: &str, context: &ContextFingerprint) -> f64 {
        self.ranker.confidence(action_id, context)
    }

    /// Apply a reward directly to the policy.
    ///
    /// # Errors
    ///
    /// [`crate::PolicyError::InvalidInput`] for bad input,
    /// [`crate::PolicyError::PersistenceUnavailable`] when the write fails.
    pub async fn upsert_policy(
        &self,
        action_id: &str,
        context: &ContextFingerprint,
        reward: f64,
    ) -> PolicyResult<PolicyUpdate> {
        let update = self.store.upsert(action_id, context, reward).await?;
        self.metrics.record_with_metadata(
            names::TD_ERROR,
            update.td_error,
            action_metadata(action_id, context),
        );
        self.maybe_replay().await;
        self.maybe_flush_metrics().await;
        Ok(update)
    }

    async fn maybe_flush_metrics(&self) {
        let threshold = self.config.metrics_flush_threshold;
        if threshold > 0 && self.metrics.pending_len() >= threshold {
            // Failures are logged and the points are kept for the next flush.
            let _ = self.flush_metrics().await;
        }
    }

    /// Persist every pending metric point and return how many were written.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PolicyError::PersistenceUnavailable`] when the
    /// backend rejects the batch; the points stay pending.
    pub async fn flush_metrics(&self) -> PolicyResult<usize> {
        let points = self.metrics.take_pending();
        if points.is_empty() {
            return Ok(0);
        }
        let write_id = Uuid::new_v4();
        let written = with_retry("metrics.append", &self.config.retry, || {
            self.backend.append_metrics(write_id, &points)
        })
        .await;
        match written {
            Ok(()) => {
                tracing::debug!(
                    event = PolicyEvent::MetricsFlushed.as_str(),
                    backend = self.backend.backend_name(),
                    points = points.len(),
                    "metric points persisted"
                );
                Ok(points.len())
            }
            Err(error) => {
                tracing::warn!(
                    event = PolicyEvent::MetricsFlushFailed.as_str(),
                    backend = self.backend.backend_name(),
                    points = points.len(),
                    error = %error,
                    "metric flush failed; keeping points pending"
                );
                self.metrics.restore_pending(points);
                Err(error)
            }
        }
    }

    /// Metric points recorded within `window`, newest first.
    ///
    /// Merges persisted points with those not yet flushed. `name` narrows the
    /// result to one metric.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PolicyError::PersistenceUnavailable`] when the
    /// persisted points cannot be loaded.
    pub async fn recent_metrics(
        &self,
        name: Option<&str>,
        window: Duration,
        limit: usize,
    ) -> PolicyResult<Vec<MetricPoint>> {
        let window = chrono::Duration::from_std(window)
            .map_err(|_| PolicyError::invalid("metrics window is too large"))?;
        let since = Utc::now().checked_sub_signed(window);

        let mut points = with_retry("metrics.load", &self.config.retry, || {
            self.backend.load_metrics()
        })
        .await?;
        points.extend(self.metrics.pending());
        points.retain(|point| {
            name.is_none_or(|name| point.name == name)
                && since.is_none_or(|since| point.recorded_at >= since)
        });
        points.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        points.truncate(limit);
        Ok(points)
    }

    async fn maybe_replay(&self) {
        let every = self.config.replay_every;
        if every == 0 {
            return;
        }
        let updates = self.updates_since_replay.fetch_add(1, Ordering::Relaxed) + 1;
        if updates % every != 0 {
            return;
        }
        if let Err(error) = self.replay(self.config.batch_size).await {
            tracing::warn!(
                event = PolicyEvent::ReplayApplied.as_str(),
                error = %error,
                "scheduled replay pass failed"
            );
        }
    }

    /// Turn an outcome into a reward and learn from it.
    ///
    /// # Errors
    ///
    /// [`crate::PolicyError::InvalidInput`] for an invalid outcome,
    /// [`crate::PolicyError::PersistenceUnavailable`] when the write fails.
    /// Nothing is pushed to replay or metrics on error.
    pub async fn record_outcome(
        &self,
        context: &ContextFingerprint,
        outcome: &ExecutionOutcome,
        next_context: Option<ContextFingerprint>,
    ) -> PolicyResult<RecordedOutcome> {
        outcome.validate()?;
        let avg_latency_ms = self.outcomes.avg_latency_ms(&outcome.action_id);
        let breakdown = reward_breakdown(outcome, avg_latency_ms);
        let reward = breakdown.total();

        let update = self
            .upsert_policy(&outcome.action_id, context, reward)
            .await?;
        let experience = Experience {
            context: context.clone(),
            action_id: outcome.action_id.clone(),
            reward,
            terminal: next_context.is_none(),
            next_context,
        };
        self.replay
            .add(experience, Some(update.td_error.abs() + 1.0))?;
        let mut metadata = action_metadata(&outcome.action_id, context);
        metadata.insert("success".to_string(), Value::Bool(outcome.success));
        self.metrics
            .record_with_metadata(names::REWARD, reward, metadata);

        Ok(RecordedOutcome {
            reward,
            breakdown,
            update,
        })
    }

    /// Re-apply a prioritized sample of past experiences.
    ///
    /// # Errors
    ///
    /// [`crate::PolicyError::EmptyReplayBuffer`] when nothing is stored,
    /// [`crate::PolicyError::PersistenceUnavailable`] when a write fails.
    pub async fn replay(&self, batch_size: usize) -> PolicyResult<ReplayReport> {
        let batch = self.replay.sample(batch_size)?;
        let sampled = batch.len();
        let mut applied = 0_usize;
        let mut abs_td_sum = 0.0;
        for item in batch {
            let update = self
                .store
                .upsert(
                    &item.experience.action_id,
                    &item.experience.context,
                    item.experience.reward,
                )
                .await?;
            applied += 1;
            abs_td_sum += update.td_error.abs();
            self.metrics.record_with_metadata(
                names::REPLAY_TD_ERROR,
                update.td_error,
                action_metadata(&item.experience.action_id, &item.experience.context),
            );
            // The experience may have been evicted since sampling.
            let _ = self
                .replay
                .update_priority(item.sequence, update.td_error.abs() + 1.0);
        }

        #[allow(clippy::cast_precision_loss)]
        let mean_abs_td_error = if applied == 0 {
            0.0
        } else {
            abs_td_sum / applied as f64
        };
        tracing::debug!(
            event = PolicyEvent::ReplayApplied.as_str(),
            sampled,
            applied,
            mean_abs_td_error,
            "replay pass applied"
        );
        Ok(ReplayReport {
            sampled,
            applied,
            mean_abs_td_error,
        })
    }

    /// Persist a finished session and learn its sequences.
    ///
    /// # Errors
    ///
    /// [`crate::PolicyError::InvalidInput`] for an invalid episode,
    /// [`crate::PolicyError::PersistenceUnavailable`] when the append fails.
    pub async fn log_episode(
        &self,
        session_id: &str,
        action_sequence: Vec<String>,
        episode_reward: f64,
        outcome: EpisodeOutcome,
    ) -> PolicyResult<Episode> {
        let episode = Episode::new(session_id, action_sequence, episode_reward, outcome)?;
        self.episodes.append(episode.clone()).await?;
        self.sequences.observe(&episode);
        let metadata = BTreeMap::from([
            ("session_id".to_string(), Value::from(session_id)),
            ("outcome".to_string(), Value::from(outcome.as_str())),
        ]);
        self.metrics
            .record_with_metadata(names::EPISODE_REWARD, episode_reward, metadata.clone());
        #[allow(clippy::cast_precision_loss)]
        let length = episode.len() as f64;
        self.metrics
            .record_with_metadata(names::EPISODE_LENGTH, length, metadata);
        self.maybe_flush_metrics().await;
        Ok(episode)
    }

    /// Successful episodes, best first.
    #[must_use]
    pub fn get_successful_sequences(&self, filter_action: Option<&str>, limit: usize) -> Vec<Episode> {
        self.episodes.successful_sequences(filter_action, limit)
    }

    /// Candidates ranked as continuations of `recent`.
    #[must_use]
    pub fn get_sequence_recommendations(
        &self,
        recent: &[String],
        candidates: &[String],
        top_k: usize,
    ) -> Vec<SequenceRecommendation> {
        self.sequences.recommend(recent, candidates, top_k)
    }

    /// Mined n-grams, most frequent first.
    #[must_use]
    pub fn sequence_patterns(&self) -> Vec<SequencePattern> {
        self.sequences.patterns()
    }

    /// Rolling summary of one metric.
    #[must_use]
    pub fn metrics_summary(&self, name: &str) -> MetricSummary {
        self.metrics.summary(name)
    }

    /// Restore the initial exploration rate and clear counters.
    pub fn reset_exploration(&self) {
        self.selector.reset_exploration();
    }

    /// Current exploration bookkeeping.
    #[must_use]
    pub fn exploration_stats(&self) -> ExplorationStats {
        self.selector.exploration_stats()
    }

    /// Engine-wide snapshot.
    #[must_use]
    pub fn learning_stats(&self) -> LearningStats {
        let episodes = self.episodes.episodes();
        LearningStats {
            backend: self.store.backend_name().to_string(),
            policy_entries: self.store.len(),
            successful_episodes: episodes.iter().filter(|e| e.is_success()).count(),
            episodes: episodes.len(),
            sequence_patterns: self.sequences.len(),
            replay_size: self.replay.len(),
            replay_capacity: self.replay.capacity(),
            learning_rate: self.store.learning_rate(),
            discount_factor: self.config.discount_factor,
            exploration: self.selector.exploration_stats(),
            metrics: self.metrics.summaries(),
            top_entries: self.store.top_entries(TOP_ENTRIES_IN_STATS),
        }
    }
}

impl Drop for PolicyEngine {
    fn drop(&mut self) {
        if let Some(refresher) = self.refresher.take() {
            refresher.abort();
        }
    }
}

fn action_metadata(action_id: &str, context: &ContextFingerprint) -> BTreeMap<String, Value> {
    BTreeMap::from([
        ("action_id".to_string(), Value::from(action_id)),
        ("context".to_string(), Value::from(context.to_string())),
    ])
}
