//! Append-only episode log mirrored in memory.

use std::sync::{Arc, PoisonError, RwLock};

use uuid::Uuid;

use crate::backend::PolicyBackend;
use crate::config::RetryConfig;
use crate::episode::Episode;
use crate::error::PolicyResult;
use crate::observability::PolicyEvent;
use crate::retry::with_retry;

/// Durable episode history.
pub struct EpisodeLog {
    backend: Arc<dyn PolicyBackend>,
    episodes: RwLock<Vec<Episode>>,
    retry: RetryConfig,
}

impl EpisodeLog {
    /// Create a log over `backend`; call [`Self::load`] to pull history.
    #[must_use]
    pub fn new(backend: Arc<dyn PolicyBackend>, retry: RetryConfig) -> Self {
        Self {
            backend,
            episodes: RwLock::new(Vec::new()),
            retry,
        }
    }

    /// Replace the in-memory copy with the backend's history.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PolicyError::PersistenceUnavailable`] when the
    /// backend cannot be read.
    pub async fn load(&self) -> PolicyResult<Vec<Episode>> {
        let episodes =
            with_retry("episode.load", &self.retry, || self.backend.load_episodes()).await?;
        *self
            .episodes
            .write()
            .unwrap_or_else(PoisonError::into_inner) = episodes.clone();
        tracing::info!(
            event = PolicyEvent::EpisodeLogLoaded.as_str(),
            backend = self.backend.backend_name(),
            episodes = episodes.len(),
            "episode log loaded"
        );
        Ok(episodes)
    }

    /// Persist `episode`, then expose it to readers. Retries reuse one
    /// write id, so the backend stores the episode at most once.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PolicyError::PersistenceUnavailable`] when the
    /// append fails; the in-memory copy is unchanged in that case.
    pub async fn append(&self, episode: Episode) -> PolicyResult<()> {
        let write_id = Uuid::new_v4();
        with_retry("episode.append", &self.retry, || {
            self.backend.append_episode(write_id, &episode)
        })
        .await?;
        tracing::info!(
            event = PolicyEvent::EpisodeLogged.as_str(),
            session_id = %episode.session_id,
            actions = episode.len(),
            episode_reward = episode.episode_reward,
            outcome = episode.outcome.as_str(),
            "episode logged"
        );
        self.episodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(episode);
        Ok(())
    }

    /// Successful episodes, best reward first, optionally only those that
    /// contain `filter_action`.
    #[must_use]
    pub fn successful_sequences(&self, filter_action: Option<&str>, limit: usize) -> Vec<Episode> {
        let mut matches: Vec<Episode> = self
            .episodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|episode| episode.is_success())
            .filter(|episode| filter_action.is_none_or(|action| episode.contains_action(action)))
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.episode_reward.total_cmp(&a.episode_reward));
        matches.truncate(limit);
        matches
    }

    /// Every logged episode in append order.
    #[must_use]
    pub fn episodes(&self) -> Vec<Episode> {
        self.episodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of logged episodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.episodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing was logged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
