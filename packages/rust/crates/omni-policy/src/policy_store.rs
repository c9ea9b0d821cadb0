//! Durable policy table with an in-process read cache.
//!
//! Writes go to the backend first (bounded retries, per-attempt timeout);
//! the cache is only touched after the backend confirmed the update. Reads
//! on the selection path never leave the process; [`PolicyStore::spawn_refresh`]
//! pulls other writers' rows in at least once per cache TTL.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::backend::PolicyBackend;
use crate::config::RetryConfig;
use crate::error::{PolicyError, PolicyResult};
use crate::fingerprint::ContextFingerprint;
use crate::observability::PolicyEvent;
use crate::q_table::{PolicyEntry, PolicyKey, PolicyUpdate, QTable};
use crate::retry::with_retry;

/// Persisted action-value table.
pub struct PolicyStore {
    backend: Arc<dyn PolicyBackend>,
    cache: QTable,
    cached_at: DashMap<PolicyKey, Instant>,
    key_locks: DashMap<PolicyKey, Arc<tokio::sync::Mutex<()>>>,
    cache_ttl: Duration,
    retry: RetryConfig,
}

impl PolicyStore {
    /// Wrap `backend`; the cache starts empty until [`Self::refresh`].
    #[must_use]
    pub fn new(
        backend: Arc<dyn PolicyBackend>,
        learning_rate: f64,
        cache_ttl: Duration,
        retry: RetryConfig,
    ) -> Self {
        Self {
            backend,
            cache: QTable::new(learning_rate),
            cached_at: DashMap::new(),
            key_locks: DashMap::new(),
            cache_ttl,
            retry,
        }
    }

    /// Name of the durable backend.
    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    /// Learning rate (α) applied by [`Self::upsert`].
    #[must_use]
    pub fn learning_rate(&self) -> f64 {
        self.cache.learning_rate()
    }

    fn key_lock(&self, key: &PolicyKey) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.key_locks.entry(key.clone()).or_default().value())
    }

    fn cache_row(&self, entry: PolicyEntry) {
        self.cached_at.insert(entry.key(), Instant::now());
        self.cache.put(entry);
    }

    /// Apply `reward` to `(action_id, context)`.
    ///
    /// Upserts for one key are serialized; other keys proceed in parallel.
    /// Every retry of one call reuses the same write id, so the backend
    /// applies the reward at most once.
    ///
    /// # Errors
    ///
    /// [`PolicyError::InvalidInput`] for a blank action or non-finite reward;
    /// [`PolicyError::PersistenceUnavailable`] when the backend cannot be
    /// reached within the retry budget. The cache is unchanged on error.
    pub async fn upsert(
        &self,
        action_id: &str,
        context: &ContextFingerprint,
        reward: f64,
    ) -> PolicyResult<PolicyUpdate> {
        if action_id.trim().is_empty() {
            return Err(PolicyError::invalid("action_id must not be empty"));
        }
        if !reward.is_finite() {
            return Err(PolicyError::invalid(format!(
                "reward must be finite, got {reward}"
            )));
        }

        let key = PolicyKey::new(action_id, context.clone());
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        let learning_rate = self.learning_rate();
        let write_id = Uuid::new_v4();
        let update = with_retry("policy.upsert", &self.retry, || {
            self.backend.upsert(write_id, &key, reward, learning_rate)
        })
        .await?;

        self.cache_row(update.entry.clone());
        tracing::debug!(
            event = PolicyEvent::PolicyUpserted.as_str(),
            action_id,
            context = %context,
            reward,
            previous_value = update.previous_value,
            new_value = update.new_value,
            visit_count = update.entry.visit_count,
            "policy value updated"
        );
        Ok(update)
    }

    /// Cached value, 0 when the pair has never been updated.
    #[must_use]
    pub fn read(&self, action_id: &str, context: &ContextFingerprint) -> f64 {
        self.cache
            .value(&PolicyKey::new(action_id, context.clone()))
    }

    /// Cached row, if any.
    #[must_use]
    pub fn entry(&self, action_id: &str, context: &ContextFingerprint) -> Option<PolicyEntry> {
        self.cache.get(&PolicyKey::new(action_id, context.clone()))
    }

    /// Cached row that must exist.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::NotFound`] when the pair has no row.
    pub fn entry_required(
        &self,
        action_id: &str,
        context: &ContextFingerprint,
    ) -> PolicyResult<PolicyEntry> {
        self.entry(action_id, context).ok_or_else(|| {
            PolicyError::NotFound(format!("policy entry for `{action_id}` in context {context}"))
        })
    }

    /// Row for the pair, re-read from the backend once the cached copy is
    /// older than the cache TTL. Backend failure falls back to the cache.
    pub async fn get(&self, action_id: &str, context: &ContextFingerprint) -> Option<PolicyEntry> {
        let key = PolicyKey::new(action_id, context.clone());
        let fresh = self
            .cached_at
            .get(&key)
            .is_some_and(|at| at.elapsed() < self.cache_ttl);
        if fresh {
            return self.cache.get(&key);
        }

        match tokio::time::timeout(self.retry.attempt_timeout, self.backend.fetch(&key)).await {
            Ok(Ok(Some(entry))) => {
                self.cache_row(entry.clone());
                Some(entry)
            }
            Ok(Ok(None)) => self.cache.get(&key),
            Ok(Err(error)) => {
                tracing::warn!(
                    event = PolicyEvent::PolicyReadThroughFailed.as_str(),
                    action_id,
                    context = %context,
                    error = %format!("{error:#}"),
                    "policy read-through failed; serving cached value"
                );
                self.cache.get(&key)
            }
            Err(_) => {
                tracing::warn!(
                    event = PolicyEvent::PolicyReadThroughFailed.as_str(),
                    action_id,
                    context = %context,
                    error = "timeout",
                    "policy read-through timed out; serving cached value"
                );
                self.cache.get(&key)
            }
        }
    }

    /// Merge the backend's table into the cache and return the row count.
    ///
    /// A cached row is only replaced by a backend row with at least as many
    /// visits. Keys with an upsert in flight are skipped; that upsert
    /// refreshes them itself.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::PersistenceUnavailable`] when the table cannot
    /// be loaded; the previous cache is kept in that case.
    pub async fn refresh(&self) -> PolicyResult<usize> {
        let rows = match with_retry("policy.load", &self.retry, || self.backend.load_policy()).await
        {
            Ok(rows) => rows,
            Err(error) => {
                tracing::warn!(
                    event = PolicyEvent::PolicyCacheRefreshFailed.as_str(),
                    backend = self.backend_name(),
                    error = %error,
                    "policy cache refresh failed; keeping cached rows"
                );
                return Err(error);
            }
        };

        let count = rows.len();
        let mut merged = 0_usize;
        for row in rows {
            let key = row.key();
            let lock = self.key_lock(&key);
            let Ok(_guard) = lock.try_lock() else {
                continue;
            };
            let newer = self
                .cache
                .get(&key)
                .is_none_or(|cached| cached.visit_count <= row.visit_count);
            if newer {
                self.cache_row(row);
                merged += 1;
            }
        }
        tracing::debug!(
            event = PolicyEvent::PolicyCacheRefreshed.as_str(),
            backend = self.backend_name(),
            rows = count,
            merged,
            "policy cache refreshed"
        );
        Ok(count)
    }

    /// Refresh the cache every `period` on a background task.
    ///
    /// The task holds only a weak reference and ends once the store is
    /// dropped; abort the handle to stop it earlier.
    #[must_use]
    pub fn spawn_refresh(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                // Failures are logged by refresh itself.
                let _ = store.refresh().await;
            }
        })
    }

    /// Flush the backend.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::PersistenceUnavailable`] when the flush fails.
    pub async fn flush(&self) -> PolicyResult<()> {
        with_retry("policy.flush", &self.retry, || self.backend.flush()).await
    }

    /// Every cached row, ordered by key.
    #[must_use]
    pub fn entries(&self) -> Vec<PolicyEntry> {
        self.cache.snapshot()
    }

    /// Highest-valued rows first; ties keep key order.
    #[must_use]
    pub fn top_entries(&self, limit: usize) -> Vec<PolicyEntry> {
        let mut rows = self.entries();
        rows.sort_by(|a, b| b.action_value.total_cmp(&a.action_value));
        rows.truncate(limit);
        rows
    }

    /// Number of cached rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether the cache holds no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
