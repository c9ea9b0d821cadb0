//! Action-value table over (action, context) pairs.
//!
//! Implements the single-step rule `Q_new = Q_old + α * (r - Q_old)`
//! where `α` is the learning rate and `r` is the reward. There is no
//! discounted next-state term: the value is a running estimate of the
//! immediate reward for taking `action` in `context`.

use crate::fingerprint::ContextFingerprint;
use crate::persistence::{atomic_write_json, read_json_if_exists};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Unique key of a policy row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub struct PolicyKey {
    /// Action identifier.
    pub action_id: String,
    /// Situation the action was taken in.
    pub context: ContextFingerprint,
}

impl PolicyKey {
    /// Build a key.
    #[must_use]
    pub fn new(action_id: impl Into<String>, context: ContextFingerprint) -> Self {
        Self {
            action_id: action_id.into(),
            context,
        }
    }
}

/// One row of the policy table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PolicyEntry {
    /// Action identifier.
    pub action_id: String,
    /// Situation fingerprint.
    pub context: ContextFingerprint,
    /// Current value estimate (Q-value).
    pub action_value: f64,
    /// Number of updates applied.
    pub visit_count: u64,
    /// Time of the last update.
    pub last_updated: DateTime<Utc>,
}

impl PolicyEntry {
    /// Fresh row with value 0 and no visits.
    #[must_use]
    pub fn new(key: &PolicyKey) -> Self {
        Self {
            action_id: key.action_id.clone(),
            context: key.context.clone(),
            action_value: 0.0,
            visit_count: 0,
            last_updated: Utc::now(),
        }
    }

    /// Key of this row.
    #[must_use]
    pub fn key(&self) -> PolicyKey {
        PolicyKey::new(self.action_id.clone(), self.context.clone())
    }

    /// Apply one update in place and return the TD-error equivalent
    /// `reward - old_value`.
    pub fn apply_reward(&mut self, reward: f64, learning_rate: f64) -> f64 {
        let td_error = reward - self.action_value;
        self.action_value += learning_rate * td_error;
        self.visit_count = self.visit_count.saturating_add(1);
        self.last_updated = Utc::now();
        td_error
    }
}

/// Result of one value update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PolicyUpdate {
    /// Row after the update.
    pub entry: PolicyEntry,
    /// Value before the update.
    pub previous_value: f64,
    /// Value after the update.
    pub new_value: f64,
    /// `reward - previous_value`.
    pub td_error: f64,
}

/// Concurrent policy table.
///
/// Updates for one key run under that key's shard lock, so concurrent
/// updates never lose writes; unrelated keys mostly land on other shards.
pub struct QTable {
    table: RwLock<DashMap<PolicyKey, PolicyEntry>>,
    /// Learning rate (α).
    learning_rate: f64,
}

impl QTable {
    /// Create an empty table with the given learning rate.
    #[must_use]
    pub fn new(learning_rate: f64) -> Self {
        Self {
            table: RwLock::new(DashMap::new()),
            learning_rate,
        }
    }

    fn read_table(&self) -> RwLockReadGuard<'_, DashMap<PolicyKey, PolicyEntry>> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_table(&self) -> RwLockWriteGuard<'_, DashMap<PolicyKey, PolicyEntry>> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `reward` to `key` using the table's learning rate.
    pub fn update(&self, key: &PolicyKey, reward: f64) -> PolicyUpdate {
        self.update_with_rate(key, reward, self.learning_rate)
    }

    /// Apply `reward` to `key` with an explicit learning rate.
    pub fn update_with_rate(&self, key: &PolicyKey, reward: f64, learning_rate: f64) -> PolicyUpdate {
        let table = self.read_table();
        let mut row = table
            .entry(key.clone())
            .or_insert_with(|| PolicyEntry::new(key));
        let previous_value = row.action_value;
        let td_error = row.apply_reward(reward, learning_rate);
        PolicyUpdate {
            entry: row.value().clone(),
            previous_value,
            new_value: row.action_value,
            td_error,
        }
    }

    /// Row for `key`, if any.
    #[must_use]
    pub fn get(&self, key: &PolicyKey) -> Option<PolicyEntry> {
        self.read_table().get(key).map(|row| row.value().clone())
    }

    /// Value for `key`, 0 when absent.
    #[must_use]
    pub fn value(&self, key: &PolicyKey) -> f64 {
        self.read_table()
            .get(key)
            .map_or(0.0, |row| row.value().action_value)
    }

    /// Insert or overwrite a row (cache refresh).
    pub fn put(&self, entry: PolicyEntry) {
        self.read_table().insert(entry.key(), entry);
    }

    /// All rows, ordered by key.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PolicyEntry> {
        let mut rows: Vec<PolicyEntry> = self
            .read_table()
            .iter()
            .map(|row| row.value().clone())
            .collect();
        rows.sort_by(|a, b| {
            a.action_id
                .cmp(&b.action_id)
                .then_with(|| a.context.cmp(&b.context))
        });
        rows
    }

    /// Replace every row.
    pub fn replace(&self, entries: Vec<PolicyEntry>) {
        *self.write_table() = entries
            .into_iter()
            .map(|entry| (entry.key(), entry))
            .collect();
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read_table().len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Learning rate (α).
    #[must_use]
    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// Save the table as a JSON array of rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let rows = self.snapshot();
        atomic_write_json(path, &rows)?;
        tracing::debug!(path = %path.display(), rows = rows.len(), "saved policy table");
        Ok(())
    }

    /// Load the table from a JSON array of rows; a missing file is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(&self, path: &Path) -> anyhow::Result<()> {
        let Some(rows) = read_json_if_exists::<Vec<PolicyEntry>>(path)? else {
            return Ok(());
        };
        let count = rows.len();
        self.replace(rows);
        tracing::info!(path = %path.display(), rows = count, "loaded policy table");
        Ok(())
    }
}

impl Default for QTable {
    fn default() -> Self {
        Self::new(0.1)
    }
}
