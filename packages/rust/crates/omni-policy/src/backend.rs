//! Durable backends for the policy table, the episode log and metrics.
//!
//! Every write carries a `write_id` that stays the same across retries of
//! one logical call. Backends apply a given id at most once and answer a
//! repeated id with the result of the first application.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::episode::Episode;
use crate::metrics::MetricPoint;
use crate::persistence::{atomic_write_json, read_json_if_exists};
use crate::q_table::{PolicyEntry, PolicyKey, PolicyUpdate, QTable};

const REMEMBERED_WRITES: usize = 4096;
const MAX_PERSISTED_METRICS: usize = 10_000;

/// Persistence abstraction for policy rows, episodes and metric points.
///
/// `upsert` must apply the value update as one atomic read-modify-write
/// for its key. Callers add timeouts and retries on top and reuse
/// `write_id` for every attempt of one call.
#[async_trait]
pub trait PolicyBackend: Send + Sync {
    /// Backend identifier for logs.
    fn backend_name(&self) -> &'static str;

    /// Apply `reward` to the row at `key` and return the updated row.
    async fn upsert(
        &self,
        write_id: Uuid,
        key: &PolicyKey,
        reward: f64,
        learning_rate: f64,
    ) -> Result<PolicyUpdate>;

    /// Current row for `key`.
    async fn fetch(&self, key: &PolicyKey) -> Result<Option<PolicyEntry>>;

    /// Every stored row.
    async fn load_policy(&self) -> Result<Vec<PolicyEntry>>;

    /// Append one episode.
    async fn append_episode(&self, write_id: Uuid, episode: &Episode) -> Result<()>;

    /// Every stored episode in append order.
    async fn load_episodes(&self) -> Result<Vec<Episode>>;

    /// Append metric points. Backends without metric history drop them.
    async fn append_metrics(&self, _write_id: Uuid, _points: &[MetricPoint]) -> Result<()> {
        Ok(())
    }

    /// Stored metric points, oldest first.
    async fn load_metrics(&self) -> Result<Vec<MetricPoint>> {
        Ok(Vec::new())
    }

    /// Flush buffered state before shutdown.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Results of recently applied writes, keyed by write id.
#[derive(Default)]
struct AppliedWrites {
    order: VecDeque<Uuid>,
    results: HashMap<Uuid, Option<PolicyUpdate>>,
}

impl AppliedWrites {
    fn contains(&self, write_id: Uuid) -> bool {
        self.results.contains_key(&write_id)
    }

    fn upsert_result(&self, write_id: Uuid) -> Option<PolicyUpdate> {
        self.results.get(&write_id).cloned().flatten()
    }

    fn remember(&mut self, write_id: Uuid, result: Option<PolicyUpdate>) {
        if self.order.len() == REMEMBERED_WRITES
            && let Some(oldest) = self.order.pop_front()
        {
            self.results.remove(&oldest);
        }
        self.order.push_back(write_id);
        self.results.insert(write_id, result);
    }
}

struct LocalState {
    q_table: QTable,
    episodes: RwLock<Vec<Episode>>,
    metrics: RwLock<Vec<MetricPoint>>,
    // Held for the whole read-modify-write-snapshot of every write.
    writes: Mutex<AppliedWrites>,
    dir: Option<PathBuf>,
    table_name: String,
}

impl LocalState {
    fn table_file(&self, kind: &str) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.{kind}.json", self.table_name)))
    }

    fn policy_path(&self) -> Option<PathBuf> {
        self.table_file("policy")
    }

    fn episodes_path(&self) -> Option<PathBuf> {
        self.table_file("episodes")
    }

    fn metrics_path(&self) -> Option<PathBuf> {
        self.table_file("metrics")
    }

    fn lock_writes(&self) -> MutexGuard<'_, AppliedWrites> {
        self.writes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn episodes_snapshot(&self) -> Vec<Episode> {
        self.episodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn metrics_snapshot(&self) -> Vec<MetricPoint> {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Compute the new row, persist it, and only then publish it.
    fn apply_upsert(
        &self,
        write_id: Uuid,
        key: &PolicyKey,
        reward: f64,
        learning_rate: f64,
    ) -> Result<PolicyUpdate> {
        let mut writes = self.lock_writes();
        if let Some(update) = writes.upsert_result(write_id) {
            return Ok(update);
        }

        let mut row = self
            .q_table
            .get(key)
            .unwrap_or_else(|| PolicyEntry::new(key));
        let previous_value = row.action_value;
        let td_error = row.apply_reward(reward, learning_rate);

        if let Some(path) = self.policy_path() {
            let mut rows = self.q_table.snapshot();
            rows.retain(|existing| {
                existing.action_id != key.action_id || existing.context != key.context
            });
            rows.push(row.clone());
            atomic_write_json(&path, &rows)?;
        }

        self.q_table.put(row.clone());
        let update = PolicyUpdate {
            new_value: row.action_value,
            entry: row,
            previous_value,
            td_error,
        };
        writes.remember(write_id, Some(update.clone()));
        Ok(update)
    }

    fn apply_episode(&self, write_id: Uuid, episode: &Episode) -> Result<()> {
        let mut writes = self.lock_writes();
        if writes.contains(write_id) {
            return Ok(());
        }
        if let Some(path) = self.episodes_path() {
            let mut episodes = self.episodes_snapshot();
            episodes.push(episode.clone());
            atomic_write_json(&path, &episodes)?;
        }
        self.episodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(episode.clone());
        writes.remember(write_id, None);
        Ok(())
    }

    fn apply_metrics(&self, write_id: Uuid, points: &[MetricPoint]) -> Result<()> {
        let mut writes = self.lock_writes();
        if writes.contains(write_id) {
            return Ok(());
        }
        let mut history = self.metrics_snapshot();
        history.extend_from_slice(points);
        let overflow = history.len().saturating_sub(MAX_PERSISTED_METRICS);
        history.drain(..overflow);
        if let Some(path) = self.metrics_path() {
            atomic_write_json(&path, &history)?;
        }
        *self
            .metrics
            .write()
            .unwrap_or_else(PoisonError::into_inner) = history;
        writes.remember(write_id, None);
        Ok(())
    }

    fn save_all(&self) -> Result<()> {
        let _writes = self.lock_writes();
        if let Some(path) = self.policy_path() {
            self.q_table.save(&path)?;
        }
        if let Some(path) = self.episodes_path() {
            atomic_write_json(&path, &self.episodes_snapshot())?;
        }
        if let Some(path) = self.metrics_path() {
            atomic_write_json(&path, &self.metrics_snapshot())?;
        }
        Ok(())
    }
}

/// Local backend: in-process table, optionally snapshotted to JSON files.
///
/// Files: `<dir>/<table>.policy.json`, `<dir>/<table>.episodes.json` and
/// `<dir>/<table>.metrics.json`.
#[derive(Clone)]
pub struct LocalPolicyBackend {
    state: Arc<LocalState>,
}

impl LocalPolicyBackend {
    fn build(dir: Option<PathBuf>, table_name: &str) -> Self {
        Self {
            state: Arc::new(LocalState {
                q_table: QTable::default(),
                episodes: RwLock::new(Vec::new()),
                metrics: RwLock::new(Vec::new()),
                writes: Mutex::new(AppliedWrites::default()),
                dir,
                table_name: table_name.to_string(),
            }),
        }
    }

    /// Non-durable backend, for tests and ephemeral engines.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::build(None, "policy")
    }

    /// File-backed backend rooted at `dir`; existing snapshots are loaded.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing snapshot cannot be read or parsed.
    pub fn open(dir: impl Into<PathBuf>, table_name: &str) -> Result<Self> {
        let backend = Self::build(Some(dir.into()), table_name);
        let state = &backend.state;
        if let Some(path) = state.policy_path() {
            state.q_table.load(&path)?;
        }
        if let Some(path) = state.episodes_path()
            && let Some(episodes) = read_json_if_exists::<Vec<Episode>>(&path)?
        {
            *state
                .episodes
                .write()
                .unwrap_or_else(PoisonError::into_inner) = episodes;
        }
        if let Some(path) = state.metrics_path()
            && let Some(points) = read_json_if_exists::<Vec<MetricPoint>>(&path)?
        {
            *state
                .metrics
                .write()
                .unwrap_or_else(PoisonError::into_inner) = points;
        }
        Ok(backend)
    }

    /// Snapshot file for policy rows, if file-backed.
    #[must_use]
    pub fn policy_path(&self) -> Option<PathBuf> {
        self.state.policy_path()
    }

    /// Snapshot file for episodes, if file-backed.
    #[must_use]
    pub fn episodes_path(&self) -> Option<PathBuf> {
        self.state.episodes_path()
    }

    /// Snapshot file for metric points, if file-backed.
    #[must_use]
    pub fn metrics_path(&self) -> Option<PathBuf> {
        self.state.metrics_path()
    }

    /// Run one write against the state. File-backed writes run on the
    /// blocking pool and finish even if the caller stops waiting.
    async fn run_write<T, F>(&self, write: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&LocalState) -> Result<T> + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        if state.dir.is_none() {
            return write(&*state);
        }
        tokio::task::spawn_blocking(move || write(&*state))
            .await
            .context("local policy write task failed")?
    }
}

#[async_trait]
impl PolicyBackend for LocalPolicyBackend {
    fn backend_name(&self) -> &'static str {
        "local"
    }

    async fn upsert(
        &self,
        write_id: Uuid,
        key: &PolicyKey,
        reward: f64,
        learning_rate: f64,
    ) -> Result<PolicyUpdate> {
        let key = key.clone();
        self.run_write(move |state| state.apply_upsert(write_id, &key, reward, learning_rate))
            .await
    }

    async fn fetch(&self, key: &PolicyKey) -> Result<Option<PolicyEntry>> {
        Ok(self.state.q_table.get(key))
    }

    async fn load_policy(&self) -> Result<Vec<PolicyEntry>> {
        Ok(self.state.q_table.snapshot())
    }

    async fn append_episode(&self, write_id: Uuid, episode: &Episode) -> Result<()> {
        let episode = episode.clone();
        self.run_write(move |state| state.apply_episode(write_id, &episode))
            .await
    }

    async fn load_episodes(&self) -> Result<Vec<Episode>> {
        Ok(self.state.episodes_snapshot())
    }

    async fn append_metrics(&self, write_id: Uuid, points: &[MetricPoint]) -> Result<()> {
        let points = points.to_vec();
        self.run_write(move |state| state.apply_metrics(write_id, &points))
            .await
    }

    async fn load_metrics(&self) -> Result<Vec<MetricPoint>> {
        Ok(self.state.metrics_snapshot())
    }

    async fn flush(&self) -> Result<()> {
        self.run_write(LocalState::save_all)
            .await
            .context("policy flush failed")
    }
}

/// Build a deterministic Valkey key prefix from prefix + store identity.
#[must_use]
pub fn default_valkey_key_prefix(prefix: &str, store_path: &Path, table_name: &str) -> String {
    let digest = Sha256::digest(store_path.to_string_lossy().as_bytes());
    let path_fingerprint = hex::encode(&digest[..8]);
    format!("{prefix}:{path_fingerprint}:{table_name}")
}

#[cfg(feature = "valkey")]
mod valkey {
    use std::collections::HashMap;

    use anyhow::{Context, Result, anyhow};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use redis::FromRedisValue;
    use tokio::sync::Mutex;

    use uuid::Uuid;

    use super::{MAX_PERSISTED_METRICS, PolicyBackend};
    use crate::episode::Episode;
    use crate::metrics::MetricPoint;
    use crate::fingerprint::ContextFingerprint;
    use crate::q_table::{PolicyEntry, PolicyKey, PolicyUpdate};

    const FIELD_SEPARATOR: char = '\u{1f}';

    // Seconds a write id stays remembered server-side.
    const WRITE_ID_TTL_SECS: u64 = 3600;

    // Row encoding: "<value %.17g>|<visits>|<rfc3339>". The read-modify-write
    // runs server-side, so it is atomic per field. KEYS[2] records the result
    // under the write id; a repeated id returns it unchanged.
    const UPSERT_SCRIPT: &str = r"
local done = redis.call('GET', KEYS[2])
if done then
  local sep = string.find(done, '\n', 1, true)
  return {string.sub(done, 1, sep - 1), string.sub(done, sep + 1)}
end
local raw = redis.call('HGET', KEYS[1], ARGV[1])
local value = 0
local visits = 0
if raw then
  local sep1 = string.find(raw, '|', 1, true)
  local sep2 = string.find(raw, '|', sep1 + 1, true)
  value = tonumber(string.sub(raw, 1, sep1 - 1))
  visits = tonumber(string.sub(raw, sep1 + 1, sep2 - 1))
end
local reward = tonumber(ARGV[2])
local alpha = tonumber(ARGV[3])
local new_value = value + alpha * (reward - value)
local row = string.format('%.17g|%d|%s', new_value, visits + 1, ARGV[4])
local previous = string.format('%.17g', value)
redis.call('HSET', KEYS[1], ARGV[1], row)
redis.call('SET', KEYS[2], row .. '\n' .. previous, 'EX', ARGV[5])
return {row, previous}
";

    // ARGV: ttl, cap (0 = unbounded), items...
    const APPEND_SCRIPT: &str = r"
if not redis.call('SET', KEYS[2], '1', 'NX', 'EX', ARGV[1]) then
  return 0
end
for i = 3, #ARGV do
  redis.call('RPUSH', KEYS[1], ARGV[i])
end
local cap = tonumber(ARGV[2])
if cap > 0 then
  redis.call('LTRIM', KEYS[1], -cap, -1)
end
return 1
";

    fn field_for(key: &PolicyKey) -> String {
        format!("{}{FIELD_SEPARATOR}{}", key.action_id, key.context)
    }

    fn decode_row(field: &str, raw: &str) -> Result<PolicyEntry> {
        let (action_id, context) = field
            .split_once(FIELD_SEPARATOR)
            .ok_or_else(|| anyhow!("malformed policy field `{field}`"))?;
        let mut parts = raw.splitn(3, '|');
        let value = parts
            .next()
            .ok_or_else(|| anyhow!("policy row missing value"))?
            .parse::<f64>()
            .context("policy row value is not a number")?;
        let visits = parts
            .next()
            .ok_or_else(|| anyhow!("policy row missing visit count"))?
            .parse::<u64>()
            .context("policy row visit count is not an integer")?;
        let updated = parts
            .next()
            .ok_or_else(|| anyhow!("policy row missing timestamp"))?;
        let last_updated = DateTime::parse_from_rfc3339(updated)
            .context("policy row timestamp is not rfc3339")?
            .with_timezone(&Utc);
        Ok(PolicyEntry {
            action_id: action_id.to_string(),
            context: ContextFingerprint::parse(context)
                .map_err(|error| anyhow!("policy row context: {error}"))?,
            action_value: value,
            visit_count: visits,
            last_updated,
        })
    }

    /// Valkey-backed policy store: one hash for rows, one list for episodes.
    pub struct ValkeyPolicyBackend {
        client: redis::Client,
        key_prefix: String,
        connection: Mutex<Option<redis::aio::MultiplexedConnection>>,
    }

    impl ValkeyPolicyBackend {
        /// Create a Valkey policy backend.
        ///
        /// # Errors
        ///
        /// Returns an error if the URL cannot be parsed.
        pub fn new(redis_url: impl AsRef<str>, key_prefix: impl Into<String>) -> Result<Self> {
            let redis_url = redis_url.as_ref();
            let client = redis::Client::open(redis_url).with_context(|| {
                format!("invalid redis url for policy persistence: {redis_url}")
            })?;
            Ok(Self {
                client,
                key_prefix: key_prefix.into(),
                connection: Mutex::new(None),
            })
        }

        fn policy_key(&self) -> String {
            format!("{}:policy", self.key_prefix)
        }

        fn episodes_key(&self) -> String {
            format!("{}:episodes", self.key_prefix)
        }

        fn metrics_key(&self) -> String {
            format!("{}:metrics", self.key_prefix)
        }

        fn write_key(&self, write_id: Uuid) -> String {
            format!("{}:write:{write_id}", self.key_prefix)
        }

        async fn append_once(
            &self,
            operation: &'static str,
            list_key: String,
            write_id: Uuid,
            cap: usize,
            items: Vec<String>,
        ) -> Result<()> {
            let mut cmd = redis::cmd("EVAL");
            cmd.arg(APPEND_SCRIPT)
                .arg(2)
                .arg(list_key)
                .arg(self.write_key(write_id))
                .arg(WRITE_ID_TTL_SECS)
                .arg(cap);
            for item in items {
                cmd.arg(item);
            }
            let _: i64 = self.run_command(operation, cmd).await?;
            Ok(())
        }

        /// One command on the shared connection; a failed command drops the
        /// connection so the next call reconnects.
        async fn run_command<T>(&self, operation: &'static str, cmd: redis::Cmd) -> Result<T>
        where
            T: FromRedisValue + Send,
        {
            let mut guard = self.connection.lock().await;
            if guard.is_none() {
                *guard = Some(
                    self.client
                        .get_multiplexed_async_connection()
                        .await
                        .context("failed to open valkey connection for policy store")?,
                );
            }
            let connection = guard
                .as_mut()
                .ok_or_else(|| anyhow!("policy store valkey connection unavailable"))?;
            let result: redis::RedisResult<T> = cmd.query_async(connection).await;
            match result {
                Ok(value) => Ok(value),
                Err(error) => {
                    *guard = None;
                    Err(anyhow!(error)).with_context(|| format!("valkey {operation} failed"))
                }
            }
        }
    }

    #[async_trait]
    impl PolicyBackend for ValkeyPolicyBackend {
        fn backend_name(&self) -> &'static str {
            "valkey"
        }

        async fn upsert(
            &self,
            write_id: Uuid,
            key: &PolicyKey,
            reward: f64,
            learning_rate: f64,
        ) -> Result<PolicyUpdate> {
            let field = field_for(key);
            let mut cmd = redis::cmd("EVAL");
            cmd.arg(UPSERT_SCRIPT)
                .arg(2)
                .arg(self.policy_key())
                .arg(self.write_key(write_id))
                .arg(&field)
                .arg(reward)
                .arg(learning_rate)
                .arg(Utc::now().to_rfc3339())
                .arg(WRITE_ID_TTL_SECS);
            let (row, previous): (String, String) = self.run_command("policy_upsert", cmd).await?;
            let entry = decode_row(&field, &row)?;
            let previous_value = previous
                .parse::<f64>()
                .context("policy upsert returned a non-numeric previous value")?;
            Ok(PolicyUpdate {
                new_value: entry.action_value,
                td_error: reward - previous_value,
                previous_value,
                entry,
            })
        }

        async fn fetch(&self, key: &PolicyKey) -> Result<Option<PolicyEntry>> {
            let field = field_for(key);
            let mut cmd = redis::cmd("HGET");
            cmd.arg(self.policy_key()).arg(&field);
            let raw: Option<String> = self.run_command("policy_fetch", cmd).await?;
            raw.map(|raw| decode_row(&field, &raw)).transpose()
        }

        async fn load_policy(&self) -> Result<Vec<PolicyEntry>> {
            let mut cmd = redis::cmd("HGETALL");
            cmd.arg(self.policy_key());
            let rows: HashMap<String, String> = self.run_command("policy_load", cmd).await?;
            let mut entries = rows
                .iter()
                .map(|(field, raw)| decode_row(field, raw))
                .collect::<Result<Vec<_>>>()?;
            entries.sort_by(|a, b| {
                a.action_id
                    .cmp(&b.action_id)
                    .then_with(|| a.context.cmp(&b.context))
            });
            Ok(entries)
        }

        async fn append_episode(&self, write_id: Uuid, episode: &Episode) -> Result<()> {
            let payload =
                serde_json::to_string(episode).context("failed to encode episode for valkey")?;
            self.append_once("episode_append", self.episodes_key(), write_id, 0, vec![payload])
                .await
        }

        async fn load_episodes(&self) -> Result<Vec<Episode>> {
            let mut cmd = redis::cmd("LRANGE");
            cmd.arg(self.episodes_key()).arg(0).arg(-1);
            let payloads: Vec<String> = self.run_command("episode_load", cmd).await?;
            payloads
                .iter()
                .map(|payload| {
                    serde_json::from_str::<Episode>(payload)
                        .context("failed to decode valkey episode")
                })
                .collect()
        }

        async fn append_metrics(&self, write_id: Uuid, points: &[MetricPoint]) -> Result<()> {
            let payloads = points
                .iter()
                .map(serde_json::to_string)
                .collect::<Result<Vec<_>, _>>()
                .context("failed to encode metric points for valkey")?;
            self.append_once(
                "metrics_append",
                self.metrics_key(),
                write_id,
                MAX_PERSISTED_METRICS,
                payloads,
            )
            .await
        }

        async fn load_metrics(&self) -> Result<Vec<MetricPoint>> {
            let mut cmd = redis::cmd("LRANGE");
            cmd.arg(self.metrics_key()).arg(0).arg(-1);
            let payloads: Vec<String> = self.run_command("metrics_load", cmd).await?;
            payloads
                .iter()
                .map(|payload| {
                    serde_json::from_str::<MetricPoint>(payload)
                        .context("failed to decode valkey metric point")
                })
                .collect()
        }
    }
}

#[cfg(feature = "valkey")]
pub use valkey::ValkeyPolicyBackend;
