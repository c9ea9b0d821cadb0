//! Shared test helpers for omni-policy.
#![allow(dead_code, missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use omni_policy::{
    ContextFingerprint, ContextFingerprinter, EngineConfig, Episode, LocalPolicyBackend,
    MetricPoint, PolicyBackend, PolicyEntry, PolicyKey, PolicyUpdate, RetryConfig,
};
use uuid::Uuid;

/// Retry budget small enough to keep failure tests fast.
pub fn fast_retry(attempts: u32) -> RetryConfig {
    RetryConfig {
        attempts,
        attempt_timeout: Duration::from_millis(500),
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(4),
    }
}

/// Deterministic engine config for tests.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        seed: Some(7),
        retry: fast_retry(3),
        ..EngineConfig::default()
    }
}

/// Fingerprint for a short intent.
pub fn context(intent: &str) -> ContextFingerprint {
    ContextFingerprinter::default().fingerprint(intent, None, 0)
}

pub fn actions(ids: &[&str]) -> Vec<String> {
    ids.iter().map(ToString::to_string).collect()
}

/// In-memory backend that can be switched off to simulate an outage.
///
/// [`FlakyBackend::lose_replies`] makes writes commit and then report a
/// failure, like a reply lost after the server applied the command.
pub struct FlakyBackend {
    inner: LocalPolicyBackend,
    down: AtomicBool,
    lost_replies: AtomicU32,
    upsert_attempts: AtomicU32,
    append_attempts: AtomicU32,
}

impl FlakyBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: LocalPolicyBackend::in_memory(),
            down: AtomicBool::new(false),
            lost_replies: AtomicU32::new(0),
            upsert_attempts: AtomicU32::new(0),
            append_attempts: AtomicU32::new(0),
        })
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Lose the reply of the next `count` writes after they commit.
    pub fn lose_replies(&self, count: u32) {
        self.lost_replies.store(count, Ordering::SeqCst);
    }

    pub fn upsert_attempts(&self) -> u32 {
        self.upsert_attempts.load(Ordering::SeqCst)
    }

    pub fn append_attempts(&self) -> u32 {
        self.append_attempts.load(Ordering::SeqCst)
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.down.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }
        Ok(())
    }

    fn lose_reply(&self) -> anyhow::Result<()> {
        let lost = self
            .lost_replies
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if lost.is_ok() {
            anyhow::bail!("connection reset before reply");
        }
        Ok(())
    }
}

#[async_trait]
impl PolicyBackend for FlakyBackend {
    fn backend_name(&self) -> &'static str {
        "flaky"
    }

    async fn upsert(
        &self,
        write_id: Uuid,
        key: &PolicyKey,
        reward: f64,
        learning_rate: f64,
    ) -> anyhow::Result<PolicyUpdate> {
        self.upsert_attempts.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        let update = self.inner.upsert(write_id, key, reward, learning_rate).await?;
        self.lose_reply()?;
        Ok(update)
    }

    async fn fetch(&self, key: &PolicyKey) -> anyhow::Result<Option<PolicyEntry>> {
        self.check()?;
        self.inner.fetch(key).await
    }

    async fn load_policy(&self) -> anyhow::Result<Vec<PolicyEntry>> {
        self.check()?;
        self.inner.load_policy().await
    }

    async fn append_episode(&self, write_id: Uuid, episode: &Episode) -> anyhow::Result<()> {
        self.append_attempts.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.append_episode(write_id, episode).await?;
        self.lose_reply()
    }

    async fn load_episodes(&self) -> anyhow::Result<Vec<Episode>> {
        self.check()?;
        self.inner.load_episodes().await
    }

    async fn append_metrics(&self, write_id: Uuid, points: &[MetricPoint]) -> anyhow::Result<()> {
        self.check()?;
        self.inner.append_metrics(write_id, points).await?;
        self.lose_reply()
    }

    async fn load_metrics(&self) -> anyhow::Result<Vec<MetricPoint>> {
        self.check()?;
        self.inner.load_metrics().await
    }
}
