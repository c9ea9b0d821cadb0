//! Engine configuration and layered settings loader.
//!
//! Loads and merges:
//! - System defaults: `<PRJ_ROOT>/packages/conf/policy.yaml`
//! - User overrides:  `<PRJ_CONFIG_HOME>/omni-dev-fusion/policy.yaml`
//!
//! Merge precedence is user over system; `OMNI_POLICY_*` environment
//! variables apply last.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{PolicyError, PolicyResult};
use crate::fingerprint::DEFAULT_DOMAIN_VOCABULARY;
use crate::observability::PolicyEvent;
use crate::selector::SelectionStrategy;

const DEFAULT_SYSTEM_SETTINGS_RELATIVE_PATH: &str = "packages/conf/policy.yaml";
const DEFAULT_USER_SETTINGS_RELATIVE_PATH: &str = "omni-dev-fusion/policy.yaml";
const DEFAULT_CONFIG_HOME_RELATIVE_PATH: &str = ".config";

/// Retry/timeout budget for persistence calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts per durable write (>= 1).
    pub attempts: u32,
    /// Hard timeout for one backend attempt.
    pub attempt_timeout: Duration,
    /// Backoff before the second attempt; doubles afterwards.
    pub initial_backoff: Duration,
    /// Upper bound for one backoff sleep.
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            attempt_timeout: Duration::from_secs(2),
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// Tunables for the decision engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Initial epsilon for epsilon-greedy selection.
    pub exploration_rate: f64,
    /// Multiplicative decay applied after each selection (1.0 disables decay).
    pub exploration_decay: f64,
    /// Floor the decayed exploration rate never drops below.
    pub min_exploration_rate: f64,
    /// Step size α of the value update.
    pub learning_rate: f64,
    /// Carried for reporting; the single-step update does not bootstrap.
    pub discount_factor: f64,
    /// Outcome samples needed before an action earns the sample-size bonus.
    pub min_samples: u64,
    /// UCB exploration constant.
    pub ucb_c: f64,
    /// Strategy used when callers do not pick one.
    pub default_strategy: SelectionStrategy,
    /// Replay buffer capacity.
    pub replay_capacity: usize,
    /// Priority exponent for replay sampling (0 = uniform).
    pub replay_alpha: f64,
    /// Batch size for replay passes.
    pub batch_size: usize,
    /// Run a replay pass every N policy updates (0 disables).
    pub replay_every: usize,
    /// Rolling window length per learning metric.
    pub metrics_window: usize,
    /// Persist metric points once this many are pending (0 = only on
    /// explicit flush and shutdown).
    pub metrics_flush_threshold: usize,
    /// Longest n-gram mined from episodes.
    pub max_ngram: usize,
    /// Age after which a cached policy value is re-read from the backend.
    pub cache_ttl: Duration,
    /// Persistence retry budget.
    pub retry: RetryConfig,
    /// Domain vocabulary for intent keyword extraction.
    pub vocabulary: Vec<String>,
    /// Number of leading intent tokens folded into the keyword set.
    pub leading_tokens: usize,
    /// Fixed RNG seed for reproducible exploration.
    pub seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            exploration_rate: 0.1,
            exploration_decay: 0.995,
            min_exploration_rate: 0.01,
            learning_rate: 0.1,
            discount_factor: 0.9,
            min_samples: 5,
            ucb_c: 2.0,
            default_strategy: SelectionStrategy::EpsilonGreedy,
            replay_capacity: 10_000,
            replay_alpha: 0.6,
            batch_size: 32,
            replay_every: 0,
            metrics_window: 100,
            metrics_flush_threshold: 100,
            max_ngram: 3,
            cache_ttl: Duration::from_secs(30),
            retry: RetryConfig::default(),
            vocabulary: DEFAULT_DOMAIN_VOCABULARY
                .iter()
                .map(ToString::to_string)
                .collect(),
            leading_tokens: 5,
            seed: None,
        }
    }
}

impl EngineConfig {
    /// Build a config from merged settings, falling back to defaults.
    #[must_use]
    pub fn from_settings(settings: &PolicySettings) -> Self {
        let defaults = Self::default();
        let learning = &settings.learning;
        let persistence = &settings.persistence;
        Self {
            exploration_rate: learning
                .exploration_rate
                .unwrap_or(defaults.exploration_rate),
            exploration_decay: learning
                .exploration_decay
                .unwrap_or(defaults.exploration_decay),
            min_exploration_rate: learning
                .min_exploration_rate
                .unwrap_or(defaults.min_exploration_rate),
            learning_rate: learning.learning_rate.unwrap_or(defaults.learning_rate),
            discount_factor: learning
                .discount_factor
                .unwrap_or(defaults.discount_factor),
            min_samples: learning.min_samples.unwrap_or(defaults.min_samples),
            ucb_c: learning.ucb_c.unwrap_or(defaults.ucb_c),
            default_strategy: learning
                .strategy
                .as_deref()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(defaults.default_strategy),
            replay_capacity: learning
                .replay_capacity
                .unwrap_or(defaults.replay_capacity),
            replay_alpha: learning.replay_alpha.unwrap_or(defaults.replay_alpha),
            batch_size: learning.batch_size.unwrap_or(defaults.batch_size),
            replay_every: learning.replay_every.unwrap_or(defaults.replay_every),
            metrics_window: learning.metrics_window.unwrap_or(defaults.metrics_window),
            metrics_flush_threshold: learning
                .metrics_flush_threshold
                .unwrap_or(defaults.metrics_flush_threshold),
            max_ngram: learning.max_ngram.unwrap_or(defaults.max_ngram),
            cache_ttl: persistence
                .cache_ttl_secs
                .map_or(defaults.cache_ttl, Duration::from_secs),
            retry: RetryConfig {
                attempts: persistence
                    .retry_attempts
                    .unwrap_or(defaults.retry.attempts),
                attempt_timeout: persistence
                    .timeout_ms
                    .map_or(defaults.retry.attempt_timeout, Duration::from_millis),
                initial_backoff: persistence
                    .retry_backoff_ms
                    .map_or(defaults.retry.initial_backoff, Duration::from_millis),
                max_backoff: defaults.retry.max_backoff,
            },
            vocabulary: learning
                .vocabulary
                .clone()
                .filter(|terms| !terms.is_empty())
                .unwrap_or(defaults.vocabulary),
            leading_tokens: learning.leading_tokens.unwrap_or(defaults.leading_tokens),
            seed: learning.seed,
        }
    }

    /// Apply `OMNI_POLICY_*` environment overrides.
    ///
    /// Unparseable values are logged and ignored.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(value) = env_parse::<f64>("OMNI_POLICY_EXPLORATION_RATE") {
            self.exploration_rate = value;
        }
        if let Some(value) = env_parse::<f64>("OMNI_POLICY_LEARNING_RATE") {
            self.learning_rate = value;
        }
        if let Some(value) = env_parse::<f64>("OMNI_POLICY_UCB_C") {
            self.ucb_c = value;
        }
        if let Some(value) = env_parse::<u64>("OMNI_POLICY_MIN_SAMPLES") {
            self.min_samples = value;
        }
        if let Some(value) = env_parse::<SelectionStrategy>("OMNI_POLICY_STRATEGY") {
            self.default_strategy = value;
        }
        if let Some(value) = env_parse::<u64>("OMNI_POLICY_SEED") {
            self.seed = Some(value);
        }
        self
    }

    /// Check ranges before any component is built.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidInput`] naming the first offending field.
    pub fn validate(&self) -> PolicyResult<()> {
        fn unit(name: &str, value: f64) -> PolicyResult<()> {
            if value.is_finite() && (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(PolicyError::invalid(format!(
                    "{name} must be within [0, 1], got {value}"
                )))
            }
        }

        unit("exploration_rate", self.exploration_rate)?;
        unit("min_exploration_rate", self.min_exploration_rate)?;
        unit("discount_factor", self.discount_factor)?;
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0 && self.learning_rate <= 1.0)
        {
            return Err(PolicyError::invalid(format!(
                "learning_rate must be within (0, 1], got {}",
                self.learning_rate
            )));
        }
        if !(self.exploration_decay.is_finite()
            && self.exploration_decay > 0.0
            && self.exploration_decay <= 1.0)
        {
            return Err(PolicyError::invalid(format!(
                "exploration_decay must be within (0, 1], got {}",
                self.exploration_decay
            )));
        }
        if !self.ucb_c.is_finite() || self.ucb_c < 0.0 {
            return Err(PolicyError::invalid(format!(
                "ucb_c must be finite and >= 0, got {}",
                self.ucb_c
            )));
        }
        if !self.replay_alpha.is_finite() || self.replay_alpha < 0.0 {
            return Err(PolicyError::invalid(format!(
                "replay_alpha must be finite and >= 0, got {}",
                self.replay_alpha
            )));
        }
        if self.replay_capacity == 0 {
            return Err(PolicyError::invalid("replay_capacity must be > 0"));
        }
        if self.batch_size == 0 {
            return Err(PolicyError::invalid("batch_size must be > 0"));
        }
        if self.metrics_window == 0 {
            return Err(PolicyError::invalid("metrics_window must be > 0"));
        }
        if self.max_ngram < 2 {
            return Err(PolicyError::invalid(format!(
                "max_ngram must be >= 2, got {}",
                self.max_ngram
            )));
        }
        if self.retry.attempts == 0 {
            return Err(PolicyError::invalid("retry.attempts must be >= 1"));
        }
        if self.retry.attempt_timeout.is_zero() {
            return Err(PolicyError::invalid("retry.attempt_timeout must be > 0"));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &'static str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(
                event = PolicyEvent::SettingsIgnored.as_str(),
                env_var = name,
                value = %raw,
                "invalid policy env value; using settings/default"
            );
            None
        }
    }
}

/// Raw layered settings file shape.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicySettings {
    /// Learning/selection tunables.
    #[serde(default)]
    pub learning: LearningSettings,
    /// Backend selection and retry budget.
    #[serde(default)]
    pub persistence: PersistenceSettings,
}

/// `learning:` block of the settings file.
#[derive(Debug, Clone, Default, Deserialize)]
#[allow(missing_docs)]
pub struct LearningSettings {
    pub exploration_rate: Option<f64>,
    pub exploration_decay: Option<f64>,
    pub min_exploration_rate: Option<f64>,
    pub learning_rate: Option<f64>,
    pub discount_factor: Option<f64>,
    pub min_samples: Option<u64>,
    pub ucb_c: Option<f64>,
    pub strategy: Option<String>,
    pub replay_capacity: Option<usize>,
    pub replay_alpha: Option<f64>,
    pub batch_size: Option<usize>,
    pub replay_every: Option<usize>,
    pub metrics_window: Option<usize>,
    pub metrics_flush_threshold: Option<usize>,
    pub max_ngram: Option<usize>,
    pub vocabulary: Option<Vec<String>>,
    pub leading_tokens: Option<usize>,
    pub seed: Option<u64>,
}

/// `persistence:` block of the settings file.
#[derive(Debug, Clone, Default, Deserialize)]
#[allow(missing_docs)]
pub struct PersistenceSettings {
    /// `local` (default) or `valkey`.
    pub backend: Option<String>,
    pub path: Option<String>,
    pub table_name: Option<String>,
    pub valkey_url: Option<String>,
    pub key_prefix: Option<String>,
    pub timeout_ms: Option<u64>,
    pub retry_attempts: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
    pub cache_ttl_secs: Option<u64>,
}

impl PolicySettings {
    fn merge(self, overlay: Self) -> Self {
        Self {
            learning: self.learning.merge(overlay.learning),
            persistence: self.persistence.merge(overlay.persistence),
        }
    }

    /// Backend name, defaulting to `local`.
    #[must_use]
    pub fn backend_name(&self) -> String {
        self.persistence
            .backend
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or("local")
            .to_ascii_lowercase()
    }

    /// Directory for the local JSON backend.
    #[must_use]
    pub fn persistence_path(&self) -> PathBuf {
        self.persistence
            .path
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map_or_else(default_policy_store_path, PathBuf::from)
    }

    /// Table name used for file names and key prefixes.
    #[must_use]
    pub fn table_name(&self) -> String {
        self.persistence
            .table_name
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or("policy")
            .to_string()
    }
}

impl LearningSettings {
    fn merge(self, overlay: Self) -> Self {
        Self {
            exploration_rate: overlay.exploration_rate.or(self.exploration_rate),
            exploration_decay: overlay.exploration_decay.or(self.exploration_decay),
            min_exploration_rate: overlay.min_exploration_rate.or(self.min_exploration_rate),
            learning_rate: overlay.learning_rate.or(self.learning_rate),
            discount_factor: overlay.discount_factor.or(self.discount_factor),
            min_samples: overlay.min_samples.or(self.min_samples),
            ucb_c: overlay.ucb_c.or(self.ucb_c),
            strategy: overlay.strategy.or(self.strategy),
            replay_capacity: overlay.replay_capacity.or(self.replay_capacity),
            replay_alpha: overlay.replay_alpha.or(self.replay_alpha),
            batch_size: overlay.batch_size.or(self.batch_size),
            replay_every: overlay.replay_every.or(self.replay_every),
            metrics_window: overlay.metrics_window.or(self.metrics_window),
            metrics_flush_threshold: overlay
                .metrics_flush_threshold
                .or(self.metrics_flush_threshold),
            max_ngram: overlay.max_ngram.or(self.max_ngram),
            vocabulary: overlay.vocabulary.or(self.vocabulary),
            leading_tokens: overlay.leading_tokens.or(self.leading_tokens),
            seed: overlay.seed.or(self.seed),
        }
    }
}

impl PersistenceSettings {
    fn merge(self, overlay: Self) -> Self {
        Self {
            backend: overlay.backend.or(self.backend),
            path: overlay.path.or(self.path),
            table_name: overlay.table_name.or(self.table_name),
            valkey_url: overlay.valkey_url.or(self.valkey_url),
            key_prefix: overlay.key_prefix.or(self.key_prefix),
            timeout_ms: overlay.timeout_ms.or(self.timeout_ms),
            retry_attempts: overlay.retry_attempts.or(self.retry_attempts),
            retry_backoff_ms: overlay.retry_backoff_ms.or(self.retry_backoff_ms),
            cache_ttl_secs: overlay.cache_ttl_secs.or(self.cache_ttl_secs),
        }
    }
}

/// Load merged policy settings (user overrides system).
#[must_use]
pub fn load_policy_settings(config_home_override: Option<&Path>) -> PolicySettings {
    let (system_path, user_path) = policy_settings_paths(config_home_override);
    load_policy_settings_from_paths(&system_path, &user_path)
}

#[doc(hidden)]
#[must_use]
pub fn policy_settings_paths(config_home_override: Option<&Path>) -> (PathBuf, PathBuf) {
    let root = project_root();
    let system_path = root.join(DEFAULT_SYSTEM_SETTINGS_RELATIVE_PATH);
    let config_home = config_home_override.map_or_else(
        || resolve_config_home(&root),
        |path| absolutize(&root, path.to_path_buf()),
    );
    let user_path = config_home.join(DEFAULT_USER_SETTINGS_RELATIVE_PATH);
    (system_path, user_path)
}

#[doc(hidden)]
#[must_use]
pub fn load_policy_settings_from_paths(system: &Path, user: &Path) -> PolicySettings {
    load_one(system).merge(load_one(user))
}

fn load_one(path: &Path) -> PolicySettings {
    if !path.exists() {
        return PolicySettings::default();
    }
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) => {
            tracing::warn!(
                event = PolicyEvent::SettingsIgnored.as_str(),
                path = %path.display(),
                error = %error,
                "failed to read policy settings file; ignoring"
            );
            return PolicySettings::default();
        }
    };
    match serde_yaml::from_str::<PolicySettings>(&raw) {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(
                event = PolicyEvent::SettingsIgnored.as_str(),
                path = %path.display(),
                error = %error,
                "failed to parse policy settings yaml; ignoring file"
            );
            PolicySettings::default()
        }
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

fn project_root() -> PathBuf {
    env_path("PRJ_ROOT")
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

fn resolve_config_home(project_root: &Path) -> PathBuf {
    let configured = env_path("PRJ_CONFIG_HOME")
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_HOME_RELATIVE_PATH));
    absolutize(project_root, configured)
}

fn absolutize(project_root: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        project_root.join(path)
    }
}

/// Default directory for the local backend: `<PRJ_DATA_HOME>/omni-policy`.
#[must_use]
pub fn default_policy_store_path() -> PathBuf {
    let root = project_root();
    let data_home = env_path("PRJ_DATA_HOME").unwrap_or_else(|| root.join(".data"));
    data_home.join("omni-policy")
}
