//! Structured event names emitted through `tracing`.

/// Stable `event` field values for policy-engine logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PolicyEvent {
    EngineOpened,
    EngineShutdown,
    PolicyCacheRefreshed,
    PolicyCacheRefreshFailed,
    PolicyUpserted,
    PolicyReadThroughFailed,
    PersistenceAttemptFailed,
    PersistenceGaveUp,
    SelectionMade,
    ExplorationReset,
    ReplayApplied,
    EpisodeLogged,
    EpisodeLogLoaded,
    MetricsFlushed,
    MetricsFlushFailed,
    SettingsIgnored,
}

impl PolicyEvent {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::EngineOpened => "policy.engine.opened",
            Self::EngineShutdown => "policy.engine.shutdown",
            Self::PolicyCacheRefreshed => "policy.cache.refreshed",
            Self::PolicyCacheRefreshFailed => "policy.cache.refresh_failed",
            Self::PolicyUpserted => "policy.store.upserted",
            Self::PolicyReadThroughFailed => "policy.store.read_through_failed",
            Self::PersistenceAttemptFailed => "policy.persistence.attempt_failed",
            Self::PersistenceGaveUp => "policy.persistence.gave_up",
            Self::SelectionMade => "policy.selector.selected",
            Self::ExplorationReset => "policy.selector.exploration_reset",
            Self::ReplayApplied => "policy.replay.applied",
            Self::EpisodeLogged => "policy.episode.logged",
            Self::EpisodeLogLoaded => "policy.episode.loaded",
            Self::MetricsFlushed => "policy.metrics.flushed",
            Self::MetricsFlushFailed => "policy.metrics.flush_failed",
            Self::SettingsIgnored => "policy.settings.ignored",
        }
    }
}
