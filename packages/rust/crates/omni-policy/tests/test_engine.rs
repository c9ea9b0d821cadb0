#![allow(missing_docs)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FlakyBackend, actions, test_config};
use omni_policy::{
    EngineConfig, EpisodeOutcome, ExecutionOutcome, InMemoryOutcomeLog, LocalPolicyBackend,
    NoOutcomeMetrics, PolicyBackend, PolicyEngine, PolicyError, SelectionStrategy,
    StaticActionCatalog, metric_names,
};

async fn engine_with(config: EngineConfig, backend: Arc<dyn PolicyBackend>) -> PolicyEngine {
    PolicyEngine::open(config, backend, Arc::new(NoOutcomeMetrics))
        .await
        .expect("engine opens")
}

#[tokio::test]
async fn test_record_outcome_updates_policy_replay_and_metrics() {
    let engine = engine_with(test_config(), Arc::new(LocalPolicyBackend::in_memory())).await;
    let ctx = engine.fingerprint("retrieve account balance", None, 0);
    let outcome = ExecutionOutcome::new("get_balance", true, 0.0, None).expect("outcome");

    let recorded = engine
        .record_outcome(&ctx, &outcome, None)
        .await
        .expect("recorded");
    assert!((recorded.reward - 10.0).abs() < 1e-9);
    assert!((recorded.update.new_value - 1.0).abs() < 1e-9);
    assert!((engine.store().read("get_balance", &ctx) - 1.0).abs() < 1e-9);

    let stats = engine.learning_stats();
    assert_eq!(stats.replay_size, 1);
    assert_eq!(stats.policy_entries, 1);
    assert_eq!(engine.metrics_summary(metric_names::REWARD).count, 1);
    assert_eq!(engine.metrics_summary(metric_names::TD_ERROR).count, 1);
    assert_eq!(stats.top_entries[0].action_id, "get_balance");
}

#[tokio::test]
async fn test_outage_leaves_engine_state_untouched() {
    let backend = FlakyBackend::new();
    let engine = engine_with(test_config(), backend.clone()).await;
    let ctx = engine.fingerprint("import data", None, 1);
    backend.set_down(true);

    let outcome = ExecutionOutcome::new("import", true, 120.0, Some(4)).expect("outcome");
    let error = engine
        .record_outcome(&ctx, &outcome, None)
        .await
        .expect_err("backend down");
    assert!(error.is_persistence_unavailable());
    assert_eq!(backend.upsert_attempts(), 3);
    assert_eq!(engine.learning_stats().replay_size, 0);
    assert_eq!(engine.metrics_summary(metric_names::REWARD).count, 0);
    assert!(engine.store().read("import", &ctx).abs() < f64::EPSILON);

    let logged = engine
        .log_episode("s-1", actions(&["import"]), 5.0, EpisodeOutcome::Success)
        .await;
    assert!(matches!(
        logged,
        Err(PolicyError::PersistenceUnavailable { attempts: 3, .. })
    ));
    assert!(engine.get_successful_sequences(None, 10).is_empty());
    assert!(engine.sequence_patterns().is_empty());

    // Selection keeps working from the cache.
    let selection = engine
        .select(&ctx, &actions(&["import", "export"]), None)
        .expect("select");
    assert!(!selection.action_id.is_empty());
}

#[tokio::test]
async fn test_engine_opens_degraded_when_backend_is_down() {
    let backend = FlakyBackend::new();
    backend.set_down(true);
    let engine = engine_with(test_config(), backend.clone()).await;
    assert!(engine.store().is_empty());
    assert_eq!(engine.learning_stats().backend, "flaky");
}

#[tokio::test]
async fn test_episodes_feed_sequence_recommendations() {
    let engine = engine_with(test_config(), Arc::new(LocalPolicyBackend::in_memory())).await;
    for i in 0..5 {
        engine
            .log_episode(
                &format!("s-{i}"),
                actions(&["A", "B", "C"]),
                10.0 + f64::from(i),
                EpisodeOutcome::Success,
            )
            .await
            .expect("logged");
    }
    engine
        .log_episode("s-fail", actions(&["A", "B", "D"]), 99.0, EpisodeOutcome::Failure)
        .await
        .expect("logged");

    let suggestions =
        engine.get_sequence_recommendations(&actions(&["A", "B"]), &actions(&["C", "D", "E"]), 3);
    assert_eq!(suggestions.len(), 1);
    assert_eq!(suggestions[0].action_id, "C");
    assert_eq!(suggestions[0].occurrences, 5);
    assert!((suggestions[0].avg_reward - 12.0).abs() < 1e-9);
    assert!(suggestions[0].rationale.contains("5x"), "{}", suggestions[0].rationale);

    let best = engine.get_successful_sequences(Some("C"), 2);
    assert_eq!(best.len(), 2);
    assert_eq!(best[0].session_id, "s-4");
    assert_eq!(best[1].session_id, "s-3");
    assert!(engine.get_successful_sequences(Some("D"), 10).is_empty());

    let stats = engine.learning_stats();
    assert_eq!(stats.episodes, 6);
    assert_eq!(stats.successful_episodes, 5);
    assert_eq!(engine.metrics_summary(metric_names::EPISODE_LENGTH).count, 6);
    assert!((engine.metrics_summary(metric_names::EPISODE_LENGTH).mean - 3.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_reopen_restores_policy_and_sequences() {
    let backend: Arc<dyn PolicyBackend> = Arc::new(LocalPolicyBackend::in_memory());
    let first = engine_with(test_config(), Arc::clone(&backend)).await;
    let ctx = first.fingerprint("run consolidation", None, 0);
    first.upsert_policy("consolidate", &ctx, 5.0).await.expect("upsert");
    first
        .log_episode("s-1", actions(&["load", "consolidate"]), 8.0, EpisodeOutcome::Success)
        .await
        .expect("logged");
    first.shutdown().await.expect("shutdown");

    let second = engine_with(test_config(), backend).await;
    assert!((second.store().read("consolidate", &ctx) - 0.5).abs() < 1e-9);
    let suggestions =
        second.get_sequence_recommendations(&actions(&["load"]), &actions(&["consolidate"]), 1);
    assert_eq!(suggestions.len(), 1);
}

#[tokio::test]
async fn test_replay_reapplies_sampled_experiences() {
    let engine = engine_with(test_config(), Arc::new(LocalPolicyBackend::in_memory())).await;
    assert!(matches!(
        engine.replay(4).await,
        Err(PolicyError::EmptyReplayBuffer)
    ));

    let ctx = engine.fingerprint("job status", None, 0);
    let outcome = ExecutionOutcome::new("check_job", true, 0.0, None).expect("outcome");
    engine
        .record_outcome(&ctx, &outcome, None)
        .await
        .expect("recorded");

    let report = engine.replay(4).await.expect("replay");
    assert_eq!(report.sampled, 4);
    assert_eq!(report.applied, 4);
    let entry = engine
        .store()
        .entry_required("check_job", &ctx)
        .expect("entry");
    assert_eq!(entry.visit_count, 5);
    assert_eq!(
        engine.metrics_summary(metric_names::REPLAY_TD_ERROR).count,
        4
    );
}

#[tokio::test]
async fn test_scheduled_replay_runs_every_n_updates() {
    let config = EngineConfig {
        replay_every: 2,
        batch_size: 4,
        ..test_config()
    };
    let engine = engine_with(config, Arc::new(LocalPolicyBackend::in_memory())).await;
    let ctx = engine.fingerprint("scenario", None, 0);
    let outcome = ExecutionOutcome::new("plan", true, 0.0, None).expect("outcome");
    for _ in 0..2 {
        engine
            .record_outcome(&ctx, &outcome, None)
            .await
            .expect("recorded");
    }
    let entry = engine.store().entry_required("plan", &ctx).expect("entry");
    assert_eq!(entry.visit_count, 6);
    assert_eq!(
        engine.metrics_summary(metric_names::REPLAY_TD_ERROR).count,
        4
    );
}

#[tokio::test]
async fn test_select_uses_default_strategy_and_tracks_exploration() {
    let config = EngineConfig {
        exploration_rate: 0.0,
        min_exploration_rate: 0.0,
        default_strategy: SelectionStrategy::EpsilonGreedy,
        ..test_config()
    };
    let engine = engine_with(config, Arc::new(LocalPolicyBackend::in_memory())).await;
    let ctx = engine.fingerprint("entity hierarchy", None, 0);
    engine.upsert_policy("walk", &ctx, 3.0).await.expect("upsert");

    for _ in 0..10 {
        let selection = engine
            .select(&ctx, &actions(&["list", "walk"]), None)
            .expect("select");
        assert_eq!(selection.action_id, "walk");
        assert!(!selection.was_exploration);
    }
    assert_eq!(
        engine.metrics_summary(metric_names::EXPLORATION_RATE).count,
        10
    );
    assert_eq!(engine.exploration_stats().total_selections, 10);
    engine.reset_exploration();
    assert_eq!(engine.exploration_stats().total_selections, 0);

    let ucb = engine
        .select(&ctx, &actions(&["list", "walk"]), Some(SelectionStrategy::Ucb))
        .expect("select");
    assert_eq!(ucb.action_id, "walk");
}

#[tokio::test]
async fn test_outcome_log_feeds_efficiency_bonus() {
    let log = Arc::new(InMemoryOutcomeLog::new());
    let engine = PolicyEngine::open(
        test_config(),
        Arc::new(LocalPolicyBackend::in_memory()),
        log.clone(),
    )
    .await
    .expect("open");
    log.record(&ExecutionOutcome::new("fetch", true, 1000.0, None).expect("outcome"));

    let ctx = engine.fingerprint("retrieve", None, 0);
    let fast = ExecutionOutcome::new("fetch", true, 500.0, None).expect("outcome");
    let recorded = engine
        .record_outcome(&ctx, &fast, None)
        .await
        .expect("recorded");
    assert!((recorded.breakdown.efficiency_bonus - 2.0).abs() < 1e-9);
    assert!((recorded.reward - 11.95).abs() < 1e-9);
}

#[tokio::test]
async fn test_catalog_and_invalid_config() {
    let catalog = Arc::new(StaticActionCatalog::new(actions(&["a", "b"])));
    catalog.set_call_site("export", actions(&["export_csv"]));
    let engine = engine_with(test_config(), Arc::new(LocalPolicyBackend::in_memory()))
        .await
        .with_catalog(catalog);
    assert_eq!(engine.candidates_for("export"), actions(&["export_csv"]));
    assert_eq!(engine.candidates_for("other"), actions(&["a", "b"]));

    let bad = EngineConfig {
        learning_rate: 2.0,
        ..test_config()
    };
    let opened = PolicyEngine::open(
        bad,
        Arc::new(LocalPolicyBackend::in_memory()),
        Arc::new(NoOutcomeMetrics),
    )
    .await;
    assert!(matches!(opened, Err(PolicyError::InvalidInput(_))));
}

#[tokio::test]
async fn test_shutdown_flushes_file_backend() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(LocalPolicyBackend::open(dir.path(), "policy").expect("open"));
    let engine = engine_with(test_config(), backend.clone()).await;
    let ctx = engine.fingerprint("report", None, 0);
    engine.upsert_policy("render", &ctx, 1.0).await.expect("upsert");
    engine.shutdown().await.expect("shutdown");

    assert!(dir.path().join("policy.policy.json").exists());
    assert!(dir.path().join("policy.episodes.json").exists());
    assert!(dir.path().join("policy.metrics.json").exists());
}

#[tokio::test]
async fn test_zero_epsilon_with_default_floor_never_explores() {
    let config = EngineConfig {
        exploration_rate: 0.0,
        default_strategy: SelectionStrategy::EpsilonGreedy,
        ..test_config()
    };
    assert!((config.min_exploration_rate - 0.01).abs() < 1e-12);
    let engine = engine_with(config, Arc::new(LocalPolicyBackend::in_memory())).await;
    let ctx = engine.fingerprint("entity hierarchy", None, 0);
    engine.upsert_policy("walk", &ctx, 3.0).await.expect("upsert");

    let candidates = actions(&["list", "walk", "tree"]);
    for _ in 0..2000 {
        let selection = engine.select(&ctx, &candidates, None).expect("select");
        assert!(!selection.was_exploration);
        assert_eq!(selection.action_id, "walk");
    }
    let stats = engine.exploration_stats();
    assert_eq!(stats.total_selections, 2000);
    assert_eq!(stats.action_counts.get("walk"), Some(&2000));
    assert!(stats.exploration_rate.abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_engines_sharing_a_backend_converge_within_cache_ttl() {
    let backend: Arc<dyn PolicyBackend> = Arc::new(LocalPolicyBackend::in_memory());
    let config = EngineConfig {
        cache_ttl: Duration::from_millis(50),
        ..test_config()
    };
    let writer = engine_with(config.clone(), Arc::clone(&backend)).await;
    let reader = engine_with(config, Arc::clone(&backend)).await;
    let ctx = writer.fingerprint("export report", None, 0);
    assert!(reader.store().read("export_report", &ctx).abs() < f64::EPSILON);

    writer
        .upsert_policy("export_report", &ctx, 10.0)
        .await
        .expect("upsert");

    // The reader never writes; only its refresh task can pick the row up.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while reader.store().read("export_report", &ctx).abs() < f64::EPSILON {
        assert!(
            tokio::time::Instant::now() < deadline,
            "reader cache never refreshed"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!((reader.store().read("export_report", &ctx) - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_metrics_persist_with_metadata_and_query_by_window() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(LocalPolicyBackend::open(dir.path(), "policy").expect("open"));
    let config = EngineConfig {
        metrics_flush_threshold: 0,
        ..test_config()
    };
    let engine = engine_with(config.clone(), backend.clone()).await;
    let ctx = engine.fingerprint("retrieve account balance", None, 0);
    for latency in [100.0, 200.0, 300.0] {
        let outcome = ExecutionOutcome::new("get_balance", true, latency, None).expect("outcome");
        engine
            .record_outcome(&ctx, &outcome, None)
            .await
            .expect("recorded");
    }
    engine
        .log_episode("s-1", actions(&["login", "get_balance"]), 7.0, EpisodeOutcome::Success)
        .await
        .expect("logged");

    // Pending points are visible before any flush.
    let rewards = engine
        .recent_metrics(Some(metric_names::REWARD), Duration::from_secs(60), 10)
        .await
        .expect("recent");
    assert_eq!(rewards.len(), 3);
    assert!(backend.load_metrics().await.expect("load").is_empty());

    // reward + td_error per outcome, episode reward + length per episode.
    assert_eq!(engine.flush_metrics().await.expect("flush"), 8);
    assert_eq!(engine.flush_metrics().await.expect("flush"), 0);
    assert_eq!(backend.load_metrics().await.expect("load").len(), 8);

    let rewards = engine
        .recent_metrics(Some(metric_names::REWARD), Duration::from_secs(60), 2)
        .await
        .expect("recent");
    assert_eq!(rewards.len(), 2);
    assert!(rewards[0].recorded_at >= rewards[1].recorded_at);
    assert_eq!(rewards[0].metadata["action_id"], "get_balance");
    assert_eq!(rewards[0].metadata["success"], true);

    let episode_points = engine
        .recent_metrics(Some(metric_names::EPISODE_LENGTH), Duration::from_secs(60), 10)
        .await
        .expect("recent");
    assert_eq!(episode_points.len(), 1);
    assert!((episode_points[0].value - 2.0).abs() < 1e-9);
    assert_eq!(episode_points[0].metadata["session_id"], "s-1");

    tokio::time::sleep(Duration::from_millis(20)).await;
    let none_recent = engine
        .recent_metrics(None, Duration::from_millis(5), 10)
        .await
        .expect("recent");
    assert!(none_recent.is_empty());
    engine.shutdown().await.expect("shutdown");

    let reopened_backend = LocalPolicyBackend::open(dir.path(), "policy").expect("reopen");
    let reopened = engine_with(config, Arc::new(reopened_backend)).await;
    let all = reopened
        .recent_metrics(None, Duration::from_secs(60), 100)
        .await
        .expect("recent");
    assert_eq!(all.len(), 8);
}

#[tokio::test]
async fn test_metrics_flush_threshold_and_outage_keep_points() {
    let backend = FlakyBackend::new();
    let config = EngineConfig {
        metrics_flush_threshold: 2,
        ..test_config()
    };
    let engine = engine_with(config, backend.clone()).await;
    let ctx = engine.fingerprint("import journal", None, 0);

    // One td_error point per upsert; the second reaches the threshold.
    engine.upsert_policy("import", &ctx, 1.0).await.expect("upsert");
    assert!(backend.load_metrics().await.expect("load").is_empty());
    engine.upsert_policy("import", &ctx, 1.0).await.expect("upsert");
    assert_eq!(backend.load_metrics().await.expect("load").len(), 2);

    engine.upsert_policy("import", &ctx, 1.0).await.expect("upsert");
    backend.set_down(true);
    assert!(
        engine
            .flush_metrics()
            .await
            .expect_err("backend is down")
            .is_persistence_unavailable()
    );
    backend.set_down(false);
    assert_eq!(engine.flush_metrics().await.expect("flush"), 1);
    assert_eq!(backend.load_metrics().await.expect("load").len(), 3);
}

#[tokio::test]
async fn test_lost_reply_retry_does_not_double_count() {
    let backend = FlakyBackend::new();
    let engine = engine_with(test_config(), backend.clone()).await;
    let ctx = engine.fingerprint("export report", None, 0);

    backend.lose_replies(2);
    let update = engine
        .upsert_policy("export_report", &ctx, 10.0)
        .await
        .expect("third attempt gets the stored reply");
    assert_eq!(backend.upsert_attempts(), 3);
    assert_eq!(update.entry.visit_count, 1);
    assert!((update.new_value - 1.0).abs() < 1e-9);

    backend.lose_replies(1);
    engine
        .log_episode("s-1", actions(&["export_report"]), 10.0, EpisodeOutcome::Success)
        .await
        .expect("retried append");
    assert_eq!(backend.load_episodes().await.expect("episodes").len(), 1);
    assert_eq!(engine.learning_stats().episodes, 1);
}
