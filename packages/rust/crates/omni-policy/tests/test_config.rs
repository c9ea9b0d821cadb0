#![allow(missing_docs)]

use std::time::Duration;

use omni_policy::{
    EngineConfig, PolicyError, SelectionStrategy, load_policy_settings_from_paths,
};

#[test]
fn test_default_config_is_valid() {
    let config = EngineConfig::default();
    config.validate().expect("defaults validate");
    assert!((config.exploration_rate - 0.1).abs() < f64::EPSILON);
    assert!((config.learning_rate - 0.1).abs() < f64::EPSILON);
    assert!((config.discount_factor - 0.9).abs() < f64::EPSILON);
    assert_eq!(config.min_samples, 5);
    assert_eq!(config.replay_capacity, 10_000);
    assert_eq!(config.batch_size, 32);
    assert_eq!(config.replay_every, 0);
    assert_eq!(config.max_ngram, 3);
    assert_eq!(config.retry.attempts, 3);
    assert_eq!(config.default_strategy, SelectionStrategy::EpsilonGreedy);
    assert_eq!(config.vocabulary.len(), 19);
}

#[test]
fn test_validate_rejects_out_of_range_values() {
    let cases: [fn(&mut EngineConfig); 8] = [
        |c| c.exploration_rate = 1.5,
        |c| c.learning_rate = 0.0,
        |c| c.exploration_decay = 0.0,
        |c| c.ucb_c = -1.0,
        |c| c.replay_capacity = 0,
        |c| c.max_ngram = 1,
        |c| c.retry.attempts = 0,
        |c| c.retry.attempt_timeout = Duration::ZERO,
    ];
    for mutate in cases {
        let mut config = EngineConfig::default();
        mutate(&mut config);
        assert!(matches!(config.validate(), Err(PolicyError::InvalidInput(_))));
    }
}

#[test]
fn test_user_settings_override_system_settings() {
    let dir = tempfile::tempdir().expect("tempdir");
    let system = dir.path().join("system.yaml");
    let user = dir.path().join("user.yaml");
    std::fs::write(
        &system,
        "learning:\n  exploration_rate: 0.3\n  learning_rate: 0.2\n  strategy: ucb\npersistence:\n  backend: local\n  timeout_ms: 900\n",
    )
    .expect("write system");
    std::fs::write(
        &user,
        "learning:\n  exploration_rate: 0.05\n  metrics_flush_threshold: 0\npersistence:\n  table_name: custom\n",
    )
    .expect("write user");

    let settings = load_policy_settings_from_paths(&system, &user);
    let config = EngineConfig::from_settings(&settings);
    assert!((config.exploration_rate - 0.05).abs() < f64::EPSILON);
    assert!((config.learning_rate - 0.2).abs() < f64::EPSILON);
    assert_eq!(config.default_strategy, SelectionStrategy::Ucb);
    assert_eq!(config.retry.attempt_timeout, Duration::from_millis(900));
    assert_eq!(settings.backend_name(), "local");
    assert_eq!(settings.table_name(), "custom");
    assert_eq!(config.metrics_flush_threshold, 0);
}

#[test]
fn test_invalid_settings_file_is_ignored() {
    let dir = tempfile::tempdir().expect("tempdir");
    let system = dir.path().join("system.yaml");
    let user = dir.path().join("user.yaml");
    std::fs::write(&system, "learning:\n  min_samples: 9\n").expect("write system");
    std::fs::write(&user, "learning: [not, a, map\n").expect("write user");

    let settings = load_policy_settings_from_paths(&system, &user);
    assert_eq!(EngineConfig::from_settings(&settings).min_samples, 9);
}

#[test]
fn test_missing_settings_files_fall_back_to_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = load_policy_settings_from_paths(
        &dir.path().join("absent-system.yaml"),
        &dir.path().join("absent-user.yaml"),
    );
    assert_eq!(settings.backend_name(), "local");
    assert_eq!(settings.table_name(), "policy");
    assert_eq!(EngineConfig::from_settings(&settings), EngineConfig::default());
}
