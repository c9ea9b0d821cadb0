#![allow(missing_docs)]

use std::collections::BTreeMap;

use omni_policy::{LearningMetrics, metric_names};

#[test]
fn test_unknown_metric_summarizes_to_zero() {
    let metrics = LearningMetrics::default();
    let summary = metrics.summary("nope");
    assert_eq!(summary.count, 0);
    assert!(summary.mean.abs() < f64::EPSILON);
}

#[test]
fn test_summary_statistics() {
    let metrics = LearningMetrics::new(10);
    for value in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
        metrics.record(metric_names::REWARD, value);
    }
    let summary = metrics.summary(metric_names::REWARD);
    assert_eq!(summary.count, 8);
    assert!((summary.mean - 5.0).abs() < 1e-12);
    assert!((summary.std - 2.0).abs() < 1e-12);
    assert!((summary.min - 2.0).abs() < 1e-12);
    assert!((summary.max - 9.0).abs() < 1e-12);
    assert!((summary.latest - 9.0).abs() < 1e-12);
}

#[test]
fn test_window_keeps_most_recent_values() {
    let metrics = LearningMetrics::new(3);
    for value in 1..=5 {
        metrics.record(metric_names::TD_ERROR, f64::from(value));
    }
    let summary = metrics.summary(metric_names::TD_ERROR);
    assert_eq!(summary.count, 3);
    assert!((summary.min - 3.0).abs() < 1e-12);
    assert!((summary.mean - 4.0).abs() < 1e-12);
}

#[test]
fn test_non_finite_values_are_dropped() {
    let metrics = LearningMetrics::new(3);
    metrics.record("x", f64::NAN);
    metrics.record("x", f64::INFINITY);
    assert_eq!(metrics.summary("x").count, 0);
    metrics.record("x", 1.5);
    assert_eq!(metrics.summaries().len(), 1);
}

#[test]
fn test_pending_points_drain_and_restore_in_order() {
    let metrics = LearningMetrics::new(10);
    metrics.record("reward", 1.0);
    metrics.record_with_metadata(
        "reward",
        2.0,
        BTreeMap::from([("action_id".to_string(), serde_json::json!("fetch"))]),
    );
    metrics.record("reward", f64::NAN);
    assert_eq!(metrics.pending_len(), 2);

    let taken = metrics.take_pending();
    assert_eq!(metrics.pending_len(), 0);
    assert_eq!(taken[1].metadata["action_id"], "fetch");
    assert!(taken[0].metadata.is_empty());

    metrics.record("reward", 3.0);
    metrics.restore_pending(taken);
    let values: Vec<f64> = metrics.pending().iter().map(|point| point.value).collect();
    assert_eq!(values, vec![1.0, 2.0, 3.0]);
    // The rolling window is unaffected by draining.
    assert_eq!(metrics.summary("reward").count, 3);
}
