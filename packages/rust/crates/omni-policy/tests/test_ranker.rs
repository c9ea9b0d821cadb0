#![allow(missing_docs)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{actions, context, fast_retry};
use omni_policy::{
    ExecutionOutcome, InMemoryOutcomeLog, LocalPolicyBackend, PolicyError, PolicyStore,
    RecommendationRanker,
};

fn setup() -> (Arc<PolicyStore>, Arc<InMemoryOutcomeLog>, RecommendationRanker) {
    let store = Arc::new(PolicyStore::new(
        Arc::new(LocalPolicyBackend::in_memory()),
        1.0,
        Duration::from_secs(30),
        fast_retry(1),
    ));
    let log = Arc::new(InMemoryOutcomeLog::new());
    let ranker = RecommendationRanker::new(Arc::clone(&store), log.clone(), 5);
    (store, log, ranker)
}

fn record(log: &InMemoryOutcomeLog, action: &str, success: bool, latency: f64, rating: u8, n: usize) {
    for _ in 0..n {
        log.record(&ExecutionOutcome::new(action, success, latency, Some(rating)).expect("outcome"));
    }
}

#[test]
fn test_unmeasured_candidate_gets_baseline() {
    let (_store, _log, ranker) = setup();
    let ranked = ranker
        .recommend(&context("status"), &actions(&["fresh"]))
        .expect("recommend");
    assert_eq!(ranked.len(), 1);
    assert!((ranked[0].confidence - 0.5).abs() < 1e-9);
    assert_eq!(ranked[0].rationale, "baseline recommendation");
    assert!((ranked[0].metrics.success_rate - 0.5).abs() < 1e-9);
    assert_eq!(ranked[0].metrics.total_calls, 0);
}

#[test]
fn test_factors_fire_and_rank() {
    let (_store, log, ranker) = setup();
    record(&log, "reliable", true, 200.0, 5, 5);
    record(&log, "flaky", false, 3000.0, 1, 2);

    let ranked = ranker
        .recommend(&context("data"), &actions(&["flaky", "unknown", "reliable"]))
        .expect("recommend");
    let order: Vec<&str> = ranked.iter().map(|r| r.action_id.as_str()).collect();
    assert_eq!(order, vec!["reliable", "unknown", "flaky"]);

    assert!((ranked[0].confidence - 1.0).abs() < 1e-9);
    assert_eq!(
        ranked[0].rationale,
        "high success rate, high user rating, fast execution, sufficient samples"
    );
    assert!((ranked[2].confidence - 0.15).abs() < 1e-9);
    assert_eq!(ranked[2].rationale, "low success rate, low user rating");
}

#[tokio::test]
async fn test_learned_value_moves_confidence_both_ways() {
    let (store, _log, ranker) = setup();
    let ctx = context("journal");
    store.upsert("liked", &ctx, 5.0).await.expect("upsert");
    store.upsert("disliked", &ctx, -5.0).await.expect("upsert");

    let ranked = ranker
        .recommend(&ctx, &actions(&["disliked", "neutral", "liked"]))
        .expect("recommend");
    assert_eq!(ranked[0].action_id, "liked");
    assert_eq!(ranked[0].rationale, "learned preference");
    assert!((ranked[0].metrics.policy_value - 5.0).abs() < 1e-9);
    assert_eq!(ranked[2].action_id, "disliked");
    assert_eq!(ranked[2].rationale, "learned avoidance");
    let expected = 0.5 + 0.2 * 1.0_f64.tanh();
    assert!((ranked[0].confidence - (expected * 1000.0).round() / 1000.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_recommend_is_reproducible_and_stable() {
    let (store, log, ranker) = setup();
    let ctx = context("balance");
    record(&log, "b", true, 500.0, 4, 3);
    store.upsert("c", &ctx, 1.0).await.expect("upsert");
    let candidates = actions(&["a", "b", "c", "d"]);

    let first = ranker.recommend(&ctx, &candidates).expect("recommend");
    for _ in 0..10 {
        assert_eq!(ranker.recommend(&ctx, &candidates).expect("recommend"), first);
    }
    // "a" and "d" tie on the baseline and keep input order.
    let a = first.iter().position(|r| r.action_id == "a").expect("a");
    let d = first.iter().position(|r| r.action_id == "d").expect("d");
    assert!(a < d);
}

#[tokio::test]
async fn test_confidence_is_logistic_of_value() {
    let (store, _log, ranker) = setup();
    let ctx = context("currency");
    assert!((ranker.confidence("none", &ctx) - 0.5).abs() < 1e-12);
    store.upsert("up", &ctx, 3.0).await.expect("upsert");
    let expected = 1.0 / (1.0 + (-1.0_f64).exp());
    assert!((ranker.confidence("up", &ctx) - expected).abs() < 1e-12);
}

#[test]
fn test_empty_candidates_rejected() {
    let (_store, _log, ranker) = setup();
    assert!(matches!(
        ranker.recommend(&context("x"), &[]),
        Err(PolicyError::InvalidInput(_))
    ));
}
