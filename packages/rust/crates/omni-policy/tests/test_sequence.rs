#![allow(missing_docs)]

mod common;

use common::actions;
use omni_policy::{Episode, EpisodeOutcome, SequenceLearner};

fn episode(ids: &[&str], reward: f64, outcome: EpisodeOutcome) -> Episode {
    Episode::new("session", actions(ids), reward, outcome).expect("episode")
}

#[test]
fn test_repeated_success_ranks_continuation_first() {
    let learner = SequenceLearner::new(3).expect("learner");
    for _ in 0..5 {
        learner.observe(&episode(&["A", "B", "C"], 12.0, EpisodeOutcome::Success));
    }

    let suggestions = learner.recommend(&actions(&["A", "B"]), &actions(&["C", "D", "E"]), 5);
    assert_eq!(suggestions.len(), 1);
    let first = &suggestions[0];
    assert_eq!(first.action_id, "C");
    assert_eq!(first.occurrences, 5);
    assert!((first.avg_reward - 12.0).abs() < 1e-9);
    assert_eq!(first.matched_prefix, actions(&["A", "B"]));
    assert!((first.score - 60.0).abs() < 1e-9);
    assert!(first.rationale.contains("A -> B"), "{}", first.rationale);
    assert!(first.rationale.contains("5x"), "{}", first.rationale);
    assert!(first.rationale.contains("12.00"), "{}", first.rationale);
}

#[test]
fn test_empty_recent_yields_nothing() {
    let learner = SequenceLearner::new(3).expect("learner");
    learner.observe(&episode(&["A", "B"], 1.0, EpisodeOutcome::Success));
    assert!(learner.recommend(&[], &actions(&["B"]), 5).is_empty());
}

#[test]
fn test_backs_off_to_shorter_suffix() {
    let learner = SequenceLearner::new(3).expect("learner");
    learner.observe(&episode(&["X", "B", "C"], 10.0, EpisodeOutcome::Success));
    learner.observe(&episode(&["A", "B", "D"], 10.0, EpisodeOutcome::Success));

    let suggestions = learner.recommend(&actions(&["A", "B"]), &actions(&["C", "D"]), 5);
    let order: Vec<&str> = suggestions.iter().map(|s| s.action_id.as_str()).collect();
    assert_eq!(order, vec!["D", "C"]);
    assert_eq!(suggestions[0].matched_prefix, actions(&["A", "B"]));
    assert!((suggestions[0].score - 10.0).abs() < 1e-9);
    assert_eq!(suggestions[1].matched_prefix, actions(&["B"]));
    assert!((suggestions[1].score - 5.0).abs() < 1e-9);
}

#[test]
fn test_only_successful_episodes_are_learned() {
    let learner = SequenceLearner::new(3).expect("learner");
    learner.observe(&episode(&["A", "B"], 50.0, EpisodeOutcome::Failure));
    learner.observe(&episode(&["A", "B"], 50.0, EpisodeOutcome::Partial));
    assert!(learner.is_empty());
    assert!(learner.recommend(&actions(&["A"]), &actions(&["B"]), 5).is_empty());
}

#[test]
fn test_average_reward_and_top_k() {
    let learner = SequenceLearner::new(2).expect("learner");
    learner.observe(&episode(&["A", "B"], 10.0, EpisodeOutcome::Success));
    learner.observe(&episode(&["A", "B"], 20.0, EpisodeOutcome::Success));
    learner.observe(&episode(&["A", "C"], 100.0, EpisodeOutcome::Success));
    learner.observe(&episode(&["A", "D"], 1.0, EpisodeOutcome::Success));

    let suggestions = learner.recommend(&actions(&["A"]), &actions(&["B", "C", "D"]), 2);
    assert_eq!(suggestions.len(), 2);
    assert_eq!(suggestions[0].action_id, "C");
    assert_eq!(suggestions[1].action_id, "B");
    assert_eq!(suggestions[1].occurrences, 2);
    assert!((suggestions[1].avg_reward - 15.0).abs() < 1e-9);
}

#[test]
fn test_patterns_and_rebuild() {
    let learner = SequenceLearner::new(3).expect("learner");
    let history = vec![
        episode(&["A", "B", "C"], 1.0, EpisodeOutcome::Success),
        episode(&["A", "B"], 3.0, EpisodeOutcome::Success),
        episode(&["Z", "Y"], 3.0, EpisodeOutcome::Failure),
    ];
    learner.rebuild(&history);

    let patterns = learner.patterns();
    assert_eq!(patterns.len(), 3);
    assert_eq!(patterns[0].actions, actions(&["A", "B"]));
    assert_eq!(patterns[0].occurrences, 2);
    assert!((patterns[0].avg_reward - 2.0).abs() < 1e-9);

    learner.rebuild(&[]);
    assert!(learner.is_empty());
    assert!(SequenceLearner::new(1).is_err());
}
