#![allow(missing_docs)]

use omni_policy::{PayloadKind, payload_schema};

#[test]
fn test_every_payload_schema_generates() {
    for kind in PayloadKind::ALL {
        let schema = payload_schema(kind).expect("schema renders");
        assert!(schema.get("title").is_some(), "{kind} schema has no title");
        assert!(schema.get("properties").is_some(), "{kind} schema has no properties");
    }
}

#[test]
fn test_outcome_schema_lists_required_fields() {
    let schema = payload_schema(PayloadKind::ExecutionOutcome).expect("schema");
    let required: Vec<&str> = schema["required"]
        .as_array()
        .expect("required array")
        .iter()
        .filter_map(|value| value.as_str())
        .collect();
    for field in ["action_id", "success", "latency_ms", "timestamp"] {
        assert!(required.contains(&field), "{field} not required");
    }
    assert!(!required.contains(&"user_rating"));
}

#[test]
fn test_payload_kind_parses_names() {
    assert_eq!(
        "sequence-recommendation".parse::<PayloadKind>().ok(),
        Some(PayloadKind::SequenceRecommendation)
    );
    assert_eq!(
        "metric_point".parse::<PayloadKind>().ok(),
        Some(PayloadKind::MetricPoint)
    );
    assert!("nope".parse::<PayloadKind>().is_err());
}
