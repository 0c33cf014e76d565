//! Property tests for attempt lineage and enum column encodings.

use std::{collections::HashSet, str::FromStr, time::Duration};

use chrono::{TimeZone, Utc};
use hookline_core::{
    Attempt, AttemptErrorCode, AttemptStatus, Clock, Endpoint, EndpointId, EndpointRetry, Event,
    EventId, HttpMethod, RetryStrategy, TestClock, TriggerMode, WorkspaceId,
};
use proptest::prelude::*;

fn lineage_root() -> Attempt {
    let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    let workspace_id = WorkspaceId::new();
    let endpoint = Endpoint {
        id: EndpointId::new(),
        workspace_id,
        name: Some("orders".to_string()),
        url: "https://example.com/hooks".to_string(),
        method: HttpMethod::Post,
        headers: Default::default(),
        timeout_ms: 5_000,
        enabled: true,
        retry: EndpointRetry::default(),
        created_at: now,
        updated_at: now,
    };
    let event = Event { id: EventId::new(), workspace_id, data: b"{}".to_vec(), created_at: now };
    Attempt::first(&event, &endpoint, now)
}

proptest! {
    #[test]
    fn successor_chain_is_deterministic_and_unique(depth in 1usize..32) {
        let root = lineage_root();
        let now = root.created_at;

        let mut ids = HashSet::from([root.id]);
        let mut current = root.clone();
        for expected in 2..=depth + 1 {
            let next = current.successor(now, now);
            prop_assert_eq!(next.attempt_number as usize, expected);
            prop_assert_eq!(next.id, current.successor(now, now).id);
            prop_assert_eq!(next.event_id, root.event_id);
            prop_assert_eq!(next.endpoint_id, root.endpoint_id);
            prop_assert_eq!(next.status, AttemptStatus::Init);
            prop_assert_eq!(next.trigger_mode, TriggerMode::Automatic);
            prop_assert!(ids.insert(next.id));
            current = next;
        }
    }

    #[test]
    fn test_clock_moves_both_time_sources(steps in prop::collection::vec(0u64..10_000, 1..20)) {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = TestClock::starting_at(start);
        let total: u64 = steps.iter().sum();
        for step in &steps {
            clock.advance(Duration::from_millis(*step));
        }

        prop_assert_eq!(clock.elapsed(), Duration::from_millis(total));
        prop_assert_eq!(
            clock.now_utc(),
            start + chrono::Duration::milliseconds(i64::try_from(total).unwrap())
        );
    }
}

#[test]
fn text_columns_parse_their_own_names() {
    for status in [
        AttemptStatus::Init,
        AttemptStatus::Queued,
        AttemptStatus::Success,
        AttemptStatus::Failure,
        AttemptStatus::Canceled,
    ] {
        assert_eq!(AttemptStatus::from_str(status.as_str()).unwrap(), status);
    }
    for code in [
        AttemptErrorCode::EndpointNotFound,
        AttemptErrorCode::EndpointDisabled,
        AttemptErrorCode::Timeout,
        AttemptErrorCode::Unknown,
    ] {
        assert_eq!(AttemptErrorCode::from_str(code.as_str()).unwrap(), code);
    }
    assert_eq!(RetryStrategy::from_str("backoff").unwrap(), RetryStrategy::Backoff);
    assert!(AttemptStatus::from_str("delivered").is_err());
}

#[test]
fn retry_config_defaults_when_fields_are_missing() {
    let retry: EndpointRetry = serde_json::from_str("{}").unwrap();
    assert_eq!(retry.strategy, RetryStrategy::Fixed);
    assert!(retry.attempts.is_empty());

    let retry: EndpointRetry =
        serde_json::from_str(r#"{"strategy":"fixed","attempts":[0,60,3600]}"#).unwrap();
    assert_eq!(retry, EndpointRetry::default());
}
