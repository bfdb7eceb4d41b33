//! End-to-end tests for the usage verifier against in-memory collaborators

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use feature_usage_limits::{
    FeatureRef, FixedClock, InMemoryCatalog, InMemoryLimitRuleRepository,
    InMemoryUsageRepository, LimitError, LimitRule, Periodicity, RepositoryError, Subject,
    UsageDeltas, UsageRecord, UsageRepository, UsageTrackingContext, UsageVerifier, Window,
};

const CATALOG: &str = r#"{
    "products": [{
        "id": "analytics",
        "features": [
            {
                "id": "reports",
                "limits": [
                    {"id": "exports", "quota": 10, "type": "CALENDAR_PERIOD", "periodicity": "MONTH"},
                    {"id": "pages", "quota": 3, "type": "CALENDAR_PERIOD", "periodicity": "DAY"}
                ]
            },
            {
                "id": "seats",
                "limits": [{"id": "members", "quota": 5, "type": "COUNT"}]
            },
            {
                "id": "api",
                "limits": [{"id": "calls", "quota": 100, "type": "SLIDING_WINDOW", "window_unit": "HOURS", "duration": 1}]
            }
        ],
        "plans": [{
            "id": "pro",
            "limit_overrides": [
                {"feature_id": "reports", "rule": {"id": "pages", "quota": 50, "type": "CALENDAR_PERIOD", "periodicity": "DAY"}}
            ]
        }]
    }]
}"#;

struct Harness {
    verifier: UsageVerifier,
    usage: Arc<InMemoryUsageRepository>,
    clock: Arc<FixedClock>,
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 2, 20, 10, 15, 33).unwrap()
}

fn harness() -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let catalog = Arc::new(InMemoryCatalog::from_json_str(CATALOG).expect("catalog parses"));
    let usage = Arc::new(InMemoryUsageRepository::new());
    let clock = Arc::new(FixedClock::new(start()));
    let verifier = UsageVerifier::builder(catalog, usage.clone())
        .limit_rules(Arc::new(InMemoryLimitRuleRepository::new()))
        .clock(clock.clone())
        .build();

    Harness {
        verifier,
        usage,
        clock,
    }
}

fn reports() -> FeatureRef {
    FeatureRef::new("analytics", "reports")
}

fn deltas(entries: &[(&str, u64)]) -> UsageDeltas {
    entries
        .iter()
        .map(|(limit_id, units)| (limit_id.to_string(), *units))
        .collect()
}

fn units_of(records: &[UsageRecord], limit_id: &str) -> Vec<u64> {
    records
        .iter()
        .filter(|record| record.limit_id == limit_id)
        .map(|record| record.units)
        .collect()
}

#[test]
fn test_record_accumulates_in_single_record() {
    let h = harness();
    let alice = Subject::user("alice");

    h.verifier
        .record_feature_usage(&reports(), &alice, &deltas(&[("exports", 5)]))
        .unwrap();
    h.verifier
        .record_feature_usage(&reports(), &alice, &deltas(&[("exports", 4)]))
        .unwrap();

    let err = h
        .verifier
        .record_feature_usage(&reports(), &alice, &deltas(&[("exports", 2)]))
        .unwrap_err();
    assert!(err.is_business());

    let records = h.usage.records(&reports(), &alice);
    assert_eq!(units_of(&records, "exports"), vec![9]);
    assert_eq!(
        h.verifier.remaining_units(&reports(), &alice).unwrap(),
        BTreeMap::from([("exports".to_string(), 1), ("pages".to_string(), 3)])
    );
}

#[test]
fn test_failed_limit_commits_nothing() {
    let h = harness();
    let alice = Subject::user("alice");

    let err = h
        .verifier
        .record_feature_usage(&reports(), &alice, &deltas(&[("exports", 1), ("pages", 4)]))
        .unwrap_err();
    match err {
        LimitError::LimitExceeded {
            limit_id,
            subject,
            quota,
            ..
        } => {
            assert_eq!(limit_id, "pages");
            assert_eq!(subject, alice);
            assert_eq!(quota, 3);
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(h.usage.commit_count(), 0);
    assert!(h.usage.records(&reports(), &alice).is_empty());
}

#[test]
fn test_reduce_never_goes_negative() {
    let h = harness();
    let alice = Subject::user("alice");

    h.verifier
        .record_feature_usage(&reports(), &alice, &deltas(&[("exports", 5)]))
        .unwrap();
    h.verifier
        .reduce_feature_usage(&reports(), &alice, &deltas(&[("exports", 8)]))
        .unwrap();

    assert_eq!(units_of(&h.usage.records(&reports(), &alice), "exports"), vec![0]);
}

#[test]
fn test_is_within_limits_does_not_persist() {
    let h = harness();
    let alice = Subject::user("alice");

    assert!(h
        .verifier
        .is_within_limits(&reports(), &alice, &deltas(&[("exports", 10), ("pages", 3)]))
        .unwrap());
    assert!(!h
        .verifier
        .is_within_limits(&reports(), &alice, &deltas(&[("exports", 10), ("pages", 4)]))
        .unwrap());
    assert_eq!(h.usage.commit_count(), 0);
}

#[test]
fn test_plan_override_raises_quota() {
    let h = harness();
    let pro = Subject::subscription("sub-9").with_plan("analytics", "pro");

    h.verifier
        .record_feature_usage(&reports(), &pro, &deltas(&[("pages", 40)]))
        .unwrap();
    let remaining = h.verifier.remaining_units(&reports(), &pro).unwrap();
    assert_eq!(remaining.get("pages"), Some(&10));
}

#[test]
fn test_subject_override_takes_effect_immediately() {
    let h = harness();
    let alice = Subject::user("alice");

    h.verifier
        .override_limit(
            &reports(),
            &alice,
            &LimitRule::calendar("pages", 1, Periodicity::Day),
        )
        .unwrap();
    assert!(h
        .verifier
        .record_feature_usage(&reports(), &alice, &deltas(&[("pages", 2)]))
        .is_err());

    assert!(h
        .verifier
        .remove_limit_override(&reports(), &alice, "pages")
        .unwrap());
    h.verifier
        .record_feature_usage(&reports(), &alice, &deltas(&[("pages", 2)]))
        .unwrap();
}

#[test]
fn test_unconfigured_limits_are_ignored() {
    let h = harness();
    let alice = Subject::user("alice");

    h.verifier
        .record_feature_usage(&reports(), &alice, &deltas(&[("downloads", 1_000)]))
        .unwrap();
    assert_eq!(h.usage.commit_count(), 0);
    assert!(h
        .verifier
        .is_within_limits(&reports(), &alice, &deltas(&[("downloads", 1_000)]))
        .unwrap());
}

#[test]
fn test_new_calendar_window_starts_fresh() {
    let h = harness();
    let alice = Subject::user("alice");

    h.verifier
        .record_feature_usage(&reports(), &alice, &deltas(&[("pages", 3)]))
        .unwrap();
    assert!(h
        .verifier
        .record_feature_usage(&reports(), &alice, &deltas(&[("pages", 1)]))
        .is_err());

    h.clock.advance(Duration::days(1));
    h.verifier
        .record_feature_usage(&reports(), &alice, &deltas(&[("pages", 1)]))
        .unwrap();

    let mut pages = units_of(&h.usage.records(&reports(), &alice), "pages");
    pages.sort_unstable();
    assert_eq!(pages, vec![1, 3]);
}

#[test]
fn test_count_limit_is_unbounded() {
    let h = harness();
    let team = Subject::group("platform");
    let seats = FeatureRef::new("analytics", "seats");

    h.verifier
        .record_feature_usage(&seats, &team, &deltas(&[("members", 3)]))
        .unwrap();
    h.clock.advance(Duration::days(400));
    h.verifier
        .record_feature_usage(&seats, &team, &deltas(&[("members", 2)]))
        .unwrap();

    let records = h.usage.records(&seats, &team);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].units, 5);
    assert_eq!(records[0].window(), Window::UNBOUNDED);
    assert_eq!(records[0].expiration_date, None);
}

#[test]
fn test_sliding_window_snapshot_tracks_clock() {
    let h = harness();
    let alice = Subject::user("alice");
    let api = FeatureRef::new("analytics", "api");

    let snapshot = h.verifier.usage_snapshot(&api, &alice).unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].window.start, Some(start() - Duration::hours(1)));
    assert_eq!(snapshot[0].window.end, Some(start()));
    assert_eq!(snapshot[0].remaining, 100);

    h.clock.advance(Duration::minutes(5));
    let snapshot = h.verifier.usage_snapshot(&api, &alice).unwrap();
    assert_eq!(
        snapshot[0].window.start,
        Some(start() + Duration::minutes(5) - Duration::hours(1))
    );
}

#[test]
fn test_sliding_window_sums_calls_within_span() {
    let h = harness();
    let alice = Subject::user("alice");
    let api = FeatureRef::new("analytics", "api");

    h.verifier
        .record_feature_usage(&api, &alice, &deltas(&[("calls", 60)]))
        .unwrap();
    h.clock.advance(Duration::seconds(1));
    h.verifier
        .record_feature_usage(&api, &alice, &deltas(&[("calls", 30)]))
        .unwrap();
    h.clock.advance(Duration::seconds(1));

    let err = h
        .verifier
        .record_feature_usage(&api, &alice, &deltas(&[("calls", 20)]))
        .unwrap_err();
    assert!(matches!(err, LimitError::LimitExceeded { current: 90, quota: 100, .. }));
    assert_eq!(units_of(&h.usage.records(&api, &alice), "calls"), vec![60, 30]);
    assert!(!h
        .verifier
        .is_within_limits(&api, &alice, &deltas(&[("calls", 11)]))
        .unwrap());

    // The first call drops out of the span, the second one is still counted.
    h.clock
        .set(start() + Duration::hours(1) + Duration::milliseconds(500));
    h.verifier
        .record_feature_usage(&api, &alice, &deltas(&[("calls", 20)]))
        .unwrap();
    assert_eq!(
        h.verifier.remaining_units(&api, &alice).unwrap(),
        BTreeMap::from([("calls".to_string(), 50)])
    );
}

#[test]
fn test_sliding_window_reduce_credits_recent_calls() {
    let h = harness();
    let alice = Subject::user("alice");
    let api = FeatureRef::new("analytics", "api");

    h.verifier
        .record_feature_usage(&api, &alice, &deltas(&[("calls", 60)]))
        .unwrap();
    h.clock.advance(Duration::seconds(1));
    h.verifier
        .record_feature_usage(&api, &alice, &deltas(&[("calls", 30)]))
        .unwrap();

    h.verifier
        .reduce_feature_usage(&api, &alice, &deltas(&[("calls", 70)]))
        .unwrap();
    let snapshot = h.verifier.usage_snapshot(&api, &alice).unwrap();
    assert_eq!(snapshot[0].used, 20);
    assert_eq!(snapshot[0].remaining, 80);
}

#[test]
fn test_override_for_undeclared_limit_is_rejected() {
    let h = harness();
    let alice = Subject::user("alice");

    let err = h
        .verifier
        .override_limit(&reports(), &alice, &LimitRule::count("ghost", 1))
        .unwrap_err();
    assert!(matches!(err, LimitError::InvalidInput(_)));
    assert!(h
        .verifier
        .resolver()
        .resolve(&reports(), "ghost", &alice)
        .unwrap()
        .is_none());
    assert_eq!(h.usage.commit_count(), 0);

    h.verifier
        .override_limit(&reports(), &alice, &LimitRule::count("exports", 1))
        .unwrap();
}

#[test]
fn test_duplicate_window_records_are_fatal() {
    let h = harness();
    let team = Subject::group("platform");
    let seats = FeatureRef::new("analytics", "seats");
    h.usage
        .insert(&seats, &team, UsageRecord::new("members", Window::UNBOUNDED, 1));
    h.usage
        .insert(&seats, &team, UsageRecord::new("members", Window::UNBOUNDED, 1));

    let err = h
        .verifier
        .record_feature_usage(&seats, &team, &deltas(&[("members", 1)]))
        .unwrap_err();
    assert!(matches!(err, LimitError::InconsistentState { matches: 2, .. }));
}

#[test]
fn test_invalid_input_fails_before_storage() {
    let h = harness();
    let alice = Subject::user("alice");

    let empty = h
        .verifier
        .record_feature_usage(&reports(), &alice, &UsageDeltas::new());
    assert!(matches!(empty, Err(LimitError::InvalidInput(_))));

    let zero = h
        .verifier
        .record_feature_usage(&reports(), &alice, &deltas(&[("exports", 0)]));
    assert!(matches!(zero, Err(LimitError::InvalidInput(_))));

    let anonymous = h
        .verifier
        .record_feature_usage(&reports(), &Subject::user(""), &deltas(&[("exports", 1)]));
    assert!(matches!(anonymous, Err(LimitError::InvalidInput(_))));

    let missing = h.verifier.record_feature_usage(
        &FeatureRef::new("analytics", "unknown"),
        &alice,
        &deltas(&[("exports", 1)]),
    );
    assert!(matches!(missing, Err(LimitError::FeatureNotFound(_))));
    assert_eq!(h.usage.commit_count(), 0);
}

#[test]
fn test_purge_expired_removes_old_windows() {
    let h = harness();
    let alice = Subject::user("alice");
    h.verifier
        .record_feature_usage(&reports(), &alice, &deltas(&[("exports", 1), ("pages", 1)]))
        .unwrap();

    let removed = h
        .verifier
        .purge_expired(Utc.with_ymd_and_hms(2024, 5, 22, 0, 0, 0).unwrap())
        .unwrap();
    assert_eq!(removed, 1);
    assert_eq!(
        units_of(&h.usage.records(&reports(), &alice), "exports"),
        vec![1]
    );
}

struct UnavailableRepository;

impl UsageRepository for UnavailableRepository {
    fn load_usage_data(&self, _context: &mut UsageTrackingContext) -> Result<(), RepositoryError> {
        Err(RepositoryError::new("connection refused"))
    }

    fn update_usage_records(
        &self,
        _context: &UsageTrackingContext,
    ) -> Result<usize, RepositoryError> {
        Err(RepositoryError::new("connection refused"))
    }

    fn delete_old_records(&self, _as_of: DateTime<Utc>) -> Result<usize, RepositoryError> {
        Err(RepositoryError::new("connection refused"))
    }
}

#[test]
fn test_repository_errors_carry_operation() {
    let catalog = Arc::new(InMemoryCatalog::from_json_str(CATALOG).unwrap());
    let verifier = UsageVerifier::builder(catalog, Arc::new(UnavailableRepository)).build();

    let err = verifier
        .record_feature_usage(&reports(), &Subject::user("alice"), &deltas(&[("exports", 1)]))
        .unwrap_err();
    match err {
        LimitError::Repository {
            operation,
            limit_id,
            ..
        } => {
            assert_eq!(operation, "load usage data");
            assert_eq!(limit_id.as_deref(), Some("exports"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

/// Loads nothing and refuses every write.
struct ReadOnlyRepository;

impl UsageRepository for ReadOnlyRepository {
    fn load_usage_data(&self, _context: &mut UsageTrackingContext) -> Result<(), RepositoryError> {
        Ok(())
    }

    fn update_usage_records(
        &self,
        _context: &UsageTrackingContext,
    ) -> Result<usize, RepositoryError> {
        Err(RepositoryError::new("database is read-only"))
    }

    fn delete_old_records(&self, _as_of: DateTime<Utc>) -> Result<usize, RepositoryError> {
        Ok(0)
    }
}

#[test]
fn test_commit_errors_name_the_batch_limits() {
    let catalog = Arc::new(InMemoryCatalog::from_json_str(CATALOG).unwrap());
    let verifier = UsageVerifier::builder(catalog, Arc::new(ReadOnlyRepository)).build();

    let err = verifier
        .record_feature_usage(
            &reports(),
            &Subject::user("alice"),
            &deltas(&[("exports", 1), ("pages", 1)]),
        )
        .unwrap_err();
    match err {
        LimitError::Repository {
            operation,
            limit_id,
            ..
        } => {
            assert_eq!(operation, "update usage records");
            assert_eq!(limit_id.as_deref(), Some("exports,pages"));
        }
        other => panic!("unexpected error: {other}"),
    }
}
