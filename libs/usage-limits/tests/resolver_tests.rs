//! Limit precedence tests for the resolver

use std::io::Write;
use std::sync::Arc;

use feature_usage_limits::{
    FeatureRef, InMemoryCatalog, InMemoryLimitRuleRepository, LimitError, LimitResolver,
    LimitRule, LimitRuleRepository, Periodicity, RuleSource, Subject,
};
use tempfile::NamedTempFile;

const CATALOG: &str = r#"{
    "products": [{
        "id": "storage",
        "name": "Object Storage",
        "features": [{
            "id": "uploads",
            "limits": [
                {"id": "files", "quota": 100, "type": "CALENDAR_PERIOD", "periodicity": "DAY"},
                {"id": "bytes", "quota": 1024, "unit": "MB", "type": "CALENDAR_PERIOD", "periodicity": "MONTH"}
            ]
        }],
        "plans": [
            {
                "id": "business",
                "limit_overrides": [
                    {"feature_id": "uploads", "rule": {"id": "files", "quota": 500, "type": "CALENDAR_PERIOD", "periodicity": "DAY"}}
                ]
            },
            {"id": "starter"}
        ]
    }]
}"#;

fn feature() -> FeatureRef {
    FeatureRef::new("storage", "uploads")
}

fn resolver() -> (LimitResolver, Arc<InMemoryLimitRuleRepository>) {
    let catalog = Arc::new(InMemoryCatalog::from_json_str(CATALOG).expect("catalog parses"));
    let overrides = Arc::new(InMemoryLimitRuleRepository::new());
    (
        LimitResolver::with_overrides(catalog, overrides.clone()),
        overrides,
    )
}

#[test]
fn test_global_rule_applies_without_plan() {
    let (resolver, _) = resolver();
    let (rule, source) = resolver
        .resolve_with_source(&feature(), "files", &Subject::user("alice"))
        .unwrap()
        .expect("global rule");
    assert_eq!(rule.quota, 100);
    assert_eq!(source, RuleSource::Global);
}

#[test]
fn test_subject_override_beats_plan_beats_global() {
    let (resolver, overrides) = resolver();
    let subject = Subject::subscription("sub-1").with_plan("storage", "business");

    let rule = resolver.resolve(&feature(), "files", &subject).unwrap().unwrap();
    assert_eq!(rule.quota, 500);

    overrides
        .update(
            &feature(),
            &LimitRule::calendar("files", 5, Periodicity::Day),
            &subject,
        )
        .unwrap();
    let (rule, source) = resolver
        .resolve_with_source(&feature(), "files", &subject)
        .unwrap()
        .unwrap();
    assert_eq!(rule.quota, 5);
    assert_eq!(source, RuleSource::SubjectOverride);

    overrides.delete(&feature(), "files", &subject).unwrap();
    let (rule, source) = resolver
        .resolve_with_source(&feature(), "files", &subject)
        .unwrap()
        .unwrap();
    assert_eq!(rule.quota, 500);
    assert_eq!(source, RuleSource::PlanOverride);
}

#[test]
fn test_plan_without_override_falls_through_to_global() {
    let (resolver, _) = resolver();
    let starter = Subject::group("eng").with_plan("storage", "starter");
    assert_eq!(
        resolver
            .resolve(&feature(), "files", &starter)
            .unwrap()
            .map(|r| r.quota),
        Some(100)
    );

    let unknown_plan = Subject::group("eng").with_plan("storage", "enterprise");
    assert_eq!(
        resolver
            .resolve(&feature(), "files", &unknown_plan)
            .unwrap()
            .map(|r| r.quota),
        Some(100)
    );
}

#[test]
fn test_unconfigured_limit_resolves_to_none() {
    let (resolver, _) = resolver();
    assert!(resolver
        .resolve(&feature(), "requests", &Subject::user("alice"))
        .unwrap()
        .is_none());
}

#[test]
fn test_resolve_all_follows_declaration_order() {
    let (resolver, _) = resolver();
    let rules = resolver
        .resolve_all(&feature(), &Subject::user("alice"))
        .unwrap();
    let ids: Vec<_> = rules.iter().map(|rule| rule.id.as_str()).collect();
    assert_eq!(ids, vec!["files", "bytes"]);
    assert_eq!(rules[1].unit.as_deref(), Some("MB"));
}

#[test]
fn test_unknown_feature_is_reported() {
    let (resolver, _) = resolver();
    let result = resolver.resolve_all(&FeatureRef::new("storage", "downloads"), &Subject::user("a"));
    assert!(matches!(result, Err(LimitError::FeatureNotFound(_))));

    let result = resolver.resolve_all(&FeatureRef::new("compute", "uploads"), &Subject::user("a"));
    assert!(matches!(result, Err(LimitError::FeatureNotFound(_))));
}

#[test]
fn test_catalog_loads_from_file() {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(CATALOG.as_bytes()).expect("write catalog");

    let catalog = InMemoryCatalog::from_json_file(file.path()).expect("catalog loads");
    let resolver = LimitResolver::new(Arc::new(catalog));
    assert!(resolver
        .resolve(&feature(), "bytes", &Subject::user("alice"))
        .unwrap()
        .is_some());
}
