use std::sync::Arc;

use chrono::{TimeZone, Utc};
use feature_usage_limits::{
    Feature, FeatureRef, FixedClock, InMemoryCatalog, InMemoryUsageRepository, LimitRule,
    Periodicity, Plan, PlanLimitOverride, Product, SlidingUnit, Subject, UsageDeltas,
    UsageVerifier,
};
use feature_usage_tracker::{build_verifier, UsageTrackerConfig};
use rand::Rng;
use tempfile::TempDir;

// Re-export external crates needed by the benches
pub use feature_usage_limits;
pub use serde_json;

pub const BENCH_PRODUCT: &str = "bench";
pub const BENCH_FEATURE: &str = "requests";

/// Quotas are sized so that repeated benchmark iterations never trip a limit.
pub fn bench_product() -> Product {
    Product {
        id: BENCH_PRODUCT.to_string(),
        name: "Benchmark product".to_string(),
        features: vec![Feature {
            id: BENCH_FEATURE.to_string(),
            name: "Requests".to_string(),
            limits: vec![
                LimitRule::calendar("daily", u64::MAX / 4, Periodicity::Day),
                LimitRule::sliding("burst", u64::MAX / 4, SlidingUnit::Minutes, 15),
                LimitRule::count("tokens", u64::MAX / 4).with_unit("tokens"),
            ],
        }],
        plans: vec![Plan {
            id: "enterprise".to_string(),
            name: "Enterprise".to_string(),
            limit_overrides: vec![PlanLimitOverride {
                feature_id: BENCH_FEATURE.to_string(),
                rule: LimitRule::calendar("daily", u64::MAX / 2, Periodicity::Day),
            }],
        }],
    }
}

pub fn bench_deltas() -> UsageDeltas {
    [("daily", 1), ("burst", 1), ("tokens", 3)]
        .into_iter()
        .map(|(limit_id, units)| (limit_id.to_string(), units))
        .collect()
}

pub fn random_subject() -> Subject {
    let suffix: u32 = rand::thread_rng().gen();
    Subject::user(format!("user-{suffix:08x}")).with_plan(BENCH_PRODUCT, "enterprise")
}

/// Verifier over in-memory storage with a pinned clock.
pub struct VerifierBenchFixture {
    pub verifier: Arc<UsageVerifier>,
    pub repository: Arc<InMemoryUsageRepository>,
    pub feature: FeatureRef,
}

impl VerifierBenchFixture {
    pub fn new() -> Self {
        let repository = Arc::new(InMemoryUsageRepository::new());
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0)
                .single()
                .expect("valid bench timestamp"),
        ));
        let verifier = UsageVerifier::builder(
            Arc::new(InMemoryCatalog::new([bench_product()])),
            repository.clone(),
        )
        .clock(clock)
        .build();

        Self {
            verifier: Arc::new(verifier),
            repository,
            feature: FeatureRef::new(BENCH_PRODUCT, BENCH_FEATURE),
        }
    }
}

impl Default for VerifierBenchFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Verifier wired to the SQLite store the service uses.
pub struct SqliteBenchFixture {
    pub verifier: Arc<UsageVerifier>,
    pub feature: FeatureRef,
    pub temp_dir: TempDir,
}

impl SqliteBenchFixture {
    pub fn new() -> anyhow::Result<Self> {
        let temp_dir = TempDir::new()?;
        let catalog_path = temp_dir.path().join("catalog.json");
        let catalog = serde_json::json!({ "products": [bench_product()] });
        std::fs::write(&catalog_path, catalog.to_string())?;

        let config = UsageTrackerConfig {
            data_dir: temp_dir.path().join("data"),
            catalog_path,
            ..UsageTrackerConfig::default()
        };
        config.validate()?;
        let verifier = build_verifier(&config)?;
        tracing::debug!(dir = %temp_dir.path().display(), "sqlite bench fixture ready");

        Ok(Self {
            verifier,
            feature: FeatureRef::new(BENCH_PRODUCT, BENCH_FEATURE),
            temp_dir,
        })
    }
}
