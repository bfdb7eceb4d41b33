//! Feature usage limit verification engine.
//!
//! Given a product feature, its quota rules and a subject, the engine decides
//! whether more consumption is allowed and records it. A call resolves every
//! limit attached to the feature, loads the matching usage records in one
//! batch, applies the requested operation per limit in memory and commits the
//! staged records in one batch, so a rejected limit leaves nothing persisted.

pub mod catalog;
pub mod clock;
pub mod context;
pub mod error;
pub mod record;
pub mod repository;
pub mod resolver;
pub mod rule;
pub mod strategy;
pub mod subject;
pub mod verifier;
pub mod window;

pub use catalog::{
    Feature, FeatureRef, InMemoryCatalog, Plan, PlanLimitOverride, Product, ProductCatalog,
};
pub use clock::{Clock, FixedClock, SystemClock};
pub use context::UsageTrackingContext;
pub use error::{LimitError, RepositoryError};
pub use record::{RecordSearchCriteria, RecordToken, UsageRecord, WindowMatch};
pub use repository::{
    InMemoryLimitRuleRepository, InMemoryUsageRepository, LimitRuleRepository,
    NoopLimitRuleRepository, UsageRepository,
};
pub use resolver::{LimitResolver, RuleSource};
pub use rule::{LimitKind, LimitRule, LimitVariant};
pub use strategy::{
    SlidingWindowStrategy, StrategyRegistry, VerificationStrategy, WindowedUsageStrategy,
};
pub use subject::{Subject, SubjectKind};
pub use verifier::{LimitUsage, UsageDeltas, UsageVerifier, UsageVerifierBuilder};
pub use window::{Periodicity, SlidingUnit, Window, WindowCalculator};
