use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::catalog::{FeatureRef, ProductCatalog};
use crate::clock::{Clock, SystemClock};
use crate::context::UsageTrackingContext;
use crate::error::LimitError;
use crate::repository::{LimitRuleRepository, NoopLimitRuleRepository, UsageRepository};
use crate::resolver::LimitResolver;
use crate::rule::LimitRule;
use crate::strategy::StrategyRegistry;
use crate::subject::Subject;
use crate::window::{Window, WindowCalculator};

/// Units requested per limit identifier.
pub type UsageDeltas = BTreeMap<String, u64>;

/// Point-in-time usage of one resolved limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitUsage {
    pub limit_id: String,
    pub quota: u64,
    pub unit: Option<String>,
    pub used: u64,
    pub remaining: i64,
    pub window: Window,
}

#[derive(Debug, Clone, Copy)]
enum Operation {
    Record,
    Reduce,
}

/// Entry point of the engine: resolves a feature's limits, runs the matching
/// strategy over each, and commits the result in one batch.
#[derive(Clone)]
pub struct UsageVerifier {
    resolver: LimitResolver,
    strategies: StrategyRegistry,
    usage: Arc<dyn UsageRepository>,
    clock: Arc<dyn Clock>,
}

pub struct UsageVerifierBuilder {
    catalog: Arc<dyn ProductCatalog>,
    usage: Arc<dyn UsageRepository>,
    limit_rules: Arc<dyn LimitRuleRepository>,
    strategies: StrategyRegistry,
    clock: Arc<dyn Clock>,
}

impl UsageVerifierBuilder {
    pub fn limit_rules(mut self, limit_rules: Arc<dyn LimitRuleRepository>) -> Self {
        self.limit_rules = limit_rules;
        self
    }

    pub fn strategies(mut self, strategies: StrategyRegistry) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> UsageVerifier {
        UsageVerifier {
            resolver: LimitResolver::with_overrides(self.catalog, self.limit_rules),
            strategies: self.strategies,
            usage: self.usage,
            clock: self.clock,
        }
    }
}

impl UsageVerifier {
    pub fn builder(
        catalog: Arc<dyn ProductCatalog>,
        usage: Arc<dyn UsageRepository>,
    ) -> UsageVerifierBuilder {
        UsageVerifierBuilder {
            catalog,
            usage,
            limit_rules: Arc::new(NoopLimitRuleRepository),
            strategies: StrategyRegistry::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn resolver(&self) -> &LimitResolver {
        &self.resolver
    }

    /// Charge `deltas` against the feature's limits. Fails with
    /// [`LimitError::LimitExceeded`] without persisting anything if any limit
    /// would be exceeded.
    pub fn record_feature_usage(
        &self,
        feature: &FeatureRef,
        subject: &Subject,
        deltas: &UsageDeltas,
    ) -> Result<(), LimitError> {
        self.apply(Operation::Record, feature, subject, deltas)
    }

    /// Credit `deltas` back; usage never drops below zero.
    pub fn reduce_feature_usage(
        &self,
        feature: &FeatureRef,
        subject: &Subject,
        deltas: &UsageDeltas,
    ) -> Result<(), LimitError> {
        self.apply(Operation::Reduce, feature, subject, deltas)
    }

    pub fn is_within_limits(
        &self,
        feature: &FeatureRef,
        subject: &Subject,
        deltas: &UsageDeltas,
    ) -> Result<bool, LimitError> {
        validate_deltas(deltas)?;
        let (context, rules) = self.load(feature, subject, Some(deltas))?;

        for rule in &rules {
            let delta = deltas.get(&rule.id).copied().unwrap_or_default();
            let strategy = self.strategies.strategy_for(rule)?;
            if !strategy.is_within_limits(&context, rule, delta)? {
                debug!(feature = %feature, subject = %subject, limit_id = %rule.id, delta, "request would exceed limit");
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn remaining_units(
        &self,
        feature: &FeatureRef,
        subject: &Subject,
    ) -> Result<BTreeMap<String, i64>, LimitError> {
        let (context, rules) = self.load(feature, subject, None)?;

        let mut remaining = BTreeMap::new();
        for rule in &rules {
            let strategy = self.strategies.strategy_for(rule)?;
            remaining.insert(rule.id.clone(), strategy.remaining_units(&context, rule)?);
        }
        Ok(remaining)
    }

    /// Usage of every resolved limit in its current window. Read-only.
    pub fn usage_snapshot(
        &self,
        feature: &FeatureRef,
        subject: &Subject,
    ) -> Result<Vec<LimitUsage>, LimitError> {
        let (context, rules) = self.load(feature, subject, None)?;

        rules
            .iter()
            .map(|rule| -> Result<LimitUsage, LimitError> {
                let strategy = self.strategies.strategy_for(rule)?;
                Ok(LimitUsage {
                    limit_id: rule.id.clone(),
                    quota: rule.quota,
                    unit: rule.unit.clone(),
                    used: strategy.current_usage(&context, rule)?,
                    remaining: strategy.remaining_units(&context, rule)?,
                    window: rule.window(context.now()),
                })
            })
            .collect()
    }

    /// Store a subject-specific rule that takes precedence over plan and global rules.
    pub fn override_limit(
        &self,
        feature: &FeatureRef,
        subject: &Subject,
        rule: &LimitRule,
    ) -> Result<(), LimitError> {
        feature.validate()?;
        subject.validate()?;
        rule.validate()?;
        let declared = self.resolver.declared_limit_ids(feature)?;
        if !declared.iter().any(|id| *id == rule.id) {
            return Err(LimitError::InvalidInput(format!(
                "feature {feature} does not declare limit {}",
                rule.id
            )));
        }

        self.resolver
            .overrides()
            .update(feature, rule, subject)
            .map_err(|err| LimitError::repository("update limit override", Some(&rule.id), err))?;
        info!(feature = %feature, subject = %subject, limit_id = %rule.id, quota = rule.quota, "limit override stored");
        Ok(())
    }

    pub fn remove_limit_override(
        &self,
        feature: &FeatureRef,
        subject: &Subject,
        limit_id: &str,
    ) -> Result<bool, LimitError> {
        feature.validate()?;
        subject.validate()?;

        let removed = self
            .resolver
            .overrides()
            .delete(feature, limit_id, subject)
            .map_err(|err| LimitError::repository("delete limit override", Some(limit_id), err))?;
        if removed {
            info!(feature = %feature, subject = %subject, limit_id, "limit override removed");
        }
        Ok(removed)
    }

    /// Retention sweep: drop records that expired at or before `as_of`.
    pub fn purge_expired(&self, as_of: DateTime<Utc>) -> Result<usize, LimitError> {
        let removed = self
            .usage
            .delete_old_records(as_of)
            .map_err(|err| LimitError::repository("delete old records", None, err))?;
        info!(removed, as_of = %as_of, "purged expired usage records");
        Ok(removed)
    }

    fn apply(
        &self,
        operation: Operation,
        feature: &FeatureRef,
        subject: &Subject,
        deltas: &UsageDeltas,
    ) -> Result<(), LimitError> {
        validate_deltas(deltas)?;
        let (mut context, rules) = self.load(feature, subject, Some(deltas))?;

        for rule in &rules {
            let delta = deltas.get(&rule.id).copied().unwrap_or_default();
            let strategy = self.strategies.strategy_for(rule)?;
            match operation {
                Operation::Record => strategy.record(&mut context, rule, delta)?,
                Operation::Reduce => strategy.reduce(&mut context, rule, delta)?,
            }
        }

        if !context.has_pending_writes() {
            debug!(feature = %feature, subject = %subject, "no configured limits matched request");
            return Ok(());
        }

        let written = self
            .usage
            .update_usage_records(&context)
            .map_err(|err| {
                LimitError::repository("update usage records", Some(&context.limit_ids()), err)
            })?;
        debug!(
            feature = %feature,
            subject = %subject,
            operation = ?operation,
            written,
            "committed usage records"
        );
        Ok(())
    }

    /// Resolve the feature's limits (restricted to `deltas` when given), build the
    /// per-call context and bulk-load matching records into it.
    fn load(
        &self,
        feature: &FeatureRef,
        subject: &Subject,
        deltas: Option<&UsageDeltas>,
    ) -> Result<(UsageTrackingContext, Vec<LimitRule>), LimitError> {
        feature.validate()?;
        subject.validate()?;

        let mut rules = self.resolver.resolve_all(feature, subject)?;
        if let Some(deltas) = deltas {
            rules.retain(|rule| deltas.contains_key(&rule.id));
        }

        let mut context = UsageTrackingContext::new(feature.clone(), subject.clone(), self.clock.now());
        for rule in &rules {
            let strategy = self.strategies.strategy_for(rule)?;
            context.add_criteria(strategy.search_criteria(rule, context.now()));
        }

        if !rules.is_empty() {
            let limit_ids = context.limit_ids();
            self.usage
                .load_usage_data(&mut context)
                .map_err(|err| LimitError::repository("load usage data", Some(&limit_ids), err))?;
        }

        Ok((context, rules))
    }
}

fn validate_deltas(deltas: &UsageDeltas) -> Result<(), LimitError> {
    if deltas.is_empty() {
        return Err(LimitError::InvalidInput(
            "at least one limit delta is required".into(),
        ));
    }
    for (limit_id, units) in deltas {
        if limit_id.trim().is_empty() {
            return Err(LimitError::InvalidInput(
                "limit identifier cannot be empty".into(),
            ));
        }
        if *units == 0 {
            return Err(LimitError::InvalidInput(format!(
                "delta for limit {limit_id} must be greater than zero"
            )));
        }
    }
    Ok(())
}
