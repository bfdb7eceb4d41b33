use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::context::UsageTrackingContext;
use crate::error::LimitError;
use crate::record::{RecordSearchCriteria, UsageRecord};
use crate::rule::{LimitRule, LimitVariant};
use crate::window::WindowCalculator;

/// Turns current usage plus a requested delta into a decision and a staged record.
pub trait VerificationStrategy: Send + Sync {
    /// Filter the verifier bulk-loads with before any decision is made for `rule`.
    fn search_criteria(&self, rule: &LimitRule, now: DateTime<Utc>) -> RecordSearchCriteria {
        RecordSearchCriteria::new(rule.id.clone(), rule.window(now))
    }

    fn current_usage(
        &self,
        context: &UsageTrackingContext,
        rule: &LimitRule,
    ) -> Result<u64, LimitError>;

    /// `quota - current usage`. Negative only when something outside the engine
    /// pushed usage past the quota.
    fn remaining_units(
        &self,
        context: &UsageTrackingContext,
        rule: &LimitRule,
    ) -> Result<i64, LimitError> {
        let used = self.current_usage(context, rule)?;
        Ok(signed_difference(rule.quota, used))
    }

    fn is_within_limits(
        &self,
        context: &UsageTrackingContext,
        rule: &LimitRule,
        delta: u64,
    ) -> Result<bool, LimitError> {
        let remaining = self.remaining_units(context, rule)?;
        Ok(i128::from(remaining) >= i128::from(delta))
    }

    /// Stage `current + delta`, or fail with [`LimitError::LimitExceeded`] leaving
    /// the context untouched.
    fn record(
        &self,
        context: &mut UsageTrackingContext,
        rule: &LimitRule,
        delta: u64,
    ) -> Result<(), LimitError>;

    /// Stage `max(0, current - delta)`.
    fn reduce(
        &self,
        context: &mut UsageTrackingContext,
        rule: &LimitRule,
        delta: u64,
    ) -> Result<(), LimitError>;
}

/// One record per (limit, window), located with the rule's own window at the
/// context's clock reading. Used for count and calendar limits.
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowedUsageStrategy;

impl WindowedUsageStrategy {
    fn criteria(&self, context: &UsageTrackingContext, rule: &LimitRule) -> RecordSearchCriteria {
        criteria_in(self, context, rule)
    }

    /// The existing record rewritten with `units`, or a fresh one for the rule's
    /// window at the context's clock reading.
    fn next_record(
        context: &UsageTrackingContext,
        rule: &LimitRule,
        existing: Option<&UsageRecord>,
        units: u64,
    ) -> UsageRecord {
        match existing {
            Some(record) => UsageRecord {
                units,
                ..record.clone()
            },
            None => UsageRecord::new(rule.id.clone(), rule.window(context.now()), units),
        }
    }
}

impl VerificationStrategy for WindowedUsageStrategy {
    fn current_usage(
        &self,
        context: &UsageTrackingContext,
        rule: &LimitRule,
    ) -> Result<u64, LimitError> {
        let criteria = self.criteria(context, rule);
        Ok(context
            .find_record(&criteria)?
            .map_or(0, |record| record.units))
    }

    fn record(
        &self,
        context: &mut UsageTrackingContext,
        rule: &LimitRule,
        delta: u64,
    ) -> Result<(), LimitError> {
        let criteria = self.criteria(context, rule);
        let existing = context.find_record(&criteria)?;
        let current = existing.map_or(0, |record| record.units);

        let new_usage = match current.checked_add(delta) {
            Some(total) if total <= rule.quota => total,
            _ => return Err(limit_exceeded(context, rule, current, delta)),
        };

        let next = Self::next_record(context, rule, existing, new_usage);
        context.stage(next);
        Ok(())
    }

    fn reduce(
        &self,
        context: &mut UsageTrackingContext,
        rule: &LimitRule,
        delta: u64,
    ) -> Result<(), LimitError> {
        let criteria = self.criteria(context, rule);
        let existing = context.find_record(&criteria)?;
        let new_usage = existing
            .map_or(0, |record| record.units)
            .saturating_sub(delta);

        let next = Self::next_record(context, rule, existing, new_usage);
        context.stage(next);
        Ok(())
    }
}

/// Sums every record whose window closed inside the rule's current span.
///
/// Each call accounts into the record for its own `[now - span, now]` window, so
/// records stay unique per window while the span slides over them.
#[derive(Debug, Default, Clone, Copy)]
pub struct SlidingWindowStrategy;

impl SlidingWindowStrategy {
    fn criteria(&self, context: &UsageTrackingContext, rule: &LimitRule) -> RecordSearchCriteria {
        criteria_in(self, context, rule)
    }
}

impl VerificationStrategy for SlidingWindowStrategy {
    fn search_criteria(&self, rule: &LimitRule, now: DateTime<Utc>) -> RecordSearchCriteria {
        RecordSearchCriteria::ending_within(rule.id.clone(), rule.window(now))
    }

    fn current_usage(
        &self,
        context: &UsageTrackingContext,
        rule: &LimitRule,
    ) -> Result<u64, LimitError> {
        let criteria = self.criteria(context, rule);
        Ok(context
            .matching_records(&criteria)
            .iter()
            .fold(0u64, |total, record| total.saturating_add(record.units)))
    }

    fn record(
        &self,
        context: &mut UsageTrackingContext,
        rule: &LimitRule,
        delta: u64,
    ) -> Result<(), LimitError> {
        let current = self.current_usage(context, rule)?;
        if current.checked_add(delta).map_or(true, |total| total > rule.quota) {
            return Err(limit_exceeded(context, rule, current, delta));
        }

        let window = rule.window(context.now());
        let next = match context.record_for_window(&rule.id, window)? {
            Some(existing) => UsageRecord {
                units: existing.units.saturating_add(delta),
                ..existing.clone()
            },
            None => UsageRecord::new(rule.id.clone(), window, delta),
        };
        context.stage(next);
        Ok(())
    }

    /// Credits the newest records first until `delta` is used up.
    fn reduce(
        &self,
        context: &mut UsageTrackingContext,
        rule: &LimitRule,
        delta: u64,
    ) -> Result<(), LimitError> {
        let criteria = self.criteria(context, rule);
        let mut matched: Vec<UsageRecord> = context
            .matching_records(&criteria)
            .into_iter()
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.window_end.cmp(&a.window_end));

        let mut outstanding = delta;
        for mut record in matched {
            if outstanding == 0 {
                break;
            }
            if record.units == 0 {
                continue;
            }
            let credited = record.units.min(outstanding);
            record.units -= credited;
            outstanding -= credited;
            context.stage(record);
        }
        Ok(())
    }
}

/// Criteria collected for `rule` during the load phase, or the strategy's own
/// criteria at the context's clock reading.
fn criteria_in(
    strategy: &dyn VerificationStrategy,
    context: &UsageTrackingContext,
    rule: &LimitRule,
) -> RecordSearchCriteria {
    context
        .criteria_for(&rule.id)
        .cloned()
        .unwrap_or_else(|| strategy.search_criteria(rule, context.now()))
}

fn limit_exceeded(
    context: &UsageTrackingContext,
    rule: &LimitRule,
    current: u64,
    delta: u64,
) -> LimitError {
    warn!(
        feature = %context.feature(),
        subject = %context.subject(),
        limit_id = %rule.id,
        current,
        delta,
        quota = rule.quota,
        "usage limit exceeded"
    );
    LimitError::LimitExceeded {
        feature: context.feature().clone(),
        subject: context.subject().clone(),
        limit_id: rule.id.clone(),
        current,
        requested: delta,
        quota: rule.quota,
    }
}

/// Maps each rule variant to the strategy that verifies it.
#[derive(Clone)]
pub struct StrategyRegistry {
    strategies: HashMap<LimitVariant, Arc<dyn VerificationStrategy>>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        let windowed: Arc<dyn VerificationStrategy> = Arc::new(WindowedUsageStrategy);
        Self::empty()
            .with(LimitVariant::Count, Arc::clone(&windowed))
            .with(LimitVariant::CalendarPeriod, windowed)
            .with(LimitVariant::SlidingWindow, Arc::new(SlidingWindowStrategy))
    }
}

impl StrategyRegistry {
    pub fn empty() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    pub fn register(&mut self, variant: LimitVariant, strategy: Arc<dyn VerificationStrategy>) {
        self.strategies.insert(variant, strategy);
    }

    pub fn with(mut self, variant: LimitVariant, strategy: Arc<dyn VerificationStrategy>) -> Self {
        self.register(variant, strategy);
        self
    }

    pub fn strategy_for(&self, rule: &LimitRule) -> Result<&dyn VerificationStrategy, LimitError> {
        self.strategies
            .get(&rule.variant())
            .map(|strategy| strategy.as_ref())
            .ok_or(LimitError::StrategyNotRegistered(rule.variant()))
    }
}

fn signed_difference(quota: u64, used: u64) -> i64 {
    let difference = i128::from(quota) - i128::from(used);
    i64::try_from(difference).unwrap_or(if difference < 0 { i64::MIN } else { i64::MAX })
}
