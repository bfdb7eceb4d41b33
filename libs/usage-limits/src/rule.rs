use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LimitError;
use crate::window::{Periodicity, SlidingSpan, SlidingUnit, Unbounded, WindowCalculator};

/// A quota plus the policy that produces its accounting window.
///
/// Rules are rebuilt by the resolver on every call and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitRule {
    pub id: String,
    pub quota: u64,
    /// Free-text label for the units being counted, e.g. `GB`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(flatten)]
    pub kind: LimitKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LimitKind {
    Count,
    CalendarPeriod {
        periodicity: Periodicity,
    },
    SlidingWindow {
        window_unit: SlidingUnit,
        duration: u32,
    },
}

/// Payload-free discriminant of [`LimitKind`], used to pick a verification strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitVariant {
    Count,
    CalendarPeriod,
    SlidingWindow,
}

impl LimitKind {
    pub fn variant(&self) -> LimitVariant {
        match self {
            LimitKind::Count => LimitVariant::Count,
            LimitKind::CalendarPeriod { .. } => LimitVariant::CalendarPeriod,
            LimitKind::SlidingWindow { .. } => LimitVariant::SlidingWindow,
        }
    }
}

impl WindowCalculator for LimitKind {
    fn window_start(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match *self {
            LimitKind::Count => Unbounded.window_start(at),
            LimitKind::CalendarPeriod { periodicity } => periodicity.window_start(at),
            LimitKind::SlidingWindow {
                window_unit,
                duration,
            } => SlidingSpan {
                unit: window_unit,
                duration,
            }
            .window_start(at),
        }
    }

    fn window_end(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match *self {
            LimitKind::Count => Unbounded.window_end(at),
            LimitKind::CalendarPeriod { periodicity } => periodicity.window_end(at),
            LimitKind::SlidingWindow {
                window_unit,
                duration,
            } => SlidingSpan {
                unit: window_unit,
                duration,
            }
            .window_end(at),
        }
    }
}

impl LimitRule {
    pub fn count(id: impl Into<String>, quota: u64) -> Self {
        Self {
            id: id.into(),
            quota,
            unit: None,
            kind: LimitKind::Count,
        }
    }

    pub fn calendar(id: impl Into<String>, quota: u64, periodicity: Periodicity) -> Self {
        Self {
            id: id.into(),
            quota,
            unit: None,
            kind: LimitKind::CalendarPeriod { periodicity },
        }
    }

    pub fn sliding(id: impl Into<String>, quota: u64, window_unit: SlidingUnit, duration: u32) -> Self {
        Self {
            id: id.into(),
            quota,
            unit: None,
            kind: LimitKind::SlidingWindow {
                window_unit,
                duration,
            },
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn variant(&self) -> LimitVariant {
        self.kind.variant()
    }

    pub fn validate(&self) -> Result<(), LimitError> {
        if self.id.trim().is_empty() {
            return Err(LimitError::InvalidInput(
                "limit rule identifier cannot be empty".into(),
            ));
        }
        if let LimitKind::SlidingWindow { duration: 0, .. } = self.kind {
            return Err(LimitError::InvalidInput(format!(
                "sliding window limit {} must span at least one unit",
                self.id
            )));
        }
        Ok(())
    }
}

impl WindowCalculator for LimitRule {
    fn window_start(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.kind.window_start(at)
    }

    fn window_end(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.kind.window_end(at)
    }
}
