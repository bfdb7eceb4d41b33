use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::window::Window;

/// Repository-assigned handle for a stored record. The engine never looks inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordToken(String);

impl RecordToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Cumulative consumption of one limit by one subject inside one window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub token: Option<RecordToken>,
    pub limit_id: String,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
    pub units: u64,
    pub expiration_date: Option<DateTime<Utc>>,
}

impl UsageRecord {
    /// A not-yet-persisted record for `window`.
    pub fn new(limit_id: impl Into<String>, window: Window, units: u64) -> Self {
        Self {
            token: None,
            limit_id: limit_id.into(),
            window_start: window.start,
            window_end: window.end,
            units,
            expiration_date: window.expiration(),
        }
    }

    pub fn window(&self) -> Window {
        Window {
            start: self.window_start,
            end: self.window_end,
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.token.is_some()
    }
}

/// How a record's window is compared with the query window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowMatch {
    /// The record window lies inside the query window; open bounds never exclude.
    #[default]
    Contained,
    /// The record window closed inside the query window. Records without an end never match.
    EndsWithin,
}

/// Filter used to fetch candidate records for one limit. Bounds are inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSearchCriteria {
    pub limit_id: String,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub mode: WindowMatch,
}

impl RecordSearchCriteria {
    pub fn new(limit_id: impl Into<String>, window: Window) -> Self {
        Self {
            limit_id: limit_id.into(),
            window_start: window.start,
            window_end: window.end,
            mode: WindowMatch::Contained,
        }
    }

    /// Criteria collecting every record whose window ended inside `window`.
    pub fn ending_within(limit_id: impl Into<String>, window: Window) -> Self {
        Self {
            mode: WindowMatch::EndsWithin,
            ..Self::new(limit_id, window)
        }
    }

    pub fn window(&self) -> Window {
        Window {
            start: self.window_start,
            end: self.window_end,
        }
    }

    /// An open bound on either side never excludes a record.
    pub fn matches(&self, record: &UsageRecord) -> bool {
        record.limit_id == self.limit_id && self.matches_window(record)
    }

    pub fn matches_window(&self, record: &UsageRecord) -> bool {
        if self.mode == WindowMatch::EndsWithin {
            return record.window_end.map_or(false, |end| self.window().contains(end));
        }

        let start_ok = match (self.window_start, record.window_start) {
            (Some(query), Some(actual)) => actual >= query,
            _ => true,
        };
        let end_ok = match (self.window_end, record.window_end) {
            (Some(query), Some(actual)) => actual <= query,
            _ => true,
        };
        start_ok && end_ok
    }

    pub fn filter<'a>(&self, records: &'a [UsageRecord]) -> Vec<&'a UsageRecord> {
        records.iter().filter(|record| self.matches(record)).collect()
    }
}
