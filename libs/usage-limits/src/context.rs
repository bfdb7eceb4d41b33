use chrono::{DateTime, Utc};

use crate::catalog::FeatureRef;
use crate::error::LimitError;
use crate::record::{RecordSearchCriteria, UsageRecord};
use crate::subject::Subject;
use crate::window::Window;

/// Per-call aggregate of search criteria, loaded records and pending writes.
///
/// A context lives for exactly one verification call: criteria are collected,
/// the usage repository fills `current`, strategies stage into `updated`, and
/// the repository commits `updated` in one batch.
#[derive(Debug, Clone)]
pub struct UsageTrackingContext {
    feature: FeatureRef,
    subject: Subject,
    now: DateTime<Utc>,
    criteria: Vec<RecordSearchCriteria>,
    current: Vec<UsageRecord>,
    updated: Vec<UsageRecord>,
}

impl UsageTrackingContext {
    pub fn new(feature: FeatureRef, subject: Subject, now: DateTime<Utc>) -> Self {
        Self {
            feature,
            subject,
            now,
            criteria: Vec::new(),
            current: Vec::new(),
            updated: Vec::new(),
        }
    }

    pub fn feature(&self) -> &FeatureRef {
        &self.feature
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    /// The single clock reading every window in this call is computed from.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn add_criteria(&mut self, criteria: RecordSearchCriteria) {
        self.criteria.push(criteria);
    }

    pub fn criteria(&self) -> &[RecordSearchCriteria] {
        &self.criteria
    }

    pub fn criteria_for(&self, limit_id: &str) -> Option<&RecordSearchCriteria> {
        self.criteria
            .iter()
            .find(|criteria| criteria.limit_id == limit_id)
    }

    /// Called by the usage repository once records matching the criteria are fetched.
    pub fn load_current(&mut self, records: impl IntoIterator<Item = UsageRecord>) {
        self.current.extend(records);
    }

    pub fn current(&self) -> &[UsageRecord] {
        &self.current
    }

    pub fn updated(&self) -> &[UsageRecord] {
        &self.updated
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.updated.is_empty()
    }

    /// The record accounting `criteria`, preferring one staged earlier in this call.
    ///
    /// More than one stored match means storage holds duplicate windows, which is
    /// reported as [`LimitError::InconsistentState`].
    pub fn find_record(
        &self,
        criteria: &RecordSearchCriteria,
    ) -> Result<Option<&UsageRecord>, LimitError> {
        if let Some(staged) = self.updated.iter().find(|record| criteria.matches(record)) {
            return Ok(Some(staged));
        }

        let matches = criteria.filter(&self.current);
        match matches.as_slice() {
            [] => Ok(None),
            [single] => Ok(Some(*single)),
            _ => Err(LimitError::InconsistentState {
                feature: self.feature.clone(),
                limit_id: criteria.limit_id.clone(),
                matches: matches.len(),
            }),
        }
    }

    /// Every record matching `criteria`, with staged records shadowing the loaded
    /// record for the same limit and window.
    pub fn matching_records(&self, criteria: &RecordSearchCriteria) -> Vec<&UsageRecord> {
        let mut matched: Vec<&UsageRecord> = self
            .updated
            .iter()
            .filter(|record| criteria.matches(record))
            .collect();
        matched.extend(
            self.current
                .iter()
                .filter(|record| criteria.matches(record) && !self.is_staged(record)),
        );
        matched
    }

    /// The record accounting exactly `window` for `limit_id`, staged first.
    pub fn record_for_window(
        &self,
        limit_id: &str,
        window: Window,
    ) -> Result<Option<&UsageRecord>, LimitError> {
        let same_window =
            |record: &&UsageRecord| record.limit_id == limit_id && record.window() == window;
        if let Some(staged) = self.updated.iter().find(&same_window) {
            return Ok(Some(staged));
        }

        let matches: Vec<&UsageRecord> = self.current.iter().filter(&same_window).collect();
        match matches.as_slice() {
            [] => Ok(None),
            [single] => Ok(Some(*single)),
            _ => Err(LimitError::InconsistentState {
                feature: self.feature.clone(),
                limit_id: limit_id.to_string(),
                matches: matches.len(),
            }),
        }
    }

    /// Comma-separated limit identifiers this call searches for, used as error context.
    pub fn limit_ids(&self) -> String {
        let mut ids: Vec<&str> = self
            .criteria
            .iter()
            .map(|criteria| criteria.limit_id.as_str())
            .chain(self.updated.iter().map(|record| record.limit_id.as_str()))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids.join(",")
    }

    fn is_staged(&self, record: &UsageRecord) -> bool {
        self.updated
            .iter()
            .any(|staged| staged.limit_id == record.limit_id && staged.window() == record.window())
    }

    /// Queue `record` for commit, replacing anything already staged for the same
    /// limit and window.
    pub fn stage(&mut self, record: UsageRecord) {
        let existing = self.updated.iter_mut().find(|staged| {
            staged.limit_id == record.limit_id && staged.window() == record.window()
        });
        match existing {
            Some(slot) => *slot = record,
            None => self.updated.push(record),
        }
    }
}
