use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::catalog::FeatureRef;
use crate::context::UsageTrackingContext;
use crate::error::RepositoryError;
use crate::record::{RecordToken, UsageRecord};
use crate::rule::LimitRule;
use crate::subject::{Subject, SubjectKind};

/// Store of subject-specific limit overrides.
pub trait LimitRuleRepository: Send + Sync {
    fn find(
        &self,
        feature: &FeatureRef,
        limit_id: &str,
        subject: &Subject,
    ) -> Result<Option<LimitRule>, RepositoryError>;

    fn update(
        &self,
        feature: &FeatureRef,
        rule: &LimitRule,
        subject: &Subject,
    ) -> Result<(), RepositoryError>;

    /// Returns whether an override was removed.
    fn delete(
        &self,
        feature: &FeatureRef,
        limit_id: &str,
        subject: &Subject,
    ) -> Result<bool, RepositoryError>;
}

/// Durable storage of usage records.
pub trait UsageRepository: Send + Sync {
    /// Fill `context` with every stored record matching one of its criteria.
    fn load_usage_data(&self, context: &mut UsageTrackingContext) -> Result<(), RepositoryError>;

    /// Persist the context's staged records in one batch; returns how many were written.
    ///
    /// Records carrying a token update the stored record it names, the rest are
    /// inserted under a freshly assigned token.
    fn update_usage_records(&self, context: &UsageTrackingContext)
        -> Result<usize, RepositoryError>;

    /// Remove records whose expiration date is at or before `as_of`.
    fn delete_old_records(&self, as_of: DateTime<Utc>) -> Result<usize, RepositoryError>;
}

/// Used when no override store is configured: never finds anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLimitRuleRepository;

impl LimitRuleRepository for NoopLimitRuleRepository {
    fn find(
        &self,
        _feature: &FeatureRef,
        _limit_id: &str,
        _subject: &Subject,
    ) -> Result<Option<LimitRule>, RepositoryError> {
        Ok(None)
    }

    fn update(
        &self,
        _feature: &FeatureRef,
        _rule: &LimitRule,
        _subject: &Subject,
    ) -> Result<(), RepositoryError> {
        Ok(())
    }

    fn delete(
        &self,
        _feature: &FeatureRef,
        _limit_id: &str,
        _subject: &Subject,
    ) -> Result<bool, RepositoryError> {
        Ok(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SubjectScope {
    feature: FeatureRef,
    kind: SubjectKind,
    subject_id: String,
}

impl SubjectScope {
    fn new(feature: &FeatureRef, subject: &Subject) -> Self {
        Self {
            feature: feature.clone(),
            kind: subject.kind,
            subject_id: subject.id.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryLimitRuleRepository {
    overrides: DashMap<(SubjectScope, String), LimitRule>,
}

impl InMemoryLimitRuleRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LimitRuleRepository for InMemoryLimitRuleRepository {
    fn find(
        &self,
        feature: &FeatureRef,
        limit_id: &str,
        subject: &Subject,
    ) -> Result<Option<LimitRule>, RepositoryError> {
        let key = (SubjectScope::new(feature, subject), limit_id.to_string());
        Ok(self.overrides.get(&key).map(|rule| rule.clone()))
    }

    fn update(
        &self,
        feature: &FeatureRef,
        rule: &LimitRule,
        subject: &Subject,
    ) -> Result<(), RepositoryError> {
        let key = (SubjectScope::new(feature, subject), rule.id.clone());
        self.overrides.insert(key, rule.clone());
        Ok(())
    }

    fn delete(
        &self,
        feature: &FeatureRef,
        limit_id: &str,
        subject: &Subject,
    ) -> Result<bool, RepositoryError> {
        let key = (SubjectScope::new(feature, subject), limit_id.to_string());
        Ok(self.overrides.remove(&key).is_some())
    }
}

/// Usage storage kept in process memory, keyed by feature and subject.
#[derive(Debug, Default)]
pub struct InMemoryUsageRepository {
    records: DashMap<SubjectScope, Vec<UsageRecord>>,
    commits: AtomicUsize,
}

impl InMemoryUsageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `record` as-is, assigning a token if it has none.
    pub fn insert(&self, feature: &FeatureRef, subject: &Subject, mut record: UsageRecord) {
        if record.token.is_none() {
            record.token = Some(new_token());
        }
        self.records
            .entry(SubjectScope::new(feature, subject))
            .or_default()
            .push(record);
    }

    pub fn records(&self, feature: &FeatureRef, subject: &Subject) -> Vec<UsageRecord> {
        self.records
            .get(&SubjectScope::new(feature, subject))
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    /// Number of batches committed through [`UsageRepository::update_usage_records`].
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

impl UsageRepository for InMemoryUsageRepository {
    fn load_usage_data(&self, context: &mut UsageTrackingContext) -> Result<(), RepositoryError> {
        let scope = SubjectScope::new(context.feature(), context.subject());
        let loaded: Vec<UsageRecord> = match self.records.get(&scope) {
            Some(stored) => stored
                .iter()
                .filter(|record| {
                    context
                        .criteria()
                        .iter()
                        .any(|criteria| criteria.matches(record))
                })
                .cloned()
                .collect(),
            None => Vec::new(),
        };

        debug!(
            feature = %context.feature(),
            subject = %context.subject(),
            loaded = loaded.len(),
            "loaded usage records"
        );
        context.load_current(loaded);
        Ok(())
    }

    fn update_usage_records(
        &self,
        context: &UsageTrackingContext,
    ) -> Result<usize, RepositoryError> {
        let scope = SubjectScope::new(context.feature(), context.subject());
        let mut stored = self.records.entry(scope).or_default();

        // Validate every token before touching anything so a batch applies fully or not at all.
        for record in context.updated() {
            if let Some(token) = &record.token {
                if !stored.iter().any(|existing| existing.token.as_ref() == Some(token)) {
                    return Err(RepositoryError::new(format!(
                        "usage record {} no longer exists",
                        token.as_str()
                    )));
                }
            }
        }

        for record in context.updated() {
            match &record.token {
                Some(token) => {
                    if let Some(existing) = stored
                        .iter_mut()
                        .find(|existing| existing.token.as_ref() == Some(token))
                    {
                        *existing = record.clone();
                    }
                }
                None => {
                    let mut inserted = record.clone();
                    inserted.token = Some(new_token());
                    stored.push(inserted);
                }
            }
        }

        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(context.updated().len())
    }

    fn delete_old_records(&self, as_of: DateTime<Utc>) -> Result<usize, RepositoryError> {
        let mut removed = 0usize;
        for mut entry in self.records.iter_mut() {
            let before = entry.len();
            entry.retain(|record| record.expiration_date.map_or(true, |expires| expires > as_of));
            removed += before - entry.len();
        }
        Ok(removed)
    }
}

fn new_token() -> RecordToken {
    RecordToken::new(Uuid::new_v4().to_string())
}
