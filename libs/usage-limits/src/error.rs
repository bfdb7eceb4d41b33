use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

use crate::catalog::FeatureRef;
use crate::rule::LimitVariant;
use crate::subject::Subject;

#[derive(Debug, Error)]
pub enum LimitError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("feature {0} not found in catalog")]
    FeatureNotFound(FeatureRef),
    #[error("limit {limit_id} exceeded for {subject} on {feature}: current={current}, requested={requested}, quota={quota}")]
    LimitExceeded {
        feature: FeatureRef,
        subject: Subject,
        limit_id: String,
        current: u64,
        requested: u64,
        quota: u64,
    },
    #[error("{matches} usage records matched limit {limit_id} of {feature} in a single window")]
    InconsistentState {
        feature: FeatureRef,
        limit_id: String,
        matches: usize,
    },
    #[error("{operation} failed for limit {}: {source}", .limit_id.as_deref().unwrap_or("*"))]
    Repository {
        operation: &'static str,
        limit_id: Option<String>,
        #[source]
        source: RepositoryError,
    },
    #[error("invalid catalog: {0}")]
    InvalidCatalog(String),
    #[error("no verification strategy registered for {0:?} limits")]
    StrategyNotRegistered(LimitVariant),
}

impl LimitError {
    /// Limit-Exceeded is a business outcome; everything else is a caller or system fault.
    pub fn is_business(&self) -> bool {
        matches!(self, LimitError::LimitExceeded { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            LimitError::InvalidInput(_) | LimitError::FeatureNotFound(_)
        )
    }

    pub(crate) fn repository(
        operation: &'static str,
        limit_id: Option<&str>,
        source: RepositoryError,
    ) -> Self {
        LimitError::Repository {
            operation,
            limit_id: limit_id.map(str::to_string),
            source,
        }
    }
}

/// Failure reported by a persistence collaborator.
#[derive(Debug)]
pub struct RepositoryError {
    message: String,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl fmt::Display for RepositoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{}: {}", self.message, source),
            None => f.write_str(&self.message),
        }
    }
}

impl StdError for RepositoryError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|source| source as &(dyn StdError + 'static))
    }
}

impl RepositoryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}
