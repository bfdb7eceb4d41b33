use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::LimitError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    User,
    Group,
    Subscription,
}

impl SubjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectKind::User => "user",
            SubjectKind::Group => "group",
            SubjectKind::Subscription => "subscription",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(SubjectKind::User),
            "group" => Some(SubjectKind::Group),
            "subscription" => Some(SubjectKind::Subscription),
            _ => None,
        }
    }
}

/// The entity whose consumption is tracked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub kind: SubjectKind,
    pub id: String,
    /// Plan the subject is tied to, keyed by product identifier.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub plans: BTreeMap<String, String>,
}

impl Subject {
    pub fn new(kind: SubjectKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            plans: BTreeMap::new(),
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::new(SubjectKind::User, id)
    }

    pub fn group(id: impl Into<String>) -> Self {
        Self::new(SubjectKind::Group, id)
    }

    pub fn subscription(id: impl Into<String>) -> Self {
        Self::new(SubjectKind::Subscription, id)
    }

    pub fn with_plan(mut self, product_id: impl Into<String>, plan_id: impl Into<String>) -> Self {
        self.plans.insert(product_id.into(), plan_id.into());
        self
    }

    pub fn plan_for(&self, product_id: &str) -> Option<&str> {
        self.plans.get(product_id).map(String::as_str)
    }

    pub fn validate(&self) -> Result<(), LimitError> {
        if self.id.trim().is_empty() {
            return Err(LimitError::InvalidInput(format!(
                "{} subject requires an identifier",
                self.kind.as_str()
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}
