use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use feature_usage_limits::{FeatureRef, LimitRule, LimitUsage, Subject, UsageDeltas};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRequest {
    pub product_id: String,
    pub feature_id: String,
    pub subject: Subject,
    pub deltas: UsageDeltas,
}

impl UsageRequest {
    pub fn feature(&self) -> FeatureRef {
        FeatureRef::new(self.product_id.clone(), self.feature_id.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckUsageResponse {
    pub within_limits: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureSubjectRequest {
    pub product_id: String,
    pub feature_id: String,
    pub subject: Subject,
}

impl FeatureSubjectRequest {
    pub fn feature(&self) -> FeatureRef {
        FeatureRef::new(self.product_id.clone(), self.feature_id.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemainingUnitsResponse {
    pub remaining: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSnapshotResponse {
    pub limits: Vec<LimitUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetOverrideRequest {
    pub product_id: String,
    pub feature_id: String,
    pub subject: Subject,
    pub rule: LimitRule,
}

impl SetOverrideRequest {
    pub fn feature(&self) -> FeatureRef {
        FeatureRef::new(self.product_id.clone(), self.feature_id.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveOverrideRequest {
    pub product_id: String,
    pub feature_id: String,
    pub subject: Subject,
    pub limit_id: String,
}

impl RemoveOverrideRequest {
    pub fn feature(&self) -> FeatureRef {
        FeatureRef::new(self.product_id.clone(), self.feature_id.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveOverrideResponse {
    pub removed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PurgeRequest {
    pub as_of: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeResponse {
    pub removed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    pub details: Option<serde_json::Value>,
}
