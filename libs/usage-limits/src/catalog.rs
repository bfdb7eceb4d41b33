use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{LimitError, RepositoryError};
use crate::rule::LimitRule;

/// Identifies a feature within a product.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeatureRef {
    pub product_id: String,
    pub feature_id: String,
}

impl FeatureRef {
    pub fn new(product_id: impl Into<String>, feature_id: impl Into<String>) -> Self {
        Self {
            product_id: product_id.into(),
            feature_id: feature_id.into(),
        }
    }

    pub fn validate(&self) -> Result<(), LimitError> {
        if self.product_id.trim().is_empty() || self.feature_id.trim().is_empty() {
            return Err(LimitError::InvalidInput(
                "feature reference requires product_id and feature_id".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for FeatureRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.product_id, self.feature_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub features: Vec<Feature>,
    #[serde(default)]
    pub plans: Vec<Plan>,
}

/// A meterable capability. Its `limits` are the catalog-defined global rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub limits: Vec<LimitRule>,
}

impl Feature {
    pub fn limit_ids(&self) -> impl Iterator<Item = &str> {
        self.limits.iter().map(|limit| limit.id.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub limit_overrides: Vec<PlanLimitOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanLimitOverride {
    pub feature_id: String,
    pub rule: LimitRule,
}

impl Plan {
    /// First override declared for `feature_id` whose rule carries `limit_id`.
    pub fn limit_override(&self, feature_id: &str, limit_id: &str) -> Option<&LimitRule> {
        self.limit_overrides
            .iter()
            .find(|entry| entry.feature_id == feature_id && entry.rule.id == limit_id)
            .map(|entry| &entry.rule)
    }
}

/// Read-only view over products, features and plans.
pub trait ProductCatalog: Send + Sync {
    fn product_by_id(&self, product_id: &str) -> Result<Option<Arc<Product>>, RepositoryError>;

    fn feature<'a>(&self, product: &'a Product, feature_id: &str) -> Option<&'a Feature> {
        product.features.iter().find(|feature| feature.id == feature_id)
    }

    fn plan<'a>(&self, product: &'a Product, plan_id: &str) -> Option<&'a Plan> {
        product.plans.iter().find(|plan| plan.id == plan_id)
    }

    fn global_limit<'a>(&self, feature: &'a Feature, limit_id: &str) -> Option<&'a LimitRule> {
        feature.limits.iter().find(|limit| limit.id == limit_id)
    }
}

#[derive(Debug, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    products: Vec<Product>,
}

/// Catalog held entirely in memory, typically loaded from a JSON document of the form
/// `{"products": [...]}`.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    products: HashMap<String, Arc<Product>>,
}

impl InMemoryCatalog {
    pub fn new(products: impl IntoIterator<Item = Product>) -> Self {
        Self {
            products: products
                .into_iter()
                .map(|product| (product.id.clone(), Arc::new(product)))
                .collect(),
        }
    }

    pub fn from_json_str(source: &str) -> Result<Self, LimitError> {
        let document: CatalogDocument = serde_json::from_str(source)
            .map_err(|err| LimitError::InvalidCatalog(err.to_string()))?;

        for product in &document.products {
            for feature in &product.features {
                for limit in &feature.limits {
                    limit.validate().map_err(|err| {
                        LimitError::InvalidCatalog(format!(
                            "product {} feature {}: {err}",
                            product.id, feature.id
                        ))
                    })?;
                }
            }
        }

        Ok(Self::new(document.products))
    }

    pub fn from_json_file(path: &Path) -> Result<Self, LimitError> {
        let source = std::fs::read_to_string(path).map_err(|err| {
            LimitError::InvalidCatalog(format!("unable to read {}: {err}", path.display()))
        })?;
        Self::from_json_str(&source)
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }
}

impl ProductCatalog for InMemoryCatalog {
    fn product_by_id(&self, product_id: &str) -> Result<Option<Arc<Product>>, RepositoryError> {
        Ok(self.products.get(product_id).cloned())
    }
}
