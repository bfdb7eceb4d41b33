use std::sync::Arc;

use tracing::debug;

use crate::catalog::{Feature, FeatureRef, Product, ProductCatalog};
use crate::error::LimitError;
use crate::repository::{LimitRuleRepository, NoopLimitRuleRepository};
use crate::rule::LimitRule;
use crate::subject::Subject;

/// Where an effective rule came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleSource {
    SubjectOverride,
    PlanOverride,
    Global,
}

/// Picks the single effective rule for a feature limit and subject.
///
/// Precedence: subject override, then the subject's plan override, then the
/// feature's global rule. Nothing is cached; every call reads the collaborators.
#[derive(Clone)]
pub struct LimitResolver {
    catalog: Arc<dyn ProductCatalog>,
    overrides: Arc<dyn LimitRuleRepository>,
}

impl LimitResolver {
    pub fn new(catalog: Arc<dyn ProductCatalog>) -> Self {
        Self {
            catalog,
            overrides: Arc::new(NoopLimitRuleRepository),
        }
    }

    pub fn with_overrides(
        catalog: Arc<dyn ProductCatalog>,
        overrides: Arc<dyn LimitRuleRepository>,
    ) -> Self {
        Self { catalog, overrides }
    }

    pub fn overrides(&self) -> &Arc<dyn LimitRuleRepository> {
        &self.overrides
    }

    pub fn resolve(
        &self,
        feature: &FeatureRef,
        limit_id: &str,
        subject: &Subject,
    ) -> Result<Option<LimitRule>, LimitError> {
        Ok(self
            .resolve_with_source(feature, limit_id, subject)?
            .map(|(rule, _)| rule))
    }

    pub fn resolve_with_source(
        &self,
        feature: &FeatureRef,
        limit_id: &str,
        subject: &Subject,
    ) -> Result<Option<(LimitRule, RuleSource)>, LimitError> {
        let product = self.product(feature)?;
        let catalog_feature = self.catalog_feature(&product, feature)?;
        self.resolve_in(&product, catalog_feature, feature, limit_id, subject)
    }

    /// Limit identifiers the catalog declares for the feature.
    pub fn declared_limit_ids(&self, feature: &FeatureRef) -> Result<Vec<String>, LimitError> {
        let product = self.product(feature)?;
        let catalog_feature = self.catalog_feature(&product, feature)?;
        Ok(catalog_feature.limit_ids().map(str::to_owned).collect())
    }

    /// Resolve every limit the feature declares, dropping the ones that resolve to nothing.
    pub fn resolve_all(
        &self,
        feature: &FeatureRef,
        subject: &Subject,
    ) -> Result<Vec<LimitRule>, LimitError> {
        let product = self.product(feature)?;
        let catalog_feature = self.catalog_feature(&product, feature)?;

        let mut rules = Vec::new();
        for limit_id in catalog_feature.limit_ids() {
            match self.resolve_in(&product, catalog_feature, feature, limit_id, subject)? {
                Some((rule, source)) => {
                    debug!(
                        feature = %feature,
                        subject = %subject,
                        limit_id,
                        quota = rule.quota,
                        source = ?source,
                        "resolved limit rule"
                    );
                    rules.push(rule);
                }
                None => {
                    debug!(feature = %feature, limit_id, "limit not configured for subject");
                }
            }
        }
        Ok(rules)
    }

    fn resolve_in(
        &self,
        product: &Product,
        catalog_feature: &Feature,
        feature: &FeatureRef,
        limit_id: &str,
        subject: &Subject,
    ) -> Result<Option<(LimitRule, RuleSource)>, LimitError> {
        let subject_override = self
            .overrides
            .find(feature, limit_id, subject)
            .map_err(|err| LimitError::repository("find limit override", Some(limit_id), err))?;
        if let Some(rule) = subject_override {
            return Ok(Some((rule, RuleSource::SubjectOverride)));
        }

        let plan_override = subject
            .plan_for(&product.id)
            .and_then(|plan_id| self.catalog.plan(product, plan_id))
            .and_then(|plan| plan.limit_override(&catalog_feature.id, limit_id));
        if let Some(rule) = plan_override {
            return Ok(Some((rule.clone(), RuleSource::PlanOverride)));
        }

        Ok(self
            .catalog
            .global_limit(catalog_feature, limit_id)
            .map(|rule| (rule.clone(), RuleSource::Global)))
    }

    fn product(&self, feature: &FeatureRef) -> Result<Arc<Product>, LimitError> {
        self.catalog
            .product_by_id(&feature.product_id)
            .map_err(|err| LimitError::repository("load product", None, err))?
            .ok_or_else(|| LimitError::FeatureNotFound(feature.clone()))
    }

    fn catalog_feature<'a>(
        &self,
        product: &'a Product,
        feature: &FeatureRef,
    ) -> Result<&'a Feature, LimitError> {
        self.catalog
            .feature(product, &feature.feature_id)
            .ok_or_else(|| LimitError::FeatureNotFound(feature.clone()))
    }
}
