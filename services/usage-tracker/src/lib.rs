pub mod api;
pub mod config;
pub mod retention;
pub mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};
use feature_usage_limits::{InMemoryCatalog, UsageVerifier};
use tracing::info;

pub use api::{create_router, ApiState, ErrorResponse};
pub use config::UsageTrackerConfig;
pub use retention::start_retention_task;
pub use storage::{StorageError, UsageDatabase};

/// Wire the catalog and the SQLite store into a verifier.
pub fn build_verifier(config: &UsageTrackerConfig) -> Result<Arc<UsageVerifier>> {
    let catalog = InMemoryCatalog::from_json_file(&config.catalog_path)
        .with_context(|| format!("failed to load catalog {}", config.catalog_path.display()))?;
    let database = Arc::new(
        UsageDatabase::new(config.data_dir.clone()).context("failed to open usage database")?,
    );
    info!(
        products = catalog.len(),
        data_dir = %database.data_dir().display(),
        "usage verifier ready"
    );

    let verifier = UsageVerifier::builder(Arc::new(catalog), database.clone())
        .limit_rules(database)
        .build();
    Ok(Arc::new(verifier))
}
