use std::sync::Arc;

pub mod handlers;
pub mod router;
pub mod types;

pub use router::create_router;
pub use types::*;

use feature_usage_limits::UsageVerifier;

use crate::config::UsageTrackerConfig;

pub struct ApiState {
    pub verifier: Arc<UsageVerifier>,
    pub config: Arc<UsageTrackerConfig>,
}

impl ApiState {
    pub fn new(verifier: Arc<UsageVerifier>, config: UsageTrackerConfig) -> Self {
        Self {
            verifier,
            config: Arc::new(config),
        }
    }
}
