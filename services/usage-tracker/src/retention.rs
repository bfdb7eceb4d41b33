use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use feature_usage_limits::UsageVerifier;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

/// Periodically removes usage records whose retention deadline has passed.
pub fn start_retention_task(verifier: Arc<UsageVerifier>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            match verifier.purge_expired(Utc::now()) {
                Ok(removed) if removed > 0 => {
                    info!(removed, "retention sweep removed expired usage records");
                }
                Ok(_) => {
                    debug!("retention sweep found no expired usage records");
                }
                Err(err) => {
                    error!(error = %err, "retention sweep failed");
                }
            }
        }
    })
}
