//! Periodic cleanup of old builds.
//!
//! Deletes builds whose `start_time` is older than the retention period;
//! their log lines go with them through the foreign key cascade. Builds
//! that never started are kept.

use std::time::Duration;

use archery_db::repositories::BuildRepo;
use archery_db::DbPool;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

/// How often the cleanup job runs.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600); // 1 hour

/// Run the build retention loop until `cancel` is triggered.
pub async fn run(pool: DbPool, retention_days: i64, cancel: CancellationToken) {
    tracing::info!(
        retention_days,
        interval_secs = CLEANUP_INTERVAL.as_secs(),
        "Build retention job started"
    );

    let mut interval = tokio::time::interval(CLEANUP_INTERVAL);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Build retention job stopping");
                break;
            }
            _ = interval.tick() => {
                let cutoff = Utc::now() - chrono::Duration::days(retention_days);
                match BuildRepo::delete_started_before(&pool, cutoff).await {
                    Ok(deleted) => {
                        if deleted > 0 {
                            tracing::info!(deleted, "Build retention: purged old builds");
                        } else {
                            tracing::debug!("Build retention: nothing to purge");
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Build retention: cleanup failed");
                    }
                }
            }
        }
    }
}
