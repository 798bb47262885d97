//! Persistence contract consumed by the dispatcher.
//!
//! [`BuildStore`] is the only way the dispatcher touches durable state. The
//! production implementation, [`PgBuildStore`], delegates to the
//! repositories in `archery_db`.

use archery_core::build::BuildStatus;
use archery_core::log_stream::OutputChannel;
use archery_core::types::DbId;
use archery_db::models::build::Build;
use archery_db::repositories::{BuildLogRepo, BuildRepo};
use archery_db::DbPool;
use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait BuildStore: Send + Sync + 'static {
    /// The oldest `queued` build, by ascending id. Does not claim it.
    async fn dequeue_next_queued(&self) -> Result<Option<Build>, StoreError>;

    /// Move a queued build to `running`. Returns `false` if it was no longer
    /// queued.
    async fn mark_running(
        &self,
        id: DbId,
        container_name: &str,
        pid: Option<u32>,
    ) -> Result<bool, StoreError>;

    /// Record a terminal status. Returns `false` if the build was already
    /// terminal; the stored status is then left untouched.
    async fn mark_finished(&self, id: DbId, status: BuildStatus) -> Result<bool, StoreError>;

    async fn append_log_line(
        &self,
        id: DbId,
        channel: OutputChannel,
        line: &str,
    ) -> Result<(), StoreError>;

    async fn get_build(&self, id: DbId) -> Result<Option<Build>, StoreError>;
}

/// [`BuildStore`] backed by PostgreSQL.
#[derive(Clone)]
pub struct PgBuildStore {
    pool: DbPool,
}

impl PgBuildStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BuildStore for PgBuildStore {
    async fn dequeue_next_queued(&self) -> Result<Option<Build>, StoreError> {
        Ok(BuildRepo::next_queued(&self.pool).await?)
    }

    async fn mark_running(
        &self,
        id: DbId,
        container_name: &str,
        pid: Option<u32>,
    ) -> Result<bool, StoreError> {
        // Out-of-range pids are not recorded; the container name is what
        // cancellation relies on.
        let pid = pid.and_then(|p| i32::try_from(p).ok());
        Ok(BuildRepo::mark_running(&self.pool, id, container_name, pid).await?)
    }

    async fn mark_finished(&self, id: DbId, status: BuildStatus) -> Result<bool, StoreError> {
        Ok(BuildRepo::finish(&self.pool, id, status).await?)
    }

    async fn append_log_line(
        &self,
        id: DbId,
        channel: OutputChannel,
        line: &str,
    ) -> Result<(), StoreError> {
        Ok(BuildLogRepo::append(&self.pool, id, channel, line).await?)
    }

    async fn get_build(&self, id: DbId) -> Result<Option<Build>, StoreError> {
        Ok(BuildRepo::find_by_id(&self.pool, id).await?)
    }
}
