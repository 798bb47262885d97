//! Repository for the `build_log_lines` table.

use archery_core::log_stream::OutputChannel;
use archery_core::types::DbId;
use sqlx::PgPool;

use crate::models::build_log::BuildLogLine;

/// Provides append/read access to stored build output.
pub struct BuildLogRepo;

impl BuildLogRepo {
    /// Append one completed output line.
    pub async fn append(
        pool: &PgPool,
        build_id: DbId,
        channel: OutputChannel,
        line: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO build_log_lines (build_id, channel, line) VALUES ($1, $2, $3)")
            .bind(build_id)
            .bind(channel.as_str())
            .bind(line)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// All stored lines of a build, in the order they were appended.
    pub async fn list_for_build(
        pool: &PgPool,
        build_id: DbId,
    ) -> Result<Vec<BuildLogLine>, sqlx::Error> {
        sqlx::query_as::<_, BuildLogLine>(
            "SELECT id, build_id, channel, line, created_at \
             FROM build_log_lines \
             WHERE build_id = $1 \
             ORDER BY id ASC",
        )
        .bind(build_id)
        .fetch_all(pool)
        .await
    }

    /// Stored lines of a build starting at zero-based position `offset`, in
    /// append order.
    pub async fn list_for_build_from(
        pool: &PgPool,
        build_id: DbId,
        offset: i64,
    ) -> Result<Vec<BuildLogLine>, sqlx::Error> {
        sqlx::query_as::<_, BuildLogLine>(
            "SELECT id, build_id, channel, line, created_at \
             FROM build_log_lines \
             WHERE build_id = $1 \
             ORDER BY id ASC \
             OFFSET $2",
        )
        .bind(build_id)
        .bind(offset)
        .fetch_all(pool)
        .await
    }

    /// Number of stored lines of a build.
    pub async fn count_for_build(pool: &PgPool, build_id: DbId) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM build_log_lines WHERE build_id = $1")
            .bind(build_id)
            .fetch_one(pool)
            .await
    }
}
