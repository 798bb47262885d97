//! Repository for the `builds` table.
//!
//! Status transitions are conditional updates: a write that would leave a
//! terminal status, or start a build that is no longer queued, affects zero
//! rows and reports `false`.

use archery_core::build::{BuildStatus, StatusId};
use archery_core::types::{DbId, Timestamp};
use sqlx::PgPool;

use crate::models::build::{Build, CreateBuild};

/// Column list for `builds` queries.
const COLUMNS: &str = "\
    id, repo, \"commit\", patch, distro, dependencies, status_id, \
    container_name, pid, start_time, end_time, created_at";

/// Listing columns; the patch body is only served by its own endpoint.
const SUMMARY_COLUMNS: &str = "\
    id, repo, \"commit\", NULL::TEXT AS patch, distro, dependencies, status_id, \
    container_name, pid, start_time, end_time, created_at";

/// Maximum number of rows returned by [`BuildRepo::search`].
const SEARCH_LIMIT: i64 = 100;

/// Statuses a build may still leave.
const ACTIVE_STATUSES: [StatusId; 2] = [
    BuildStatus::Queued as StatusId,
    BuildStatus::Running as StatusId,
];

/// Optional filters for [`BuildRepo::list`].
#[derive(Debug, Clone)]
pub struct BuildFilter {
    pub status: Option<BuildStatus>,
    pub distro: Option<String>,
    /// Builds started before this instant are hidden. Builds that never
    /// started are always listed.
    pub started_after: Timestamp,
}

/// Provides persistence operations for builds.
pub struct BuildRepo;

impl BuildRepo {
    /// Insert a new build in `queued` status.
    pub async fn create(pool: &PgPool, input: &CreateBuild) -> Result<Build, sqlx::Error> {
        let query = format!(
            "INSERT INTO builds (repo, \"commit\", patch, distro, dependencies, status_id) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Build>(&query)
            .bind(&input.repo)
            .bind(&input.commit)
            .bind(&input.patch)
            .bind(&input.distro)
            .bind(&input.dependencies)
            .bind(BuildStatus::Queued.id())
            .fetch_one(pool)
            .await
    }

    /// Find a build by its ID.
    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<Build>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM builds WHERE id = $1");
        sqlx::query_as::<_, Build>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// The oldest queued build (lowest id), if any. Does not change its status.
    pub async fn next_queued(pool: &PgPool) -> Result<Option<Build>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM builds \
             WHERE status_id = $1 \
             ORDER BY id ASC \
             LIMIT 1"
        );
        sqlx::query_as::<_, Build>(&query)
            .bind(BuildStatus::Queued.id())
            .fetch_optional(pool)
            .await
    }

    /// Move a queued build to `running`, recording its container identity.
    ///
    /// Returns `false` if the build was no longer queued.
    pub async fn mark_running(
        pool: &PgPool,
        id: DbId,
        container_name: &str,
        pid: Option<i32>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE builds \
             SET status_id = $2, container_name = $3, pid = $4, start_time = NOW() \
             WHERE id = $1 AND status_id = $5",
        )
        .bind(id)
        .bind(BuildStatus::Running.id())
        .bind(container_name)
        .bind(pid)
        .bind(BuildStatus::Queued.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record a terminal status and stamp `end_time`.
    ///
    /// Returns `false` if the build was already terminal (or missing).
    pub async fn finish(
        pool: &PgPool,
        id: DbId,
        status: BuildStatus,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE builds \
             SET status_id = $2, end_time = NOW() \
             WHERE id = $1 AND status_id IN ($3, $4)",
        )
        .bind(id)
        .bind(status.id())
        .bind(ACTIVE_STATUSES[0])
        .bind(ACTIVE_STATUSES[1])
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Recent builds, newest first.
    pub async fn list(pool: &PgPool, filter: &BuildFilter) -> Result<Vec<Build>, sqlx::Error> {
        let query = format!(
            "SELECT {SUMMARY_COLUMNS} FROM builds \
             WHERE (start_time > $1 OR start_time IS NULL) \
               AND ($2::SMALLINT IS NULL OR status_id = $2) \
               AND ($3::TEXT IS NULL OR distro = $3) \
             ORDER BY id DESC"
        );
        sqlx::query_as::<_, Build>(&query)
            .bind(filter.started_after)
            .bind(filter.status.map(BuildStatus::id))
            .bind(&filter.distro)
            .fetch_all(pool)
            .await
    }

    /// Builds whose repo contains `term` (case-insensitive), newest first.
    pub async fn search(pool: &PgPool, term: &str) -> Result<Vec<Build>, sqlx::Error> {
        let query = format!(
            "SELECT {SUMMARY_COLUMNS} FROM builds \
             WHERE repo ILIKE '%' || $1 || '%' \
             ORDER BY id DESC \
             LIMIT $2"
        );
        sqlx::query_as::<_, Build>(&query)
            .bind(escape_like(term))
            .bind(SEARCH_LIMIT)
            .fetch_all(pool)
            .await
    }

    /// Delete builds (and, by cascade, their logs) started before `cutoff`.
    pub async fn delete_started_before(
        pool: &PgPool,
        cutoff: Timestamp,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM builds WHERE start_time < $1")
            .bind(cutoff)
            .execute(pool)
            .await?;
        tracing::debug!(%cutoff, deleted = result.rows_affected(), "Pruned old builds");
        Ok(result.rows_affected())
    }
}

/// Escape `LIKE` wildcards so user input matches literally.
fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
