//! Handlers for the `/builds` resource.
//!
//! Creating a build only inserts it as `queued` and pokes the dispatcher;
//! everything after that happens in the drain task.

use archery_core::build::BuildStatus;
use archery_core::distro::{DependencyChannel, Distro, DEFAULT_DEPENDENCY_CHANNEL, DEFAULT_DISTRO};
use archery_core::error::CoreError;
use archery_core::types::{DbId, Timestamp};
use archery_db::models::build::{Build, BuildListQuery, CreateBuild};
use archery_db::repositories::{BuildFilter, BuildLogRepo, BuildRepo};
use archery_worker::CancelOutcome;
use axum::extract::{Path, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

// ---------------------------------------------------------------------------
// DTOs
// ---------------------------------------------------------------------------

/// Request body for `POST /builds`. Empty strings count as absent.
#[derive(Debug, Deserialize)]
pub struct CreateBuildRequest {
    pub repo: String,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub patch: Option<String>,
    #[serde(default)]
    pub distro: Option<String>,
    #[serde(default)]
    pub dependencies: Option<String>,
}

impl CreateBuildRequest {
    /// Apply defaults, reject unknown distros and dependency channels, and
    /// validate field lengths.
    pub fn into_create(self) -> Result<CreateBuild, CoreError> {
        let distro: Distro = match non_empty(self.distro) {
            Some(name) => name.parse()?,
            None => DEFAULT_DISTRO,
        };
        let dependencies: DependencyChannel = match non_empty(self.dependencies) {
            Some(name) => name.parse()?,
            None => DEFAULT_DEPENDENCY_CHANNEL,
        };

        let input = CreateBuild {
            repo: self.repo.trim().to_string(),
            commit: non_empty(self.commit),
            patch: non_empty(self.patch),
            distro: distro.as_str().to_string(),
            dependencies: Some(dependencies.as_str().to_string()),
        };
        input
            .validate()
            .map_err(|e| CoreError::Validation(e.to_string()))?;
        Ok(input)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// A build as shown on the dashboard.
#[derive(Debug, Serialize)]
pub struct BuildView {
    #[serde(flatten)]
    pub build: Build,
    pub status: &'static str,
    /// `h:m:s` between start and end, `-` until both are known.
    pub elapsed: String,
}

impl From<Build> for BuildView {
    fn from(build: Build) -> Self {
        let status = build.status().map_or("unknown", BuildStatus::as_str);
        let elapsed = time_elapsed(build.start_time, build.end_time);
        Self {
            build,
            status,
            elapsed,
        }
    }
}

/// Unpadded `h:m:s` duration between two instants, `-` if either is missing.
pub fn time_elapsed(start: Option<Timestamp>, end: Option<Timestamp>) -> String {
    let (Some(start), Some(end)) = (start, end) else {
        return "-".to_string();
    };
    let secs = (end - start).num_seconds().abs();
    format!("{}:{}:{}", secs / 3600, (secs / 60) % 60, secs % 60)
}

/// Collapse carriage-return progress redraws to the final segment.
pub fn collapse_progress(line: &str) -> &str {
    match line.rfind('\r') {
        Some(pos) => &line[pos + 1..],
        None => line,
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn find_build(pool: &sqlx::PgPool, id: DbId) -> AppResult<Build> {
    BuildRepo::find_by_id(pool, id)
        .await?
        .ok_or(AppError::Core(CoreError::NotFound { entity: "Build", id }))
}

// ---------------------------------------------------------------------------
// List / search
// ---------------------------------------------------------------------------

/// GET /api/v1/builds
///
/// Recent builds, newest first. `q` switches to a repo search; otherwise
/// `status` and `distro` filter the listing window.
pub async fn list_builds(
    State(state): State<AppState>,
    Query(params): Query<BuildListQuery>,
) -> AppResult<impl IntoResponse> {
    let builds = match params.q.as_deref() {
        Some(term) => BuildRepo::search(&state.pool, term).await?,
        None => {
            let status = params
                .status
                .as_deref()
                .filter(|s| !s.is_empty())
                .map(str::parse::<BuildStatus>)
                .transpose()?;
            let filter = BuildFilter {
                status,
                distro: non_empty(params.distro),
                started_after: chrono::Utc::now()
                    - chrono::Duration::days(state.config.build_listing_days),
            };
            BuildRepo::list(&state.pool, &filter).await?
        }
    };

    let data: Vec<BuildView> = builds.into_iter().map(BuildView::from).collect();
    Ok(Json(DataResponse { data }))
}

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

/// POST /api/v1/builds
///
/// Enqueue a build and wake the dispatcher. Returns 201 with the build.
pub async fn create_build(
    State(state): State<AppState>,
    Json(input): Json<CreateBuildRequest>,
) -> AppResult<impl IntoResponse> {
    let input = input.into_create()?;
    let build = BuildRepo::create(&state.pool, &input).await?;

    tracing::info!(
        build_id = build.id,
        repo = %build.repo,
        distro = %build.distro,
        "Build queued",
    );

    let started = state.dispatcher.trigger();
    tracing::debug!(build_id = build.id, started, "Dispatcher triggered");

    Ok((
        StatusCode::CREATED,
        Json(DataResponse {
            data: BuildView::from(build),
        }),
    ))
}

// ---------------------------------------------------------------------------
// Get
// ---------------------------------------------------------------------------

/// GET /api/v1/builds/{id}
pub async fn get_build(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let build = find_build(&state.pool, id).await?;
    Ok(Json(DataResponse {
        data: BuildView::from(build),
    }))
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

/// POST /api/v1/builds/{id}/cancel
///
/// 204 once the build is cancelled or its container has been told to stop.
pub async fn cancel_build(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> AppResult<StatusCode> {
    let outcome = state.dispatcher.cancel(id).await?;

    match outcome {
        CancelOutcome::Cancelled => tracing::info!(build_id = id, "Build cancelled"),
        CancelOutcome::Requested => tracing::info!(build_id = id, "Build stop requested"),
    }

    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Logs / patch
// ---------------------------------------------------------------------------

/// GET /api/v1/builds/{id}/logs
///
/// The stored log as plain text, one stored line per line.
pub async fn build_logs(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let build = find_build(&state.pool, id).await?;
    let lines = BuildLogRepo::list_for_build(&state.pool, build.id).await?;

    let body = lines
        .iter()
        .map(|l| collapse_progress(&l.line))
        .collect::<Vec<_>>()
        .join("\n");

    Ok(([(CONTENT_TYPE, TEXT_PLAIN)], body))
}

/// GET /api/v1/builds/{id}/patch
pub async fn build_patch(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let build = find_build(&state.pool, id).await?;
    let patch = build
        .patch
        .ok_or(AppError::Core(CoreError::NotFound { entity: "Patch", id }))?;

    Ok(([(CONTENT_TYPE, TEXT_PLAIN)], patch))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
