//! Build entity model and DTOs.

use archery_core::build::{BuildStatus, StatusId};
use archery_core::params::BuildParams;
use archery_core::types::{DbId, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

/// A row from the `builds` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Build {
    pub id: DbId,
    pub repo: String,
    pub commit: Option<String>,
    pub patch: Option<String>,
    pub distro: String,
    pub dependencies: Option<String>,
    pub status_id: StatusId,
    pub container_name: Option<String>,
    pub pid: Option<i32>,
    pub start_time: Option<Timestamp>,
    pub end_time: Option<Timestamp>,
    pub created_at: Timestamp,
}

impl Build {
    /// Decoded status, or `None` if the row carries an unknown status id.
    pub fn status(&self) -> Option<BuildStatus> {
        BuildStatus::from_id(self.status_id)
    }

    /// The parameters passed to the builder container.
    pub fn params(&self) -> BuildParams {
        BuildParams {
            repo: self.repo.clone(),
            commit: self.commit.clone(),
            patch: self.patch.clone(),
            dependencies: self.dependencies.clone(),
        }
    }
}

/// DTO for enqueuing a new build.
///
/// Optional fields should already be normalized (empty strings mapped to
/// `None`) by the caller.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateBuild {
    #[validate(length(min = 1, max = 2048))]
    pub repo: String,
    #[validate(length(min = 1, max = 256))]
    pub commit: Option<String>,
    #[validate(length(min = 1, max = 1_048_576))]
    pub patch: Option<String>,
    #[validate(length(min = 1, max = 32))]
    pub distro: String,
    #[validate(length(min = 1, max = 32))]
    pub dependencies: Option<String>,
}

/// Filters for listing builds on the dashboard.
#[derive(Debug, Default, Deserialize)]
pub struct BuildListQuery {
    pub status: Option<String>,
    pub distro: Option<String>,
    /// Case-insensitive repo substring; switches the listing to a search.
    pub q: Option<String>,
}
