//! Build parameter → container environment mapping.
//!
//! `REPO` is always set. `DEP`, `COMMIT` and `PATCH` are set only when the
//! build carries a non-empty value; the builder image treats an absent
//! variable and an empty one differently, so empty strings are never passed.

use crate::types::DbId;

/// Prefix of every build container name.
pub const CONTAINER_NAME_PREFIX: &str = "archery-build-";

pub const ENV_REPO: &str = "REPO";
pub const ENV_DEPENDENCIES: &str = "DEP";
pub const ENV_COMMIT: &str = "COMMIT";
pub const ENV_PATCH: &str = "PATCH";

/// Deterministic container name for a build.
///
/// Derived from the id alone so a running build can be located after the
/// process that launched it has restarted.
pub fn container_name(build_id: DbId) -> String {
    format!("{CONTAINER_NAME_PREFIX}{build_id}")
}

/// The parameters of a build that reach the builder image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildParams {
    pub repo: String,
    pub commit: Option<String>,
    pub patch: Option<String>,
    pub dependencies: Option<String>,
}

impl BuildParams {
    /// Environment variables for the build container, in a stable order.
    pub fn env(&self) -> Vec<(String, String)> {
        let mut env = vec![(ENV_REPO.to_string(), self.repo.clone())];
        let optional = [
            (ENV_DEPENDENCIES, &self.dependencies),
            (ENV_COMMIT, &self.commit),
            (ENV_PATCH, &self.patch),
        ];
        for (key, value) in optional {
            if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
                env.push((key.to_string(), value.to_string()));
            }
        }
        env
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
