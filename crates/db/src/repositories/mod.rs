//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async methods that
//! accept `&PgPool` as the first argument.

pub mod build_log_repo;
pub mod build_repo;

pub use build_log_repo::BuildLogRepo;
pub use build_repo::{BuildFilter, BuildRepo};
