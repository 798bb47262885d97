//! Archery domain logic.
//!
//! Everything in this crate is pure (no database, no subprocesses) so the
//! dispatcher and the web layer can share it and test it in isolation.

pub mod build;
pub mod distro;
pub mod error;
pub mod log_stream;
pub mod params;
pub mod types;
