//! Archery build dispatcher.
//!
//! Drains the persistent build queue one job at a time, drives each build's
//! container through the [`runtime::ContainerRuntime`] boundary and
//! republishes its output on the [`archery_events::EventBus`].
//!
//! Storage is reached only through the narrow [`store::BuildStore`]
//! contract so the dispatcher can be exercised without a database.

pub mod config;
pub mod dispatcher;
pub mod docker;
pub mod error;
pub mod runtime;
pub mod store;

pub use config::DispatcherConfig;
pub use dispatcher::{CancelOutcome, Dispatcher};
pub use docker::DockerCli;
pub use error::DispatchError;
pub use runtime::{ContainerProcess, ContainerRuntime, ProcessEvent, RunSpec, RuntimeError};
pub use store::{BuildStore, PgBuildStore, StoreError};
