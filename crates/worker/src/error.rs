use archery_core::types::DbId;

use crate::runtime::RuntimeError;
use crate::store::StoreError;

/// Failures surfaced by the dispatcher.
///
/// The first four are per-build failures: they are logged and recorded as
/// the build's `error` status, and never stop the drain loop. The rest are
/// returned to callers of [`Dispatcher::cancel`](crate::Dispatcher::cancel).
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Unknown distro '{0}'")]
    UnknownDistro(String),

    #[error("Failed to acquire image {image}: {source}")]
    ImageAcquisitionFailed {
        image: String,
        #[source]
        source: RuntimeError,
    },

    #[error("Failed to start build container: {0}")]
    ProcessSpawnFailed(#[source] RuntimeError),

    #[error("Build process ended without an exit code")]
    AbnormalExit,

    #[error("Failed to cancel build {id}: {reason}")]
    CancellationFailed { id: DbId, reason: String },

    #[error("Build {0} not found")]
    NotFound(DbId),

    #[error("Build {0} has already finished")]
    AlreadyFinished(DbId),

    #[error(transparent)]
    Store(#[from] StoreError),
}
