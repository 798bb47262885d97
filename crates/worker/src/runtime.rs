//! Container runtime boundary.
//!
//! Mirrors a container CLI: pull an image, run a named container, stop it,
//! list containers by name. [`DockerCli`](crate::DockerCli) is the real
//! implementation; tests script their own.

use archery_core::log_stream::OutputChannel;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Everything needed to start one build container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    pub image: String,
    /// Deterministic container name; the handle used to stop it later.
    pub name: String,
    pub env: Vec<(String, String)>,
}

/// Output of a running container, in the order it was read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// A raw chunk of output. Not necessarily line-aligned.
    Output {
        channel: OutputChannel,
        data: Vec<u8>,
    },
    /// The process ended. Sent once, after both streams are drained.
    /// `None` when it was killed by a signal.
    Exited(Option<i32>),
}

/// A launched container.
#[derive(Debug)]
pub struct ContainerProcess {
    pub pid: Option<u32>,
    pub events: mpsc::Receiver<ProcessEvent>,
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("`{command}` exited with {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Make `image` available locally.
    async fn pull(&self, image: &str) -> Result<(), RuntimeError>;

    /// Start a container. Returns once the process is spawned; output and
    /// the exit code arrive on [`ContainerProcess::events`].
    async fn run(&self, spec: RunSpec) -> Result<ContainerProcess, RuntimeError>;

    /// Ask the container named `name` to stop.
    async fn stop(&self, name: &str) -> Result<(), RuntimeError>;

    /// Names of live containers exactly matching `name`.
    async fn list(&self, name: &str) -> Result<Vec<String>, RuntimeError>;
}
