//! [`ContainerRuntime`] implemented on top of the `docker` CLI.
//!
//! Short commands (`pull`, `stop`, `ps`) are run to completion and their
//! exit status checked. `run` is streamed: stdout and stderr are read in
//! spawned tasks and forwarded as raw chunks, followed by the exit code
//! once both streams have closed.

use std::process::Stdio;

use archery_core::log_stream::OutputChannel;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::runtime::{ContainerProcess, ContainerRuntime, ProcessEvent, RunSpec, RuntimeError};

/// Capacity of the per-container event channel.
///
/// Bounded so a slow consumer back-pressures the pipe readers instead of
/// buffering an entire build log in memory.
const EVENT_BUFFER: usize = 256;

/// Read size for container output.
const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Docker CLI wrapper.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run a short CLI command to completion and return its stdout.
    async fn exec(&self, args: &[&str]) -> Result<String, RuntimeError> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(RuntimeError::CommandFailed {
                command: format!("{} {}", self.binary, args.join(" ")),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        tracing::debug!(image, "Pulling image");
        self.exec(&["pull", image]).await?;
        Ok(())
    }

    async fn run(&self, spec: RunSpec) -> Result<ContainerProcess, RuntimeError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(run_args(&spec));
        spawn_streaming(cmd)
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        self.exec(&["stop", name]).await?;
        Ok(())
    }

    async fn list(&self, name: &str) -> Result<Vec<String>, RuntimeError> {
        let filter = format!("name=^{name}$");
        let stdout = self
            .exec(&["ps", "--filter", &filter, "--format", "{{.Names}}"])
            .await?;
        Ok(matching_names(&stdout, name))
    }
}

/// Arguments for `docker run`, e.g.
/// `run --rm -e REPO=… -e DEP=… --name archery-build-7 corysanin/archery:arch`.
fn run_args(spec: &RunSpec) -> Vec<String> {
    let mut args = vec!["run".to_string(), "--rm".to_string()];
    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push("--name".to_string());
    args.push(spec.name.clone());
    args.push(spec.image.clone());
    args
}

/// `docker ps --filter name=` matches substrings even when anchored on
/// some engines, so the output is filtered again for an exact match.
fn matching_names(stdout: &str, name: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| *line == name)
        .map(str::to_string)
        .collect()
}

/// Spawn `cmd` with piped output and stream it as [`ProcessEvent`]s.
fn spawn_streaming(mut cmd: Command) -> Result<ContainerProcess, RuntimeError> {
    // `kill_on_drop(true)` ties the CLI process to the waiter task below.
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;
    let pid = child.id();

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);

    let stdout_task = tokio::spawn(forward_stream(
        child.stdout.take(),
        OutputChannel::Std,
        tx.clone(),
    ));
    let stderr_task = tokio::spawn(forward_stream(
        child.stderr.take(),
        OutputChannel::Err,
        tx.clone(),
    ));

    tokio::spawn(async move {
        // Exit is reported only after every chunk has been forwarded.
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        let code = match child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to wait for container process");
                None
            }
        };
        let _ = tx.send(ProcessEvent::Exited(code)).await;
    });

    Ok(ContainerProcess { pid, events: rx })
}

/// Forward one output stream chunk by chunk until EOF or until the
/// receiver goes away.
async fn forward_stream<R: AsyncRead + Unpin>(
    handle: Option<R>,
    channel: OutputChannel,
    tx: mpsc::Sender<ProcessEvent>,
) {
    let Some(mut reader) = handle else {
        return;
    };
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let event = ProcessEvent::Output {
                    channel,
                    data: buf[..n].to_vec(),
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "Container output read failed");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
