//! Single-flight build queue dispatcher.
//!
//! [`Dispatcher::trigger`] starts a drain task unless one is already
//! running. The drain claims the oldest queued build, runs its container to
//! completion, records the terminal status and moves on, until the queue is
//! empty. A failure in one build is recorded as that build's `error` status
//! and never stops the drain. The next build is only claimed once the
//! previous terminal status has been written.
//!
//! Run state shared with [`Dispatcher::cancel`] lives behind one async
//! mutex. Claiming a build, recording `running` and cancelling all happen
//! under it, so a cancel either sees the build still queued in the store or
//! sees it as the current build.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use archery_core::build::BuildStatus;
use archery_core::distro::Distro;
use archery_core::log_stream::{LogMultiplexer, OutputChannel};
use archery_core::params::container_name;
use archery_core::types::DbId;
use archery_db::models::build::Build;
use archery_events::{BuildEvent, EventBus};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::DispatchError;
use crate::runtime::{ContainerRuntime, ProcessEvent, RunSpec};
use crate::store::{BuildStore, StoreError};

/// First delay before retrying a rejected terminal status write.
const FINISH_RETRY_INITIAL: Duration = Duration::from_millis(50);
/// Upper bound for the retry delay.
const FINISH_RETRY_MAX: Duration = Duration::from_secs(10);

/// Result of a successful [`Dispatcher::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The build is now `cancelled`.
    Cancelled,
    /// The build belongs to the running drain; it will finish `cancelled`
    /// once its container has stopped.
    Requested,
}

#[derive(Debug, Default)]
struct RunState {
    current: Option<DbId>,
    cancel_requested: bool,
}

struct Inner {
    store: Arc<dyn BuildStore>,
    runtime: Arc<dyn ContainerRuntime>,
    events: Arc<EventBus>,
    busy: watch::Sender<bool>,
    /// Set by every `trigger`; a drain that finds the queue empty only
    /// stops if no trigger arrived since its last dequeue.
    wake: AtomicBool,
    run: Mutex<RunState>,
}

/// Build queue dispatcher. Cheap to clone; clones share one queue drain.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn BuildStore>,
        runtime: Arc<dyn ContainerRuntime>,
        events: Arc<EventBus>,
    ) -> Self {
        let (busy, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                store,
                runtime,
                events,
                busy,
                wake: AtomicBool::new(false),
                run: Mutex::new(RunState::default()),
            }),
        }
    }

    /// Start draining the queue.
    ///
    /// Returns `true` if this call started a drain, `false` if one was
    /// already running (it will reach any newly queued build).
    pub fn trigger(&self) -> bool {
        self.inner.wake.store(true, Ordering::SeqCst);

        let started = self.inner.busy.send_if_modified(|busy| {
            if *busy {
                false
            } else {
                *busy = true;
                true
            }
        });

        if started {
            let this = self.clone();
            tokio::spawn(async move { this.drain().await });
        }
        started
    }

    /// Whether a drain is in progress.
    pub fn is_busy(&self) -> bool {
        *self.inner.busy.borrow()
    }

    /// Resolve once no drain is running.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.busy.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|busy| !*busy).await;
    }

    /// Periodically call [`trigger`](Self::trigger) until `cancel` fires.
    ///
    /// The first tick is immediate, which also resumes builds left queued
    /// by a previous process.
    pub async fn run_sweep(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        tracing::info!(
            interval_secs = interval.as_secs(),
            "Dispatcher sweep started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Dispatcher sweep stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if self.trigger() {
                        tracing::debug!("Sweep started a queue drain");
                    }
                }
            }
        }
    }

    /// Cancel a build.
    ///
    /// A queued build is marked `cancelled` directly. A running build is
    /// stopped by its container name; the drain then records `cancelled`
    /// when the container exits. If the container cannot be found or
    /// stopped the build is left as it was.
    pub async fn cancel(&self, id: DbId) -> Result<CancelOutcome, DispatchError> {
        let mut run = self.inner.run.lock().await;

        let build = self
            .inner
            .store
            .get_build(id)
            .await?
            .ok_or(DispatchError::NotFound(id))?;
        let Some(status) = build.status() else {
            return Err(DispatchError::CancellationFailed {
                id,
                reason: format!("unknown status id {}", build.status_id),
            });
        };
        if !status.can_transition_to(BuildStatus::Cancelled) {
            return Err(DispatchError::AlreadyFinished(id));
        }

        let name = container_name(id);

        if run.current == Some(id) {
            run.cancel_requested = true;
            if status == BuildStatus::Queued {
                // Claimed but not launched: the drain checks the flag before
                // and right after starting the container.
                tracing::info!(build_id = id, "Cancellation requested before launch");
                return Ok(CancelOutcome::Requested);
            }
            drop(run);

            if let Err(e) = self.stop_by_identity(id, &name).await {
                let mut run = self.inner.run.lock().await;
                if run.current == Some(id) {
                    run.cancel_requested = false;
                }
                tracing::warn!(build_id = id, error = %e, "Cancellation failed");
                return Err(e);
            }
            tracing::info!(build_id = id, container = %name, "Cancellation requested");
            return Ok(CancelOutcome::Requested);
        }

        if status == BuildStatus::Queued {
            if !self.complete(id, BuildStatus::Cancelled, 0).await? {
                return Err(DispatchError::AlreadyFinished(id));
            }
            return Ok(CancelOutcome::Cancelled);
        }

        // Running, but not by this process: left over from before a restart.
        drop(run);
        if let Err(e) = self.stop_by_identity(id, &name).await {
            tracing::warn!(build_id = id, error = %e, "Cancellation of orphaned build failed");
            return Err(e);
        }
        // Lines of the previous process are not counted; watchers reload
        // them from the store.
        self.complete(id, BuildStatus::Cancelled, 0).await?;
        Ok(CancelOutcome::Cancelled)
    }

    // -----------------------------------------------------------------------
    // Drain loop
    // -----------------------------------------------------------------------

    async fn drain(&self) {
        tracing::debug!("Build queue drain started");

        loop {
            self.inner.wake.store(false, Ordering::SeqCst);

            let next = {
                let mut run = self.inner.run.lock().await;
                match self.inner.store.dequeue_next_queued().await {
                    Ok(Some(build)) => {
                        run.current = Some(build.id);
                        run.cancel_requested = false;
                        Some(build)
                    }
                    Ok(None) => None,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to fetch next queued build");
                        drop(run);
                        self.inner.busy.send_replace(false);
                        return;
                    }
                }
            };

            let Some(build) = next else {
                let stopped = self.inner.busy.send_if_modified(|busy| {
                    if self.inner.wake.swap(false, Ordering::SeqCst) {
                        false
                    } else {
                        *busy = false;
                        true
                    }
                });
                if stopped {
                    break;
                }
                continue;
            };

            let id = build.id;
            let (status, line_count) = self.process(build).await;
            self.record_result(id, status, line_count).await;
            *self.inner.run.lock().await = RunState::default();
        }

        tracing::debug!("Build queue drain finished");
    }

    /// Run one build to completion. Returns its terminal status and the
    /// number of output lines it produced.
    async fn process(&self, build: Build) -> (BuildStatus, u64) {
        let id = build.id;
        tracing::info!(
            build_id = id,
            repo = %build.repo,
            distro = %build.distro,
            "Build claimed",
        );

        let mut line_count = 0;
        let status = match self.execute(&build, &mut line_count).await {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(build_id = id, error = %e, "Build failed");
                let cancel_requested = self.inner.run.lock().await.cancel_requested;
                BuildStatus::from_exit(None, cancel_requested)
            }
        };
        (status, line_count)
    }

    /// Write the terminal status, retrying with backoff until the store
    /// accepts it. The build stays current meanwhile, so no other build is
    /// claimed while this one is still `running` in the store.
    async fn record_result(&self, id: DbId, status: BuildStatus, line_count: u64) {
        let mut delay = FINISH_RETRY_INITIAL;
        loop {
            match self.complete(id, status, line_count).await {
                Ok(_) => return,
                Err(e) => {
                    tracing::error!(
                        build_id = id,
                        status = %status,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Failed to record build result",
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(FINISH_RETRY_MAX);
                }
            }
        }
    }

    async fn execute(
        &self,
        build: &Build,
        line_count: &mut u64,
    ) -> Result<BuildStatus, DispatchError> {
        let id = build.id;
        let distro: Distro = build
            .distro
            .parse()
            .map_err(|_| DispatchError::UnknownDistro(build.distro.clone()))?;
        let image = distro.image();

        self.inner
            .runtime
            .pull(image)
            .await
            .map_err(|source| DispatchError::ImageAcquisitionFailed {
                image: image.to_string(),
                source,
            })?;
        tracing::info!(build_id = id, image, "Image ready");

        if self.inner.run.lock().await.cancel_requested {
            tracing::info!(build_id = id, "Build cancelled before launch");
            return Ok(BuildStatus::Cancelled);
        }

        let name = container_name(id);
        let process = self
            .inner
            .runtime
            .run(RunSpec {
                image: image.to_string(),
                name: name.clone(),
                env: build.params().env(),
            })
            .await
            .map_err(DispatchError::ProcessSpawnFailed)?;

        let stop_now = {
            let mut run = self.inner.run.lock().await;
            let marked = match self.inner.store.mark_running(id, &name, process.pid).await {
                Ok(marked) => marked,
                Err(e) => {
                    drop(run);
                    self.stop_quietly(id, &name).await;
                    return Err(e.into());
                }
            };
            if !marked {
                tracing::warn!(build_id = id, "Build left the queue while launching");
            }
            run.cancel_requested |= !marked;
            run.cancel_requested
        };

        tracing::info!(
            build_id = id,
            container = %name,
            pid = ?process.pid,
            "Build container started",
        );

        if stop_now {
            self.stop_quietly(id, &name).await;
        }

        let mut events = process.events;
        let mut mux = LogMultiplexer::new();
        let mut exit = None;

        while let Some(event) = events.recv().await {
            match event {
                ProcessEvent::Output { channel, data } => {
                    for line in mux.push(channel, &data) {
                        self.emit_line(id, line_count, channel, line).await;
                    }
                }
                ProcessEvent::Exited(code) => {
                    exit = Some(code);
                    break;
                }
            }
        }
        for (channel, line) in mux.finish() {
            self.emit_line(id, line_count, channel, line).await;
        }

        let cancel_requested = self.inner.run.lock().await.cancel_requested;
        match exit {
            Some(code) => {
                tracing::debug!(build_id = id, exit_code = ?code, "Build container exited");
                Ok(BuildStatus::from_exit(code, cancel_requested))
            }
            None if cancel_requested => Ok(BuildStatus::Cancelled),
            None => Err(DispatchError::AbnormalExit),
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Persist one output line, then publish it as line number `seq` and
    /// advance `seq`. A failed write is logged; live subscribers still
    /// receive the line.
    async fn emit_line(&self, id: DbId, seq: &mut u64, channel: OutputChannel, line: String) {
        if let Err(e) = self.inner.store.append_log_line(id, channel, &line).await {
            tracing::error!(build_id = id, channel = %channel, error = %e, "Failed to store log line");
        }
        self.inner.events.publish(BuildEvent::line(id, *seq, channel, line));
        *seq += 1;
    }

    /// Record a terminal status and announce it. The `finish` event is only
    /// published if this call performed the transition.
    async fn complete(
        &self,
        id: DbId,
        status: BuildStatus,
        line_count: u64,
    ) -> Result<bool, StoreError> {
        let applied = self.inner.store.mark_finished(id, status).await?;
        if applied {
            tracing::info!(build_id = id, status = %status, line_count, "Build finished");
            self.inner
                .events
                .publish(BuildEvent::finish(id, status, line_count));
        } else {
            tracing::debug!(build_id = id, status = %status, "Build already finished, status kept");
        }
        Ok(applied)
    }

    /// Locate the container by name and stop it.
    async fn stop_by_identity(&self, id: DbId, name: &str) -> Result<(), DispatchError> {
        let failed = |reason: String| DispatchError::CancellationFailed { id, reason };

        let live = self
            .inner
            .runtime
            .list(name)
            .await
            .map_err(|e| failed(e.to_string()))?;
        if live.is_empty() {
            return Err(failed(format!("no running container named {name}")));
        }

        self.inner
            .runtime
            .stop(name)
            .await
            .map_err(|e| failed(e.to_string()))
    }

    async fn stop_quietly(&self, id: DbId, name: &str) {
        if let Err(e) = self.inner.runtime.stop(name).await {
            tracing::warn!(build_id = id, container = %name, error = %e, "Failed to stop container");
        }
    }
}
