//! Shared fixtures for dispatcher tests: an in-memory [`BuildStore`] and a
//! scripted [`ContainerRuntime`].

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use archery_core::build::BuildStatus;
use archery_core::log_stream::OutputChannel;
use archery_core::params::container_name;
use archery_core::types::DbId;
use archery_db::models::build::Build;
use archery_events::EventBus;
use archery_worker::{
    BuildStore, ContainerProcess, ContainerRuntime, Dispatcher, ProcessEvent, RunSpec,
    RuntimeError, StoreError,
};
use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    builds: Mutex<BTreeMap<DbId, Build>>,
    logs: Mutex<Vec<(DbId, OutputChannel, String)>>,
    next_id: Mutex<DbId>,
    fail_dequeue: Mutex<bool>,
    fail_finish: Mutex<usize>,
    transitions: Mutex<Vec<(DbId, BuildStatus)>>,
}

impl MemoryStore {
    /// Enqueue a build for `distro`; returns its id.
    pub fn enqueue(&self, distro: &str) -> DbId {
        self.insert(distro, BuildStatus::Queued)
    }

    pub fn insert(&self, distro: &str, status: BuildStatus) -> DbId {
        let mut next_id = self.next_id.lock().unwrap();
        *next_id += 1;
        let id = *next_id;
        let build = Build {
            id,
            repo: format!("https://aur.archlinux.org/pkg-{id}.git"),
            commit: None,
            patch: None,
            distro: distro.to_string(),
            dependencies: Some("stable".to_string()),
            status_id: status.id(),
            container_name: None,
            pid: None,
            start_time: None,
            end_time: None,
            created_at: chrono::Utc::now(),
        };
        self.builds.lock().unwrap().insert(id, build);
        id
    }

    pub fn status(&self, id: DbId) -> BuildStatus {
        self.builds.lock().unwrap()[&id]
            .status()
            .expect("known status")
    }

    pub fn build(&self, id: DbId) -> Build {
        self.builds.lock().unwrap()[&id].clone()
    }

    pub fn logs(&self, id: DbId) -> Vec<(OutputChannel, String)> {
        self.logs
            .lock()
            .unwrap()
            .iter()
            .filter(|(build_id, _, _)| *build_id == id)
            .map(|(_, channel, line)| (*channel, line.clone()))
            .collect()
    }

    pub fn set_fail_dequeue(&self, fail: bool) {
        *self.fail_dequeue.lock().unwrap() = fail;
    }

    /// Reject the next `times` terminal status writes.
    pub fn fail_next_finishes(&self, times: usize) {
        *self.fail_finish.lock().unwrap() = times;
    }

    /// Every status change the store accepted, in order.
    pub fn transitions(&self) -> Vec<(DbId, BuildStatus)> {
        self.transitions.lock().unwrap().clone()
    }
}

#[async_trait]
impl BuildStore for MemoryStore {
    async fn dequeue_next_queued(&self) -> Result<Option<Build>, StoreError> {
        if *self.fail_dequeue.lock().unwrap() {
            return Err(StoreError::Unavailable("dequeue disabled".into()));
        }
        Ok(self
            .builds
            .lock()
            .unwrap()
            .values()
            .find(|b| b.status() == Some(BuildStatus::Queued))
            .cloned())
    }

    async fn mark_running(
        &self,
        id: DbId,
        container_name: &str,
        pid: Option<u32>,
    ) -> Result<bool, StoreError> {
        let mut builds = self.builds.lock().unwrap();
        let Some(build) = builds.get_mut(&id) else {
            return Ok(false);
        };
        if !build
            .status()
            .is_some_and(|current| current.can_transition_to(BuildStatus::Running))
        {
            return Ok(false);
        }
        build.status_id = BuildStatus::Running.id();
        self.transitions.lock().unwrap().push((id, BuildStatus::Running));
        build.container_name = Some(container_name.to_string());
        build.pid = pid.map(|p| p as i32);
        build.start_time = Some(chrono::Utc::now());
        Ok(true)
    }

    async fn mark_finished(&self, id: DbId, status: BuildStatus) -> Result<bool, StoreError> {
        {
            let mut fail_finish = self.fail_finish.lock().unwrap();
            if *fail_finish > 0 {
                *fail_finish -= 1;
                return Err(StoreError::Unavailable("finish write rejected".into()));
            }
        }

        let mut builds = self.builds.lock().unwrap();
        let Some(build) = builds.get_mut(&id) else {
            return Ok(false);
        };
        if !build
            .status()
            .is_some_and(|current| current.can_transition_to(status))
        {
            return Ok(false);
        }
        build.status_id = status.id();
        self.transitions.lock().unwrap().push((id, status));
        build.end_time = Some(chrono::Utc::now());
        Ok(true)
    }

    async fn append_log_line(
        &self,
        id: DbId,
        channel: OutputChannel,
        line: &str,
    ) -> Result<(), StoreError> {
        self.logs
            .lock()
            .unwrap()
            .push((id, channel, line.to_string()));
        Ok(())
    }

    async fn get_build(&self, id: DbId) -> Result<Option<Build>, StoreError> {
        Ok(self.builds.lock().unwrap().get(&id).cloned())
    }
}

// ---------------------------------------------------------------------------
// ScriptedRuntime
// ---------------------------------------------------------------------------

/// What a container does once started.
#[derive(Debug, Clone)]
pub struct Script {
    pub output: Vec<(OutputChannel, Vec<u8>)>,
    /// Exit code sent after the output. Ignored when `hold` is set.
    pub exit: Option<Option<i32>>,
    /// Keep the container alive until it is stopped or released.
    pub hold: bool,
}

impl Script {
    pub fn exit(code: i32) -> Self {
        Self {
            output: Vec::new(),
            exit: Some(Some(code)),
            hold: false,
        }
    }

    pub fn held() -> Self {
        Self {
            output: Vec::new(),
            exit: None,
            hold: true,
        }
    }

    /// Output then end the stream without an exit code.
    pub fn vanish() -> Self {
        Self {
            output: Vec::new(),
            exit: None,
            hold: false,
        }
    }

    pub fn with_output(mut self, channel: OutputChannel, data: &str) -> Self {
        self.output.push((channel, data.as_bytes().to_vec()));
        self
    }
}

/// Exit code a stopped container reports.
pub const STOPPED_EXIT_CODE: i32 = 137;

#[derive(Default)]
pub struct ScriptedRuntime {
    scripts: Mutex<HashMap<String, Script>>,
    pull_results: Mutex<VecDeque<bool>>,
    pull_gate: Mutex<Option<Arc<Notify>>>,
    fail_run: Mutex<HashSet<String>>,
    fail_stop: Mutex<HashSet<String>>,
    live: Mutex<HashMap<String, mpsc::Sender<ProcessEvent>>>,
    pulls: Mutex<Vec<String>>,
    launched: Mutex<Vec<RunSpec>>,
    stopped: Mutex<Vec<String>>,
}

impl ScriptedRuntime {
    /// Script the container of build `id`. Unscripted builds exit 0.
    pub fn script(&self, id: DbId, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert(container_name(id), script);
    }

    /// Results of the next `pull` calls, in order. Further pulls succeed.
    pub fn pull_results(&self, results: &[bool]) {
        self.pull_results.lock().unwrap().extend(results);
    }

    /// Block every `pull` until the returned gate is notified.
    pub fn gate_pulls(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.pull_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn fail_run(&self, id: DbId) {
        self.fail_run.lock().unwrap().insert(container_name(id));
    }

    /// Make `stop` fail for build `id` while leaving its container running.
    pub fn fail_stop(&self, id: DbId) {
        self.fail_stop.lock().unwrap().insert(container_name(id));
    }

    /// Register a live container not started through this runtime.
    pub fn adopt(&self, id: DbId) {
        let (tx, _rx) = mpsc::channel(1);
        self.live.lock().unwrap().insert(container_name(id), tx);
    }

    /// Let a held container exit with `code`.
    pub async fn release(&self, id: DbId, code: i32) {
        let tx = self.live.lock().unwrap().remove(&container_name(id));
        if let Some(tx) = tx {
            let _ = tx.send(ProcessEvent::Exited(Some(code))).await;
        }
    }

    pub fn pull_count(&self) -> usize {
        self.pulls.lock().unwrap().len()
    }

    pub fn launched(&self) -> Vec<String> {
        self.launched
            .lock()
            .unwrap()
            .iter()
            .map(|spec| spec.name.clone())
            .collect()
    }

    pub fn launched_spec(&self, id: DbId) -> Option<RunSpec> {
        let name = container_name(id);
        self.launched
            .lock()
            .unwrap()
            .iter()
            .find(|spec| spec.name == name)
            .cloned()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().unwrap().clone()
    }

    pub fn is_live(&self, id: DbId) -> bool {
        self.live.lock().unwrap().contains_key(&container_name(id))
    }
}

fn cli_failure(command: &str) -> RuntimeError {
    RuntimeError::CommandFailed {
        command: command.to_string(),
        code: Some(1),
        stderr: "scripted failure".to_string(),
    }
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        self.pulls.lock().unwrap().push(image.to_string());

        let gate = self.pull_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let ok = self.pull_results.lock().unwrap().pop_front().unwrap_or(true);
        if ok {
            Ok(())
        } else {
            Err(cli_failure("docker pull"))
        }
    }

    async fn run(&self, spec: RunSpec) -> Result<ContainerProcess, RuntimeError> {
        if self.fail_run.lock().unwrap().contains(&spec.name) {
            return Err(RuntimeError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "scripted spawn failure",
            )));
        }

        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&spec.name)
            .cloned()
            .unwrap_or_else(|| Script::exit(0));
        self.launched.lock().unwrap().push(spec.clone());

        let (tx, rx) = mpsc::channel(64);
        for (channel, data) in script.output {
            let _ = tx.send(ProcessEvent::Output { channel, data }).await;
        }

        if script.hold {
            self.live.lock().unwrap().insert(spec.name, tx);
        } else if let Some(code) = script.exit {
            let _ = tx.send(ProcessEvent::Exited(code)).await;
        }

        Ok(ContainerProcess {
            pid: Some(4242),
            events: rx,
        })
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        if self.fail_stop.lock().unwrap().contains(name) {
            return Err(cli_failure("docker stop"));
        }
        let tx = self.live.lock().unwrap().remove(name);
        let Some(tx) = tx else {
            return Err(cli_failure("docker stop"));
        };
        self.stopped.lock().unwrap().push(name.to_string());
        let _ = tx.send(ProcessEvent::Exited(Some(STOPPED_EXIT_CODE))).await;
        Ok(())
    }

    async fn list(&self, name: &str) -> Result<Vec<String>, RuntimeError> {
        Ok(self
            .live
            .lock()
            .unwrap()
            .keys()
            .filter(|live| *live == name)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub runtime: Arc<ScriptedRuntime>,
    pub events: Arc<EventBus>,
    pub dispatcher: Dispatcher,
}

pub fn harness() -> Harness {
    let store = Arc::new(MemoryStore::default());
    let runtime = Arc::new(ScriptedRuntime::default());
    let events = Arc::new(EventBus::default());
    let dispatcher = Dispatcher::new(
        Arc::clone(&store) as Arc<dyn BuildStore>,
        Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
        Arc::clone(&events),
    );
    Harness {
        store,
        runtime,
        events,
        dispatcher,
    }
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait for the dispatcher to go idle, failing the test after five seconds.
pub async fn settle(dispatcher: &Dispatcher) {
    tokio::time::timeout(Duration::from_secs(5), dispatcher.wait_idle())
        .await
        .expect("dispatcher did not go idle");
}
