//! Shared fakes for drowse-core integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use drowse_core::{Lifecycle, ManualClock, StatePaths, StateStore};
use drowse_vm::{
    BackendError, ContainerRuntime, ContainerSpec, ExecOutput, LiveStatus, VmConfig, VmSupervisor,
};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

/// VM supervisor that flips an in-memory status.
#[derive(Debug)]
pub struct FakeSupervisor {
    pub status: Mutex<LiveStatus>,
    pub starts: Mutex<u32>,
    pub stops: Mutex<u32>,
}

impl FakeSupervisor {
    pub fn new(status: LiveStatus) -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(status),
            starts: Mutex::new(0),
            stops: Mutex::new(0),
        })
    }

    pub fn starts(&self) -> u32 {
        *self.starts.lock().unwrap()
    }

    pub fn stops(&self) -> u32 {
        *self.stops.lock().unwrap()
    }
}

#[async_trait]
impl VmSupervisor for FakeSupervisor {
    fn instance(&self) -> &str {
        "drowse"
    }

    async fn exists(&self) -> drowse_vm::Result<bool> {
        Ok(*self.status.lock().unwrap() != LiveStatus::Unknown)
    }

    async fn live_status(&self) -> drowse_vm::Result<LiveStatus> {
        Ok(*self.status.lock().unwrap())
    }

    async fn start(&self, _config: &VmConfig) -> drowse_vm::Result<()> {
        *self.starts.lock().unwrap() += 1;
        *self.status.lock().unwrap() = LiveStatus::Running;
        Ok(())
    }

    async fn stop(&self) -> drowse_vm::Result<()> {
        *self.stops.lock().unwrap() += 1;
        *self.status.lock().unwrap() = LiveStatus::Stopped;
        Ok(())
    }
}

/// Container runtime that records calls.
#[derive(Debug, Default)]
pub struct FakeRuntime {
    pub running: Mutex<BTreeSet<String>>,
    pub known: Mutex<BTreeSet<String>>,
    pub stop_calls: Mutex<Vec<String>>,
    pub launched: Mutex<Vec<ContainerSpec>>,
    pub execs: Mutex<Vec<(String, Vec<String>)>>,
    pub fail_run: Mutex<bool>,
    pub fail_stop: Mutex<bool>,
    /// When set, the next `run_detached` parks on it after claiming the name.
    pub run_gate: Mutex<Option<Arc<Notify>>>,
    /// Notified when a `run_detached` parks on the gate.
    pub run_parked: Notify,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Pretend `name` exists and is running.
    pub fn add_running(&self, name: &str) {
        self.known.lock().unwrap().insert(name.to_string());
        self.running.lock().unwrap().insert(name.to_string());
    }

    pub fn stop_calls(&self) -> Vec<String> {
        self.stop_calls.lock().unwrap().clone()
    }

    /// Park the next launch until the returned gate is notified.
    pub fn hold_next_run(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.run_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn knows(&self, name: &str) -> bool {
        self.known.lock().unwrap().contains(name)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_running_names(&self) -> drowse_vm::Result<Vec<String>> {
        Ok(self.running.lock().unwrap().iter().cloned().collect())
    }

    async fn stop_by_name(&self, name: &str) -> drowse_vm::Result<()> {
        self.stop_calls.lock().unwrap().push(name.to_string());
        if *self.fail_stop.lock().unwrap() {
            return Err(BackendError::Failed("stop refused".into()));
        }
        if !self.known.lock().unwrap().contains(name) {
            return Err(BackendError::NoSuchContainer(name.to_string()));
        }
        self.running.lock().unwrap().remove(name);
        Ok(())
    }

    async fn run_detached(&self, spec: &ContainerSpec) -> drowse_vm::Result<()> {
        if *self.fail_run.lock().unwrap() {
            return Err(BackendError::CommandFailed {
                command: "podman run".into(),
                code: Some(125),
                stderr: "image not known".into(),
            });
        }
        let claimed = self.known.lock().unwrap().insert(spec.name.clone());
        if !claimed {
            return Err(BackendError::CommandFailed {
                command: "podman run".into(),
                code: Some(125),
                stderr: format!("the container name \"{}\" is already in use", spec.name),
            });
        }
        let gate = self.run_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            self.run_parked.notify_one();
            gate.notified().await;
        }
        self.launched.lock().unwrap().push(spec.clone());
        self.running.lock().unwrap().insert(spec.name.clone());
        Ok(())
    }

    async fn remove(&self, name: &str, _force: bool) -> drowse_vm::Result<()> {
        if !self.known.lock().unwrap().remove(name) {
            return Err(BackendError::NoSuchContainer(name.to_string()));
        }
        self.running.lock().unwrap().remove(name);
        Ok(())
    }

    async fn exec(&self, name: &str, argv: &[String]) -> drowse_vm::Result<ExecOutput> {
        self.execs
            .lock()
            .unwrap()
            .push((name.to_string(), argv.to_vec()));
        Ok(ExecOutput {
            exit_code: 0,
            stdout: "ok\n".into(),
            stderr: String::new(),
        })
    }

    async fn exec_interactive(&self, name: &str, argv: &[String]) -> drowse_vm::Result<i32> {
        self.execs
            .lock()
            .unwrap()
            .push((name.to_string(), argv.to_vec()));
        Ok(0)
    }
}

/// Everything a lifecycle test needs, rooted in a temp dir.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub clock: Arc<ManualClock>,
    pub supervisor: Arc<FakeSupervisor>,
    pub runtime: Arc<FakeRuntime>,
    pub lifecycle: Lifecycle,
}

impl Harness {
    pub fn new(vm_live: LiveStatus) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let supervisor = FakeSupervisor::new(vm_live);
        let runtime = FakeRuntime::new();
        let store = StateStore::with_clock(StatePaths::new(dir.path()), clock.clone());
        let lifecycle = Lifecycle::new(store, supervisor.clone(), runtime.clone(), clock.clone());
        Self {
            dir,
            clock,
            supervisor,
            runtime,
            lifecycle,
        }
    }

    pub fn store(&self) -> &StateStore {
        self.lifecycle.store()
    }

    /// A project directory that exists on disk.
    pub fn project(&self, name: &str) -> std::path::PathBuf {
        let path = self.dir.path().join("projects").join(name);
        std::fs::create_dir_all(&path).unwrap();
        path
    }
}
