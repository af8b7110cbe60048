//! Resource lifecycle: bringing the VM and environments up and down.
//!
//! Backend calls (which can take minutes) never run under the state lock.
//! Each flow reads state, talks to the backend, then commits the outcome in
//! a short exclusive session.

use crate::clock::Clock;
use crate::error::{CoreError, Result};
use crate::idle::idle_duration;
use crate::state::{
    normalize_project_path, EnvironmentRecord, HostInfo, MountRecord, PortMapping, StateDocument,
    StateStore, Status, UserRecord, VmRecord, CONTAINER_RUNTIME,
};
use chrono::{DateTime, Utc};
use drowse_vm::{
    BackendError, BindMount, ContainerRuntime, ContainerSpec, ExecOutput, LiveStatus,
    PublishedPort, VmConfig, VmSupervisor,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default working directory inside an environment.
pub const DEFAULT_WORKDIR: &str = "/workspace";

/// Where the host home directory is mounted read-only.
pub const HOST_HOME_MOUNT: &str = "/home/host";

/// How long a commit after a backend call keeps retrying while another
/// process holds the state lock.
const COMMIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between commit attempts.
const COMMIT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Outcome of [`Lifecycle::ensure_vm_running`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmEnsure {
    /// Nothing to do.
    AlreadyRunning,
    /// The VM was booted.
    Started,
}

/// Parameters for a new environment.
#[derive(Debug, Clone)]
pub struct NewEnvironment {
    pub name: String,
    pub image: String,
    pub project_path: PathBuf,
    pub workdir: String,
    /// Display name of the container user; defaults to `$USER`.
    pub user: Option<String>,
    pub ports: Vec<PortMapping>,
    pub env: Vec<(String, String)>,
    pub persistent: bool,
}

impl NewEnvironment {
    /// Environment for `project_path` with default settings.
    pub fn new(
        name: impl Into<String>,
        image: impl Into<String>,
        project_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            project_path: project_path.into(),
            workdir: DEFAULT_WORKDIR.to_string(),
            user: None,
            ports: Vec::new(),
            env: Vec::new(),
            persistent: false,
        }
    }
}

/// Container names: a letter or digit followed by letters, digits, `_`, `.`, `-`.
pub fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {
            chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidName(name.to_string()))
    }
}

/// Build the container spec for a recorded environment.
pub fn container_spec(record: &EnvironmentRecord, env: &[(String, String)]) -> ContainerSpec {
    ContainerSpec {
        name: record.name.clone(),
        image: record.image.clone(),
        workdir: record
            .mounts
            .get("work")
            .map(|m| m.guest.clone())
            .unwrap_or_else(|| DEFAULT_WORKDIR.to_string()),
        user: Some((record.user.uid, record.user.gid)),
        volumes: record
            .volumes
            .iter()
            .map(|(dir, volume)| (volume.clone(), format!("{DEFAULT_WORKDIR}/{dir}")))
            .collect(),
        mounts: record
            .mounts
            .values()
            .map(|m| BindMount {
                host: m.host.clone(),
                guest: m.guest.clone(),
                writable: m.rw,
            })
            .collect(),
        ports: record
            .ports
            .iter()
            .map(|p| PublishedPort {
                host_port: p.host_port,
                container_port: p.container_port,
                protocol: p.protocol.to_string(),
            })
            .collect(),
        env: env.to_vec(),
    }
}

/// Ties the state store to the VM supervisor and container runtime.
#[derive(Clone)]
pub struct Lifecycle {
    store: StateStore,
    supervisor: Arc<dyn VmSupervisor>,
    runtime: Arc<dyn ContainerRuntime>,
    clock: Arc<dyn Clock>,
}

impl Lifecycle {
    pub fn new(
        store: StateStore,
        supervisor: Arc<dyn VmSupervisor>,
        runtime: Arc<dyn ContainerRuntime>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            supervisor,
            runtime,
            clock,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn supervisor(&self) -> &Arc<dyn VmSupervisor> {
        &self.supervisor
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Time since `last_active`, never negative.
    pub fn idle_duration(&self, last_active: DateTime<Utc>) -> Duration {
        idle_duration(last_active, self.now())
    }

    // ------------------------------------------------------------------
    // VM
    // ------------------------------------------------------------------

    /// Make sure the VM is booted, starting it if needed.
    ///
    /// A recorded `running` status is confirmed with the supervisor; a
    /// disagreement is treated as stale state and the VM is started.
    pub async fn ensure_vm_running(&self) -> Result<VmEnsure> {
        let vm = self
            .store
            .read_only()?
            .document
            .vm()
            .cloned()
            .ok_or(CoreError::VmNotFound)?;

        if vm.status == Status::Running {
            match self.supervisor.live_status().await? {
                LiveStatus::Running => return Ok(VmEnsure::AlreadyRunning),
                live => tracing::warn!(
                    recorded = %vm.status,
                    live = %live,
                    "VM state is stale, starting it"
                ),
            }
        } else {
            tracing::info!(vm = %vm.name, "VM is stopped, starting it");
        }

        self.supervisor.start(&vm.config()).await?;

        let now = self.now();
        self.store.with_exclusive_session(|doc| {
            doc.update_vm_status(Status::Running);
            doc.touch_vm_activity(now);
            Ok(())
        })?;
        tracing::info!(vm = %vm.name, "VM started");
        Ok(VmEnsure::Started)
    }

    /// Create (if needed) and boot the VM, recording it as running.
    pub async fn create_vm(&self, config: &VmConfig) -> Result<VmRecord> {
        config.validate()?;
        self.supervisor.start(config).await?;

        let now = self.now();
        self.store.with_exclusive_session(|doc| {
            match doc.vm().map(VmRecord::config) {
                Some(existing) => {
                    if existing != *config {
                        tracing::warn!(
                            cpus = existing.cpus,
                            memory = %existing.memory,
                            disk = %existing.disk,
                            "VM already exists; keeping its original sizing"
                        );
                    }
                    doc.update_vm_status(Status::Running);
                    doc.touch_vm_activity(now);
                }
                None => doc.set_vm(VmRecord::new(config, now)),
            }
            doc.vm().cloned().ok_or(CoreError::VmNotFound)
        })
    }

    /// Stop the VM. Environments inside it are recorded as stopped.
    pub async fn stop_vm(&self) -> Result<()> {
        if self.store.read_only()?.document.vm().is_none() {
            return Err(CoreError::VmNotFound);
        }
        self.supervisor.stop().await?;
        self.store.with_exclusive_session(|doc| {
            doc.update_vm_status(Status::Stopped);
            let running: Vec<String> = doc
                .environments()
                .filter(|env| env.status == Status::Running)
                .map(|env| env.name.clone())
                .collect();
            for name in running {
                doc.update_environment_status(&name, Status::Stopped)?;
            }
            Ok(())
        })?;
        tracing::info!("VM stopped");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Environments
    // ------------------------------------------------------------------

    /// Check that an environment is running.
    ///
    /// Returns `Ok(false)` when it already runs. Stopped environments are
    /// never started automatically; the error carries the recovery steps.
    pub async fn ensure_environment_running(&self, name: &str) -> Result<bool> {
        let loaded = self.store.read_only()?;
        let env = loaded
            .document
            .environment(name)
            .ok_or_else(|| CoreError::EnvironmentNotFound(name.to_string()))?;
        match env.status {
            Status::Running => Ok(false),
            Status::Stopped => Err(CoreError::EnvironmentStopped(name.to_string())),
        }
    }

    /// Create and start a new environment.
    ///
    /// Host ports are reserved before the container is launched and released
    /// again if the launch fails.
    pub async fn create_environment(&self, new: NewEnvironment) -> Result<EnvironmentRecord> {
        validate_name(&new.name)?;
        let project_path = normalize_project_path(&new.project_path);

        let ports = self.store.with_exclusive_session(|doc| {
            match doc.vm() {
                None => return Err(CoreError::VmNotFound),
                Some(vm) if vm.status != Status::Running => return Err(CoreError::VmNotRunning),
                Some(_) => {}
            }
            if doc.environment(&new.name).is_some() {
                return Err(CoreError::EnvironmentExists(new.name.clone()));
            }
            if let Some(existing) = doc.find_environment_by_project_path(&project_path) {
                return Err(CoreError::ProjectAlreadyTracked {
                    path: project_path.clone(),
                    existing: existing.name.clone(),
                });
            }
            new.ports
                .iter()
                .map(|wanted| {
                    let host_port = doc.reserve_port(&new.name, wanted.host_port)?;
                    if host_port != wanted.host_port {
                        tracing::warn!(
                            env = %new.name,
                            requested = wanted.host_port,
                            assigned = host_port,
                            "Host port in use, assigned another"
                        );
                    }
                    Ok(PortMapping {
                        host_port,
                        ..*wanted
                    })
                })
                .collect::<Result<Vec<_>>>()
        })?;

        let record = self.build_record(&new, project_path, ports);
        let spec = container_spec(&record, &new.env);
        let reserved: Vec<u16> = record.ports.iter().map(|p| p.host_port).collect();

        if let Err(e) = self.runtime.run_detached(&spec).await {
            tracing::error!(env = %new.name, error = %e, "Failed to start container, releasing ports");
            self.release_reservations(&new.name, &reserved);
            return Err(e.into());
        }

        let now = self.now();
        let committed = self
            .commit_with_retry(|doc| {
                let mut record = record.clone();
                record.last_active = now;
                doc.upsert_environment(record);
                doc.touch_vm_activity(now);
                Ok(())
            })
            .await;
        if let Err(e) = committed {
            tracing::error!(env = %new.name, error = %e, "Failed to record environment, removing container");
            if let Err(remove) = self.runtime.remove(&new.name, true).await {
                tracing::warn!(env = %new.name, error = %remove, "Failed to remove container");
            }
            self.release_reservations(&new.name, &reserved);
            return Err(e);
        }

        tracing::info!(env = %record.name, image = %record.image, "Environment created");
        Ok(record)
    }

    /// Give back the ports one create call reserved. Reservations made by
    /// other calls for the same name are kept.
    fn release_reservations(&self, name: &str, ports: &[u16]) {
        if ports.is_empty() {
            return;
        }
        if let Err(e) = self.store.with_exclusive_session(|doc| {
            doc.release_reserved(name, ports);
            Ok(())
        }) {
            tracing::warn!(env = %name, ports = ?ports, error = %e, "Failed to release ports");
        }
    }

    /// Run a session, retrying for up to [`COMMIT_TIMEOUT`] while the lock
    /// is held elsewhere.
    /// Commits that follow a backend call go through here.
    async fn commit_with_retry<T, F>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(&mut StateDocument) -> Result<T>,
    {
        let start = tokio::time::Instant::now();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.store.with_exclusive_session(&mut f) {
                Err(e) if e.is_busy() && start.elapsed() < COMMIT_TIMEOUT => {
                    tracing::debug!(attempt = attempts, "State is locked, retrying commit");
                    tokio::time::sleep(COMMIT_RETRY_INTERVAL).await;
                }
                Err(e) if e.is_busy() => {
                    tracing::warn!(attempts, "State stayed locked, giving up on commit");
                    return Err(e);
                }
                other => return other,
            }
        }
    }

    fn build_record(
        &self,
        new: &NewEnvironment,
        project_path: PathBuf,
        ports: Vec<PortMapping>,
    ) -> EnvironmentRecord {
        let host = HostInfo::current();
        let mut mounts = BTreeMap::new();
        mounts.insert(
            "work".to_string(),
            MountRecord {
                host: project_path.clone(),
                guest: new.workdir.clone(),
                rw: true,
            },
        );
        if let Some(home) = dirs::home_dir() {
            mounts.insert(
                "home".to_string(),
                MountRecord {
                    host: home,
                    guest: HOST_HOME_MOUNT.to_string(),
                    rw: false,
                },
            );
        }

        EnvironmentRecord {
            name: new.name.clone(),
            image: new.image.clone(),
            runtime: CONTAINER_RUNTIME.to_string(),
            project_path,
            container_id: new.name.clone(),
            mounts,
            volumes: BTreeMap::new(),
            ports,
            user: UserRecord {
                uid: host.uid,
                gid: host.gid,
                name: new
                    .user
                    .clone()
                    .or_else(|| std::env::var("USER").ok())
                    .unwrap_or_default(),
            },
            status: Status::Running,
            persistent: new.persistent,
            last_active: self.now(),
            exported_shims: Vec::new(),
            migrated_dirs: BTreeMap::new(),
        }
    }

    /// Stop an environment's container at the user's request.
    ///
    /// A container the runtime no longer knows about counts as stopped.
    pub async fn stop_environment(&self, name: &str) -> Result<()> {
        self.stop_container(name).await?;
        let now = self.now();
        self.store.with_exclusive_session(|doc| {
            doc.update_environment_status(name, Status::Stopped)?;
            doc.touch_vm_activity(now);
            Ok(())
        })?;
        tracing::info!(env = %name, "Environment stopped");
        Ok(())
    }

    /// Stop the container for `name` without recording anything.
    pub(crate) async fn stop_container(&self, name: &str) -> Result<()> {
        if self.store.read_only()?.document.environment(name).is_none() {
            return Err(CoreError::EnvironmentNotFound(name.to_string()));
        }
        match self.runtime.stop_by_name(name).await {
            Ok(()) => Ok(()),
            Err(BackendError::NoSuchContainer(_)) => {
                tracing::warn!(env = %name, "Container not found in runtime, marking stopped");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove an environment's container and forget it, releasing its ports.
    pub async fn remove_environment(&self, name: &str, force: bool) -> Result<EnvironmentRecord> {
        if self.store.read_only()?.document.environment(name).is_none() {
            return Err(CoreError::EnvironmentNotFound(name.to_string()));
        }
        match self.runtime.remove(name, force).await {
            Ok(()) => {}
            Err(BackendError::NoSuchContainer(_)) => {
                tracing::warn!(env = %name, "Container not found in runtime, cleaning up state");
            }
            Err(e) => return Err(e.into()),
        }

        let now = self.now();
        let removed = self.store.with_exclusive_session(|doc| {
            let removed = doc
                .remove_environment(name)
                .ok_or_else(|| CoreError::EnvironmentNotFound(name.to_string()))?;
            doc.touch_vm_activity(now);
            Ok(removed)
        })?;
        tracing::info!(env = %name, ports = removed.ports.len(), "Environment removed");
        Ok(removed)
    }

    /// Record activity on an environment (and the VM).
    pub fn mark_active(&self, name: &str) -> Result<()> {
        let now = self.now();
        self.store
            .with_exclusive_session(|doc| doc.touch_environment_activity(name, now))
    }

    async fn prepare_exec(&self, name: &str) -> Result<()> {
        self.ensure_vm_running().await?;
        self.ensure_environment_running(name).await?;
        if !self.runtime.is_running(name).await? {
            return Err(CoreError::ContainerMissing(name.to_string()));
        }
        self.mark_active(name)
    }

    /// Run a command in an environment and capture its output.
    pub async fn run_in_environment(&self, name: &str, argv: &[String]) -> Result<ExecOutput> {
        self.prepare_exec(name).await?;
        tracing::debug!(env = %name, command = ?argv, "Running command");
        Ok(self.runtime.exec(name, argv).await?)
    }

    /// Open an interactive shell in an environment. Returns its exit code.
    pub async fn enter_environment(&self, name: &str, shell: Option<&str>) -> Result<i32> {
        self.prepare_exec(name).await?;
        let argv = vec![shell.unwrap_or("bash").to_string()];
        Ok(self.runtime.exec_interactive(name, &argv).await?)
    }
}
