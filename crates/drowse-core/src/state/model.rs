//! The persisted state document and its records.

use crate::error::{CoreError, Result};
use crate::state::ports::{PortMapping, PortRegistry};
use chrono::{DateTime, Utc};
use drowse_vm::VmConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Schema version written by this build.
pub const CURRENT_SCHEMA: u32 = 3;

/// Name of the VM backend recorded in [`VmRecord::backend`].
pub const VM_BACKEND: &str = "lima";

/// Name of the container runtime recorded in [`EnvironmentRecord::runtime`].
pub const CONTAINER_RUNTIME: &str = "podman";

/// Recorded run state of the VM or an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Believed to be running.
    Running,
    /// Stopped, either by the user or by autosleep.
    Stopped,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Running => write!(f, "running"),
            Status::Stopped => write!(f, "stopped"),
        }
    }
}

/// Facts about the host captured when the document is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub uid: u32,
    pub gid: u32,
    pub arch: String,
    pub os: String,
}

impl HostInfo {
    /// Describe the current process' host.
    pub fn current() -> Self {
        let (uid, gid) = current_ids();
        Self {
            uid,
            gid,
            arch: std::env::consts::ARCH.to_string(),
            os: std::env::consts::OS.to_string(),
        }
    }
}

#[cfg(unix)]
fn current_ids() -> (u32, u32) {
    // SAFETY: getuid/getgid cannot fail and touch no memory.
    unsafe { (libc::getuid(), libc::getgid()) }
}

#[cfg(not(unix))]
fn current_ids() -> (u32, u32) {
    (0, 0)
}

/// The singleton development VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRecord {
    pub name: String,
    pub backend: String,
    pub cpus: u32,
    pub memory: String,
    pub disk: String,
    pub status: Status,
    /// SHA-256 of the rendered Lima template the VM was created from.
    pub config_checksum: String,
    pub last_active: DateTime<Utc>,
}

impl VmRecord {
    /// Record for a freshly started VM.
    pub fn new(config: &VmConfig, now: DateTime<Utc>) -> Self {
        Self {
            name: drowse_vm::INSTANCE_NAME.to_string(),
            backend: VM_BACKEND.to_string(),
            cpus: config.cpus,
            memory: config.memory.clone(),
            disk: config.disk.clone(),
            status: Status::Running,
            config_checksum: drowse_vm::config_checksum(config.render_template().as_bytes()),
            last_active: now,
        }
    }

    /// Sizing the VM was created with.
    pub fn config(&self) -> VmConfig {
        VmConfig {
            cpus: self.cpus,
            memory: self.memory.clone(),
            disk: self.disk.clone(),
        }
    }
}

/// A host directory mounted into an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRecord {
    pub host: PathBuf,
    pub guest: String,
    pub rw: bool,
}

/// The user a container runs as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub uid: u32,
    pub gid: u32,
    pub name: String,
}

/// One development container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentRecord {
    pub name: String,
    pub image: String,
    pub runtime: String,
    /// Canonical project directory.
    pub project_path: PathBuf,
    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub mounts: BTreeMap<String, MountRecord>,
    #[serde(default)]
    pub volumes: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    pub user: UserRecord,
    pub status: Status,
    /// Excluded from autosleep.
    #[serde(default)]
    pub persistent: bool,
    pub last_active: DateTime<Utc>,
    #[serde(default)]
    pub exported_shims: Vec<String>,
    #[serde(default)]
    pub migrated_dirs: BTreeMap<String, String>,
}

/// A host command alias that forwards into an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShimRecord {
    pub env: String,
    pub target: String,
}

/// Root of everything drowse persists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDocument {
    pub schema: u32,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    pub host: HostInfo,
    #[serde(default)]
    pub vm: Option<VmRecord>,
    #[serde(default)]
    pub ports: PortRegistry,
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentRecord>,
    #[serde(default)]
    pub shims: BTreeMap<String, ShimRecord>,
}

impl Default for StateDocument {
    fn default() -> Self {
        Self::new(HostInfo::current())
    }
}

/// Canonicalize a project path, falling back to making it absolute
/// when it does not exist.
pub fn normalize_project_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

impl StateDocument {
    /// Empty document at the current schema.
    pub fn new(host: HostInfo) -> Self {
        Self {
            schema: CURRENT_SCHEMA,
            updated_at: None,
            host,
            vm: None,
            ports: PortRegistry::default(),
            environments: BTreeMap::new(),
            shims: BTreeMap::new(),
        }
    }

    // ------------------------------------------------------------------
    // VM
    // ------------------------------------------------------------------

    /// The VM record, if one was ever created.
    pub fn vm(&self) -> Option<&VmRecord> {
        self.vm.as_ref()
    }

    /// Replace the VM record.
    pub fn set_vm(&mut self, record: VmRecord) {
        self.vm = Some(record);
    }

    /// Set the recorded VM status. No-op without a VM record.
    pub fn update_vm_status(&mut self, status: Status) {
        if let Some(vm) = self.vm.as_mut() {
            vm.status = status;
        }
    }

    /// Stamp VM activity. No-op without a VM record.
    pub fn touch_vm_activity(&mut self, now: DateTime<Utc>) {
        if let Some(vm) = self.vm.as_mut() {
            vm.last_active = now;
        }
    }

    // ------------------------------------------------------------------
    // Environments
    // ------------------------------------------------------------------

    /// Look up an environment by name.
    pub fn environment(&self, name: &str) -> Option<&EnvironmentRecord> {
        self.environments.get(name)
    }

    /// All environments, ordered by name.
    pub fn environments(&self) -> impl Iterator<Item = &EnvironmentRecord> {
        self.environments.values()
    }

    /// Insert or replace an environment keyed by its name.
    pub fn upsert_environment(&mut self, record: EnvironmentRecord) {
        self.environments.insert(record.name.clone(), record);
    }

    /// Remove an environment and release its ports.
    ///
    /// Removing an unknown name is a no-op that still releases any ports
    /// reserved under it.
    pub fn remove_environment(&mut self, name: &str) -> Option<EnvironmentRecord> {
        self.release_ports(name);
        self.shims.retain(|_, shim| shim.env != name);
        self.environments.remove(name)
    }

    /// Set an environment's recorded status.
    pub fn update_environment_status(&mut self, name: &str, status: Status) -> Result<()> {
        let env = self
            .environments
            .get_mut(name)
            .ok_or_else(|| CoreError::EnvironmentNotFound(name.to_string()))?;
        env.status = status;
        Ok(())
    }

    /// Stamp activity on an environment and on the VM.
    pub fn touch_environment_activity(&mut self, name: &str, now: DateTime<Utc>) -> Result<()> {
        let env = self
            .environments
            .get_mut(name)
            .ok_or_else(|| CoreError::EnvironmentNotFound(name.to_string()))?;
        env.last_active = now;
        self.touch_vm_activity(now);
        Ok(())
    }

    /// The environment tracking `path`, compared after normalization.
    pub fn find_environment_by_project_path(&self, path: &Path) -> Option<&EnvironmentRecord> {
        let wanted = normalize_project_path(path);
        self.environments
            .values()
            .find(|env| normalize_project_path(&env.project_path) == wanted)
    }

    /// Whether any environment is recorded as running.
    pub fn any_environment_running(&self) -> bool {
        self.environments
            .values()
            .any(|env| env.status == Status::Running)
    }

    // ------------------------------------------------------------------
    // Shims
    // ------------------------------------------------------------------

    /// Record a shim alias.
    pub fn register_shim(&mut self, alias: &str, env: &str, target: &str) {
        self.shims.insert(
            alias.to_string(),
            ShimRecord {
                env: env.to_string(),
                target: target.to_string(),
            },
        );
        if let Some(record) = self.environments.get_mut(env) {
            if !record.exported_shims.iter().any(|s| s == alias) {
                record.exported_shims.push(alias.to_string());
            }
        }
    }

    /// Drop a shim alias.
    pub fn unregister_shim(&mut self, alias: &str) -> Option<ShimRecord> {
        let removed = self.shims.remove(alias)?;
        if let Some(record) = self.environments.get_mut(&removed.env) {
            record.exported_shims.retain(|s| s != alias);
        }
        Some(removed)
    }

    /// All shims, ordered by alias.
    pub fn shims(&self) -> impl Iterator<Item = (&String, &ShimRecord)> {
        self.shims.iter()
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_new_document_is_current_and_empty() {
        let doc = StateDocument::new(host());
        assert_eq!(doc.schema, CURRENT_SCHEMA);
        assert!(doc.vm().is_none());
        assert_eq!(doc.environments().count(), 0);
        assert_eq!(doc.ports.next_ephemeral, 51000);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Status::Running).unwrap(), "\"running\"");
        let parsed: Status = serde_json::from_str("\"stopped\"").unwrap();
        assert_eq!(parsed, Status::Stopped);
    }

    #[test]
    fn test_vm_mutators_noop_without_record() {
        let mut doc = StateDocument::new(host());
        doc.update_vm_status(Status::Running);
        doc.touch_vm_activity(t0());
        assert!(doc.vm().is_none());
    }

    #[test]
    fn test_vm_record_from_config() {
        let record = VmRecord::new(&VmConfig::default(), t0());
        assert_eq!(record.name, "drowse");
        assert_eq!(record.backend, "lima");
        assert_eq!(record.status, Status::Running);
        assert_eq!(record.config_checksum.len(), 64);
        assert_eq!(record.config(), VmConfig::default());
    }

    #[test]
    fn test_environments_sorted_by_name() {
        let mut doc = StateDocument::new(host());
        doc.upsert_environment(env("web", Status::Running, t0()));
        doc.upsert_environment(env("api", Status::Running, t0()));
        doc.upsert_environment(env("db", Status::Stopped, t0()));
        let names: Vec<_> = doc.environments().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["api", "db", "web"]);
    }

    #[test]
    fn test_touch_environment_also_touches_vm() {
        let mut doc = StateDocument::new(host());
        doc.set_vm(vm(Status::Running, t0()));
        doc.upsert_environment(env("dev", Status::Running, t0()));

        let later = t0() + chrono::Duration::minutes(5);
        doc.touch_environment_activity("dev", later).unwrap();
        assert_eq!(doc.environment("dev").unwrap().last_active, later);
        assert_eq!(doc.vm().unwrap().last_active, later);
    }

    #[test]
    fn test_update_unknown_environment_fails() {
        let mut doc = StateDocument::new(host());
        let err = doc
            .update_environment_status("ghost", Status::Stopped)
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(doc.touch_environment_activity("ghost", t0()).is_err());
    }

    #[test]
    fn test_remove_unknown_environment_is_noop() {
        let mut doc = StateDocument::new(host());
        assert!(doc.remove_environment("ghost").is_none());
    }

    #[test]
    fn test_find_by_project_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut doc = StateDocument::new(host());
        let mut record = env("dev", Status::Running, t0());
        record.project_path = dir.path().canonicalize().unwrap();
        doc.upsert_environment(record);

        // A non-canonical spelling of the same directory still matches.
        let spelled = dir.path().join(".").join("");
        assert_eq!(
            doc.find_environment_by_project_path(&spelled).unwrap().name,
            "dev"
        );
        assert!(doc
            .find_environment_by_project_path(Path::new("/nonexistent/elsewhere"))
            .is_none());
    }

    #[test]
    fn test_shim_registration() {
        let mut doc = StateDocument::new(host());
        doc.upsert_environment(env("dev", Status::Running, t0()));
        doc.register_shim("node", "dev", "/usr/bin/node");
        doc.register_shim("node", "dev", "/usr/bin/node");

        assert_eq!(doc.shims().count(), 1);
        assert_eq!(doc.environment("dev").unwrap().exported_shims, vec!["node"]);

        let removed = doc.unregister_shim("node").unwrap();
        assert_eq!(removed.target, "/usr/bin/node");
        assert!(doc.environment("dev").unwrap().exported_shims.is_empty());
        assert!(doc.unregister_shim("node").is_none());
    }

    #[test]
    fn test_remove_environment_drops_its_shims() {
        let mut doc = StateDocument::new(host());
        doc.upsert_environment(env("dev", Status::Running, t0()));
        doc.register_shim("cargo", "dev", "/usr/local/bin/cargo");
        doc.remove_environment("dev");
        assert_eq!(doc.shims().count(), 0);
    }
}
