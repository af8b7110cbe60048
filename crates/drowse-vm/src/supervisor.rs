//! VM supervisor interface and its Lima implementation.

use crate::command;
use crate::config::VmConfig;
use crate::error::{BackendError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Fixed name of the development VM instance.
pub const INSTANCE_NAME: &str = "drowse";

/// Live state of the VM as reported by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveStatus {
    /// VM is booted.
    Running,
    /// VM exists but is powered off.
    Stopped,
    /// Supervisor reports a broken instance.
    Error,
    /// Not found, or a transitional state we do not model.
    Unknown,
}

impl LiveStatus {
    /// Map a `limactl` status string.
    pub fn from_lima(status: &str) -> Self {
        match status {
            "Running" => Self::Running,
            "Stopped" => Self::Stopped,
            "Broken" | "Error" => Self::Error,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for LiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LiveStatus::Running => write!(f, "running"),
            LiveStatus::Stopped => write!(f, "stopped"),
            LiveStatus::Error => write!(f, "error"),
            LiveStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Operations the core needs from whatever runs the VM.
///
/// Every call may block for the duration of the external operation
/// (a boot can take minutes).
#[async_trait]
pub trait VmSupervisor: Send + Sync {
    /// Name of the supervised instance.
    fn instance(&self) -> &str;

    /// Whether the instance has been created.
    async fn exists(&self) -> Result<bool>;

    /// Current live status. A missing instance reports [`LiveStatus::Unknown`].
    async fn live_status(&self) -> Result<LiveStatus>;

    /// Create the instance if needed and boot it; returns once it is running.
    async fn start(&self, config: &VmConfig) -> Result<()>;

    /// Stop the instance; stopping an absent or stopped instance succeeds.
    async fn stop(&self) -> Result<()>;
}

#[derive(Debug, Clone, Deserialize)]
struct LimaInstance {
    name: String,
    status: String,
}

/// Parse `limactl list --json`.
///
/// Depending on the Lima version this is a JSON array or one object per line.
fn parse_instances(output: &str) -> Result<Vec<(String, String)>> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let parse_err = |e: serde_json::Error| BackendError::Parse {
        what: "limactl list output",
        details: e.to_string(),
    };

    let instances: Vec<LimaInstance> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).map_err(parse_err)?
    } else {
        trimmed
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(parse_err))
            .collect::<Result<_>>()?
    };
    Ok(instances.into_iter().map(|i| (i.name, i.status)).collect())
}

/// [`VmSupervisor`] backed by the `limactl` CLI.
#[derive(Debug, Clone)]
pub struct LimaSupervisor {
    instance: String,
    limactl: String,
    template_path: PathBuf,
    boot_timeout: Duration,
    stop_timeout: Duration,
    poll_interval: Duration,
}

impl LimaSupervisor {
    /// Supervisor for the default instance, writing its template to `template_path`.
    pub fn new(template_path: impl Into<PathBuf>) -> Self {
        Self {
            instance: INSTANCE_NAME.to_string(),
            limactl: "limactl".to_string(),
            template_path: template_path.into(),
            boot_timeout: Duration::from_secs(5 * 60),
            stop_timeout: Duration::from_secs(2 * 60),
            poll_interval: Duration::from_secs(2),
        }
    }

    /// Override the `limactl` executable.
    pub fn with_limactl(mut self, program: impl Into<String>) -> Self {
        self.limactl = program.into();
        self
    }

    /// Override how long `start` waits for the instance to report Running.
    pub fn with_boot_timeout(mut self, timeout: Duration) -> Self {
        self.boot_timeout = timeout;
        self
    }

    /// Path the rendered template is written to.
    pub fn template_path(&self) -> &PathBuf {
        &self.template_path
    }

    async fn lookup(&self) -> Result<Option<LiveStatus>> {
        let output = command::checked(&self.limactl, &["list", "--json"]).await?;
        Ok(parse_instances(&output.stdout)?
            .into_iter()
            .find(|(name, _)| *name == self.instance)
            .map(|(_, status)| LiveStatus::from_lima(&status)))
    }

    async fn write_template(&self, config: &VmConfig) -> Result<()> {
        if let Some(parent) = self.template_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.template_path, config.render_template()).await?;
        tracing::debug!(path = %self.template_path.display(), "Wrote Lima template");
        Ok(())
    }

    async fn wait_for(&self, target: LiveStatus, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.lookup().await? {
                Some(status) if status == target => return Ok(()),
                // An instance that vanished counts as stopped.
                None if target == LiveStatus::Stopped => return Ok(()),
                Some(LiveStatus::Error) => {
                    return Err(BackendError::Failed(format!(
                        "instance {} reports an error state",
                        self.instance
                    )))
                }
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BackendError::Timeout {
                    what: format!("VM {} to become {target}", self.instance),
                    waited: timeout,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl VmSupervisor for LimaSupervisor {
    fn instance(&self) -> &str {
        &self.instance
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.lookup().await?.is_some())
    }

    async fn live_status(&self) -> Result<LiveStatus> {
        Ok(self.lookup().await?.unwrap_or(LiveStatus::Unknown))
    }

    async fn start(&self, config: &VmConfig) -> Result<()> {
        config.validate()?;
        let current = self.lookup().await?;
        if current == Some(LiveStatus::Running) {
            tracing::debug!(instance = %self.instance, "VM already running");
            return Ok(());
        }

        if current.is_none() {
            self.write_template(config).await?;
            tracing::info!(instance = %self.instance, cpus = config.cpus, memory = %config.memory, "Creating VM");
            let name_arg = format!("--name={}", self.instance);
            let template = self.template_path.to_string_lossy().into_owned();
            command::checked(&self.limactl, &["create", name_arg.as_str(), template.as_str()])
                .await?;
        }

        tracing::info!(instance = %self.instance, "Starting VM");
        command::checked(&self.limactl, &["start", self.instance.as_str()]).await?;
        self.wait_for(LiveStatus::Running, self.boot_timeout).await?;
        tracing::info!(instance = %self.instance, "VM running");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        match self.lookup().await? {
            None | Some(LiveStatus::Stopped) => {
                tracing::debug!(instance = %self.instance, "VM already stopped");
                return Ok(());
            }
            Some(_) => {}
        }

        tracing::info!(instance = %self.instance, "Stopping VM");
        command::checked(&self.limactl, &["stop", self.instance.as_str()]).await?;
        self.wait_for(LiveStatus::Stopped, self.stop_timeout).await
    }
}
