//! Container runtime interface and its Podman-in-Lima implementation.

use crate::command::{self, ExecOutput};
use crate::error::{BackendError, Result};
use crate::supervisor::INSTANCE_NAME;
use async_trait::async_trait;
use std::path::PathBuf;

/// A bind mount from the host into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    /// Absolute host path.
    pub host: PathBuf,
    /// Mount point inside the container.
    pub guest: String,
    /// Mount writable.
    pub writable: bool,
}

/// A published port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedPort {
    /// Port on the host.
    pub host_port: u16,
    /// Port inside the container.
    pub container_port: u16,
    /// `tcp` or `udp`.
    pub protocol: String,
}

/// Everything needed to launch a long-running development container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Container name (also the environment name).
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Working directory inside the container.
    pub workdir: String,
    /// `uid:gid` to run as.
    pub user: Option<(u32, u32)>,
    /// Named volumes, `(volume, mount point)`; mounted before bind mounts.
    pub volumes: Vec<(String, String)>,
    /// Bind mounts.
    pub mounts: Vec<BindMount>,
    /// Published ports.
    pub ports: Vec<PublishedPort>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
}

impl ContainerSpec {
    /// Arguments following `podman` for `run`.
    pub fn run_args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            self.name.clone(),
        ];
        if let Some((uid, gid)) = self.user {
            args.push("--user".into());
            args.push(format!("{uid}:{gid}"));
        }
        for (volume, target) in &self.volumes {
            args.push("--mount".into());
            args.push(format!("type=volume,source={volume},destination={target}"));
        }
        for mount in &self.mounts {
            args.push("-v".into());
            let mut spec = format!("{}:{}", mount.host.display(), mount.guest);
            if !mount.writable {
                spec.push_str(":ro");
            }
            args.push(spec);
        }
        for port in &self.ports {
            args.push("-p".into());
            args.push(format!(
                "{}:{}/{}",
                port.host_port, port.container_port, port.protocol
            ));
        }
        if !self.workdir.is_empty() {
            args.push("-w".into());
            args.push(self.workdir.clone());
        }
        for (key, value) in &self.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        args.push(self.image.clone());
        args.push("sleep".into());
        args.push("infinity".into());
        args
    }
}

/// Operations the core needs from the container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Names of all running containers.
    async fn list_running_names(&self) -> Result<Vec<String>>;

    /// Stop a container by name.
    ///
    /// Returns [`BackendError::NoSuchContainer`] when the runtime has no such container.
    async fn stop_by_name(&self, name: &str) -> Result<()>;

    /// Launch a detached container.
    async fn run_detached(&self, spec: &ContainerSpec) -> Result<()>;

    /// Remove a container, optionally forcing removal of a running one.
    async fn remove(&self, name: &str, force: bool) -> Result<()>;

    /// Run a command inside a container and capture its output.
    async fn exec(&self, name: &str, argv: &[String]) -> Result<ExecOutput>;

    /// Run a command inside a container attached to the current terminal.
    async fn exec_interactive(&self, name: &str, argv: &[String]) -> Result<i32>;

    /// Whether the named container is currently running.
    async fn is_running(&self, name: &str) -> Result<bool> {
        Ok(self
            .list_running_names()
            .await?
            .iter()
            .any(|running| running == name))
    }
}

fn is_missing_container(stderr: &str) -> bool {
    stderr.to_ascii_lowercase().contains("no such container")
}

/// [`ContainerRuntime`] running `podman` inside the Lima instance.
#[derive(Debug, Clone)]
pub struct PodmanRuntime {
    instance: String,
    limactl: String,
}

impl Default for PodmanRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl PodmanRuntime {
    /// Runtime for the default instance.
    pub fn new() -> Self {
        Self {
            instance: INSTANCE_NAME.to_string(),
            limactl: "limactl".to_string(),
        }
    }

    /// Override the `limactl` executable.
    pub fn with_limactl(mut self, program: impl Into<String>) -> Self {
        self.limactl = program.into();
        self
    }

    fn podman_args<I, S>(&self, args: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut full = vec![
            "shell".to_string(),
            self.instance.clone(),
            "--".to_string(),
            "podman".to_string(),
        ];
        full.extend(args.into_iter().map(Into::into));
        full
    }

    /// Run a podman subcommand that targets a single named container.
    async fn container_command(&self, name: &str, args: Vec<String>) -> Result<()> {
        let full = self.podman_args(args);
        let output = command::capture(&self.limactl, &full).await?;
        if output.success() {
            return Ok(());
        }
        if is_missing_container(&output.stderr) {
            return Err(BackendError::NoSuchContainer(name.to_string()));
        }
        Err(BackendError::CommandFailed {
            command: format!("{} {}", self.limactl, full.join(" ")),
            code: Some(output.exit_code),
            stderr: output.stderr.trim().to_string(),
        })
    }
}

#[async_trait]
impl ContainerRuntime for PodmanRuntime {
    async fn list_running_names(&self) -> Result<Vec<String>> {
        let args = self.podman_args(["ps", "--format", "{{.Names}}"]);
        let output = command::checked(&self.limactl, &args).await?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }

    async fn stop_by_name(&self, name: &str) -> Result<()> {
        tracing::debug!(container = %name, "Stopping container");
        self.container_command(name, vec!["stop".into(), name.into()])
            .await
    }

    async fn run_detached(&self, spec: &ContainerSpec) -> Result<()> {
        tracing::info!(container = %spec.name, image = %spec.image, "Pulling image");
        let pull = self.podman_args(["pull", spec.image.as_str()]);
        command::checked(&self.limactl, &pull).await?;

        tracing::info!(container = %spec.name, "Starting container");
        let run = self.podman_args(spec.run_args());
        command::checked(&self.limactl, &run).await?;
        Ok(())
    }

    async fn remove(&self, name: &str, force: bool) -> Result<()> {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".into());
        }
        args.push(name.into());
        self.container_command(name, args).await
    }

    async fn exec(&self, name: &str, argv: &[String]) -> Result<ExecOutput> {
        let mut args = vec!["exec".to_string(), name.to_string()];
        args.extend(argv.iter().cloned());
        let full = self.podman_args(args);
        command::capture(&self.limactl, &full).await
    }

    async fn exec_interactive(&self, name: &str, argv: &[String]) -> Result<i32> {
        let mut args = vec!["exec".to_string(), "-it".to_string(), name.to_string()];
        args.extend(argv.iter().cloned());
        let full = self.podman_args(args);
        command::interactive(&self.limactl, &full).await
    }
}
