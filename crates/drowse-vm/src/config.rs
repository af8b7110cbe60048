//! VM sizing configuration and the generated Lima template.

use crate::error::{BackendError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Sizing for the development VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    /// Number of virtual CPUs (1-64).
    pub cpus: u32,
    /// Memory size, Lima notation (e.g. `4GiB`).
    pub memory: String,
    /// Disk size, Lima notation (e.g. `100GiB`).
    pub disk: String,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            cpus: 4,
            memory: "4GiB".into(),
            disk: "100GiB".into(),
        }
    }
}

const SIZE_SUFFIXES: &[&str] = &["GiB", "MiB", "TiB", "GB", "MB", "G", "M"];

fn validate_size(field: &str, value: &str) -> Result<()> {
    let suffix = SIZE_SUFFIXES
        .iter()
        .find(|s| value.ends_with(*s))
        .ok_or_else(|| BackendError::Config(format!("{field} must end with a unit, got {value:?}")))?;
    let number = &value[..value.len() - suffix.len()];
    match number.parse::<f64>() {
        Ok(n) if n > 0.0 => Ok(()),
        _ => Err(BackendError::Config(format!(
            "{field} must be a positive size, got {value:?}"
        ))),
    }
}

impl VmConfig {
    /// Create a new config builder.
    pub fn builder() -> VmConfigBuilder {
        VmConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.cpus == 0 || self.cpus > 64 {
            return Err(BackendError::Config(format!(
                "cpus must be 1-64, got {}",
                self.cpus
            )));
        }
        validate_size("memory", &self.memory)?;
        validate_size("disk", &self.disk)?;
        Ok(())
    }

    /// Render the Lima instance template for this host architecture.
    pub fn render_template(&self) -> String {
        let (arch, image_suffix) = match std::env::consts::ARCH {
            "x86_64" => ("x86_64", "amd64"),
            _ => ("aarch64", "arm64"),
        };
        format!(
            r#"# Generated by drowse. Edits are overwritten by `drowse vm up`.
vmType: vz
arch: "{arch}"
cpus: {cpus}
memory: "{memory}"
disk: "{disk}"
images:
  - location: "https://cloud-images.ubuntu.com/noble/current/noble-server-cloudimg-{image_suffix}.img"
    arch: "{arch}"
mounts:
  - location: "~"
    writable: true
containerd:
  system: false
  user: false
provision:
  - mode: system
    script: |
      #!/bin/bash
      set -eux -o pipefail
      command -v podman >/dev/null 2>&1 && exit 0
      apt-get update
      apt-get install -y podman
"#,
            cpus = self.cpus,
            memory = self.memory,
            disk = self.disk,
        )
    }
}

/// SHA-256 of a rendered VM configuration, lowercase hex.
///
/// Stored with the VM record to detect configuration drift.
pub fn config_checksum(config: &[u8]) -> String {
    format!("{:x}", Sha256::digest(config))
}

/// Builder for VmConfig.
#[derive(Debug, Default)]
pub struct VmConfigBuilder {
    config: VmConfig,
}

impl VmConfigBuilder {
    /// Set the vCPU count.
    pub fn cpus(mut self, cpus: u32) -> Self {
        self.config.cpus = cpus;
        self
    }

    /// Set the memory size.
    pub fn memory(mut self, memory: impl Into<String>) -> Self {
        self.config.memory = memory.into();
        self
    }

    /// Set the disk size.
    pub fn disk(mut self, disk: impl Into<String>) -> Self {
        self.config.disk = disk.into();
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<VmConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
