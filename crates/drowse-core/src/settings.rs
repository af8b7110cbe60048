//! User settings.
//!
//! Loaded in layers: built-in defaults, then `config.toml`, then
//! environment variables. Command-line flags are applied last by the CLI.
//!
//! ```toml
//! [autosleep]
//! container_timeout = "15m"
//! vm_timeout = "30m"
//! poll_interval = "30s"
//! stop_vm = true
//! ```

use crate::error::{CoreError, Result};
use crate::idle::IdlePolicy;
use crate::paths::StatePaths;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Autosleep scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutosleepSettings {
    /// Environment idle threshold (default: 15m).
    pub container_timeout: Duration,
    /// VM idle threshold (default: 30m).
    pub vm_timeout: Duration,
    /// Time between scheduler cycles (default: 30s).
    pub poll_interval: Duration,
    /// Whether an idle VM may be stopped (default: true).
    pub stop_vm: bool,
}

impl Default for AutosleepSettings {
    fn default() -> Self {
        Self {
            container_timeout: Duration::from_secs(15 * 60),
            vm_timeout: Duration::from_secs(30 * 60),
            poll_interval: Duration::from_secs(30),
            stop_vm: true,
        }
    }
}

impl AutosleepSettings {
    /// The idle thresholds.
    pub fn policy(&self) -> IdlePolicy {
        IdlePolicy {
            container_timeout: self.container_timeout,
            vm_timeout: self.vm_timeout,
        }
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(CoreError::Config("poll_interval must be > 0".into()));
        }
        if self.container_timeout.is_zero() {
            return Err(CoreError::Config("container_timeout must be > 0".into()));
        }
        if self.vm_timeout.is_zero() {
            return Err(CoreError::Config("vm_timeout must be > 0".into()));
        }
        Ok(())
    }
}

/// All settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub autosleep: AutosleepSettings,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSettings {
    #[serde(default)]
    autosleep: FileAutosleep,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileAutosleep {
    container_timeout: Option<String>,
    vm_timeout: Option<String>,
    poll_interval: Option<String>,
    stop_vm: Option<bool>,
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim())
        .map_err(|e| CoreError::Config(format!("{key}: invalid duration {value:?}: {e}")))
}

impl Settings {
    /// Defaults, then the config file, then `DROWSE_*` environment variables.
    pub fn load(paths: &StatePaths) -> Result<Self> {
        let mut settings = Self::default();
        settings.apply_file(&paths.config_file)?;
        settings.apply_env(|key| std::env::var(key).ok());
        settings.autosleep.validate()?;
        Ok(settings)
    }

    /// Merge a TOML config file. A missing file changes nothing.
    pub fn apply_file(&mut self, path: &Path) -> Result<()> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(CoreError::io(
                    format!("failed to read {}", path.display()),
                    e,
                ))
            }
        };
        self.apply_toml(&text)
            .map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))
    }

    fn apply_toml(&mut self, text: &str) -> Result<()> {
        let file: FileSettings =
            toml::from_str(text).map_err(|e| CoreError::Config(e.message().to_string()))?;
        let auto = &mut self.autosleep;
        if let Some(v) = file.autosleep.container_timeout {
            auto.container_timeout = parse_duration("container_timeout", &v)?;
        }
        if let Some(v) = file.autosleep.vm_timeout {
            auto.vm_timeout = parse_duration("vm_timeout", &v)?;
        }
        if let Some(v) = file.autosleep.poll_interval {
            auto.poll_interval = parse_duration("poll_interval", &v)?;
        }
        if let Some(v) = file.autosleep.stop_vm {
            auto.stop_vm = v;
        }
        Ok(())
    }

    /// Merge environment overrides.
    ///
    /// | Variable | Example |
    /// |----------|---------|
    /// | `DROWSE_CONTAINER_TIMEOUT` | `15m` |
    /// | `DROWSE_VM_TIMEOUT` | `30m` |
    /// | `DROWSE_POLL_INTERVAL` | `30s` |
    /// | `DROWSE_STOP_VM` | `true` / `false` |
    ///
    /// Unparseable values are logged and ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let auto = &mut self.autosleep;
        let durations = [
            ("DROWSE_CONTAINER_TIMEOUT", &mut auto.container_timeout),
            ("DROWSE_VM_TIMEOUT", &mut auto.vm_timeout),
            ("DROWSE_POLL_INTERVAL", &mut auto.poll_interval),
        ];
        for (key, slot) in durations {
            if let Some(value) = lookup(key) {
                match parse_duration(key, &value) {
                    Ok(d) => *slot = d,
                    Err(e) => tracing::warn!(error = %e, "Ignoring environment override"),
                }
            }
        }
        if let Some(value) = lookup("DROWSE_STOP_VM") {
            match parse_bool(&value) {
                Some(stop_vm) => auto.stop_vm = stop_vm,
                None => tracing::warn!(
                    key = "DROWSE_STOP_VM",
                    value = %value,
                    "Ignoring environment override, expected true or false"
                ),
            }
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
