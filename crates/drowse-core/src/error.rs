//! Error types for drowse-core.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for drowse-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur during state and lifecycle operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// No VM record has been created yet.
    #[error("VM not found")]
    VmNotFound,

    /// The VM exists but is not running.
    #[error("VM is not running")]
    VmNotRunning,

    /// No environment with this name is recorded.
    #[error("environment {0} not found")]
    EnvironmentNotFound(String),

    /// An environment with this name already exists.
    #[error("environment {0} already exists")]
    EnvironmentExists(String),

    /// The name cannot be used as a container name.
    #[error("invalid environment name {0:?}")]
    InvalidName(String),

    /// Another environment already tracks this project directory.
    #[error("project {path} is already tracked by environment {existing}")]
    ProjectAlreadyTracked {
        /// Canonical project path.
        path: PathBuf,
        /// Name of the environment that owns it.
        existing: String,
    },

    /// The environment is stopped and will not be restarted automatically.
    #[error("environment {0} is stopped")]
    EnvironmentStopped(String),

    /// The state says running but the runtime has no such container.
    #[error("container for environment {0} is not running")]
    ContainerMissing(String),

    /// Another process holds the state lock.
    #[error("state is locked by another process ({})", lock_path.display())]
    Busy {
        /// Lock file that could not be acquired.
        lock_path: PathBuf,
    },

    /// The ephemeral port cursor ran past the valid port range.
    #[error("no ephemeral ports left (cursor at {0})")]
    PortsExhausted(u32),

    /// A port specification could not be parsed.
    #[error("invalid port spec {spec:?}: {reason}")]
    InvalidPortSpec {
        /// The offending input.
        spec: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The state file was written by a newer schema.
    #[error("state schema {found} is newer than supported schema {supported}")]
    UnsupportedSchema {
        /// Schema found on disk.
        found: u32,
        /// Highest schema this build understands.
        supported: u32,
    },

    /// A schema migration step failed.
    #[error("failed to migrate state from schema {from}: {reason}")]
    Migration {
        /// Schema the failing step started from.
        from: u32,
        /// Why it failed.
        reason: String,
    },

    /// Error from the VM supervisor or container runtime.
    #[error("backend error: {0}")]
    Backend(#[from] drowse_vm::BackendError),

    /// I/O error with context.
    #[error("{context}: {source}")]
    Io {
        /// What we were doing.
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid settings.
    #[error("configuration error: {0}")]
    Config(String),
}

impl CoreError {
    /// Build an [`CoreError::Io`] with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Check if this error indicates a not-found condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::VmNotFound | Self::EnvironmentNotFound(_))
    }

    /// Check if the state lock was contended.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }

    /// A suggested corrective command for user-facing errors.
    pub fn hint(&self) -> Option<String> {
        match self {
            Self::VmNotFound => Some("Run 'drowse vm up' to create it".into()),
            Self::VmNotRunning => Some("Run 'drowse vm up' first".into()),
            Self::EnvironmentNotFound(name) => {
                Some(format!("Create it with 'drowse create --name {name}'"))
            }
            Self::EnvironmentExists(name) => Some(format!(
                "Pick another name or remove it with 'drowse rm {name} --force'"
            )),
            Self::ProjectAlreadyTracked { existing, .. } => {
                Some(format!("Use the existing environment: 'drowse enter {existing}'"))
            }
            Self::EnvironmentStopped(name) => Some(format!(
                "Recreate it with 'drowse rm {name} --force && drowse create --name {name}', \
                 or restart the container with 'limactl shell drowse -- podman start {name}'"
            )),
            Self::ContainerMissing(name) => Some(format!(
                "It may have been deleted manually; recreate it with 'drowse rm {name} --force && drowse create --name {name}'"
            )),
            Self::InvalidName(_) => {
                Some("Use letters, digits, '-', '_' or '.', starting with a letter or digit".into())
            }
            Self::Busy { .. } => Some("Another drowse command is running; retry shortly".into()),
            Self::UnsupportedSchema { .. } => Some("Upgrade drowse to read this state file".into()),
            _ => None,
        }
    }
}
