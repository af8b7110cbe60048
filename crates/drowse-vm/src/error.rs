//! Error types for drowse-vm.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for drowse-vm operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors reported by the VM supervisor or the container runtime.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The external tool could not be launched at all.
    #[error("{tool} is not available: {source}")]
    ToolUnavailable {
        /// Program that failed to launch.
        tool: String,
        #[source]
        source: std::io::Error,
    },

    /// The external tool ran but exited unsuccessfully.
    #[error("`{command}` failed (exit {code:?}): {stderr}")]
    CommandFailed {
        /// Rendered command line.
        command: String,
        /// Exit code, if the process was not killed by a signal.
        code: Option<i32>,
        /// Trimmed stderr output.
        stderr: String,
    },

    /// The container runtime does not know the named container.
    #[error("no such container: {0}")]
    NoSuchContainer(String),

    /// Tool output could not be understood.
    #[error("failed to parse {what}: {details}")]
    Parse {
        /// What was being parsed.
        what: &'static str,
        /// Parser message.
        details: String,
    },

    /// Waiting for a state transition exceeded its deadline.
    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout {
        /// The awaited condition.
        what: String,
        /// How long we waited.
        waited: Duration,
    },

    /// The backend entered a failure state.
    #[error("VM entered failure state: {0}")]
    Failed(String),

    /// Invalid sizing or template configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// True when the backend tool itself is missing from the host.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::ToolUnavailable { .. })
    }
}
