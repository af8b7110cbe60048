//! Thin wrapper around `tokio::process::Command` for the backend CLIs.

use crate::error::{BackendError, Result};
use std::ffi::OsStr;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, trace};

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Process exit code (-1 when terminated by a signal).
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl ExecOutput {
    /// Whether the process exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

fn render<S: AsRef<OsStr>>(program: &str, args: &[S]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(&arg.as_ref().to_string_lossy());
    }
    line
}

fn spawn_error(program: &str, err: std::io::Error) -> BackendError {
    if err.kind() == std::io::ErrorKind::NotFound {
        BackendError::ToolUnavailable {
            tool: program.to_string(),
            source: err,
        }
    } else {
        BackendError::Io(err)
    }
}

/// Run a program to completion, capturing its output regardless of exit code.
pub async fn capture<S: AsRef<OsStr>>(program: &str, args: &[S]) -> Result<ExecOutput> {
    debug!(command = %render(program, args), "running backend command");
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| spawn_error(program, e))?;

    let result = ExecOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };
    trace!(
        exit_code = result.exit_code,
        stdout_len = result.stdout.len(),
        stderr_len = result.stderr.len(),
        "backend command finished"
    );
    Ok(result)
}

/// Run a program and fail with [`BackendError::CommandFailed`] on non-zero exit.
pub async fn checked<S: AsRef<OsStr>>(program: &str, args: &[S]) -> Result<ExecOutput> {
    let output = capture(program, args).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(BackendError::CommandFailed {
            command: render(program, args),
            code: Some(output.exit_code),
            stderr: output.stderr.trim().to_string(),
        })
    }
}

/// Run a program attached to the caller's terminal and return its exit code.
pub async fn interactive<S: AsRef<OsStr>>(program: &str, args: &[S]) -> Result<i32> {
    debug!(command = %render(program, args), "running interactive backend command");
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await
        .map_err(|e| spawn_error(program, e))?;
    Ok(status.code().unwrap_or(-1))
}
