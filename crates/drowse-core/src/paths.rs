//! Locations of drowse's files.

use crate::error::{CoreError, Result};
use std::path::{Path, PathBuf};

/// Environment variable that overrides the base directory.
pub const HOME_ENV: &str = "DROWSE_HOME";

/// Every file drowse reads or writes, rooted at one directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub home: PathBuf,
    pub state_file: PathBuf,
    pub lock_file: PathBuf,
    pub config_file: PathBuf,
    pub lima_template: PathBuf,
}

impl StatePaths {
    /// Paths under `home`.
    pub fn new(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            state_file: home.join("state.json"),
            lock_file: home.join("state.lock"),
            config_file: home.join("config.toml"),
            lima_template: home.join("lima.yaml"),
            home,
        }
    }

    /// `$DROWSE_HOME`, or `~/.drowse`.
    pub fn from_env() -> Result<Self> {
        if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            return Ok(Self::new(home));
        }
        let home = dirs::home_dir()
            .ok_or_else(|| CoreError::Config("cannot determine home directory".into()))?;
        Ok(Self::new(home.join(".drowse")))
    }

    /// Create the base directory, owner-only.
    pub fn ensure_home(&self) -> Result<()> {
        create_private_dir(&self.home)
    }
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .map_err(|e| CoreError::io(format!("failed to create {}", dir.display()), e))
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .map_err(|e| CoreError::io(format!("failed to create {}", dir.display()), e))
}
