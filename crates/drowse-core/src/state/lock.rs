//! Cross-process exclusive lock on the state file.

use crate::error::{CoreError, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Held exclusive lock. Released on drop.
#[derive(Debug)]
pub struct StateLock {
    file: File,
    path: PathBuf,
}

impl StateLock {
    /// Try to take the lock without waiting.
    ///
    /// Returns [`CoreError::Busy`] if another holder has it.
    pub fn try_acquire(path: &Path) -> Result<Self> {
        // Don't truncate before we own the lock; the holder's pid lives here.
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| CoreError::io(format!("failed to open {}", path.display()), e))?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == fs2::lock_contended_error().kind() {
                return Err(CoreError::Busy {
                    lock_path: path.to_path_buf(),
                });
            }
            return Err(CoreError::io(
                format!("failed to lock {}", path.display()),
                e,
            ));
        }

        // Informational only.
        if file.set_len(0).is_ok() {
            let _ = writeln!(file, "{}", std::process::id());
        }

        tracing::trace!(path = %path.display(), "State lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release state lock");
        } else {
            tracing::trace!(path = %self.path.display(), "State lock released");
        }
    }
}
