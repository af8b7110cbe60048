//! Transactional access to the state document.

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::paths::StatePaths;
use crate::state::lock::StateLock;
use crate::state::model::StateDocument;
use crate::state::persist::{Advisory, Loaded, StateFile};
use std::sync::Arc;

/// Entry point for reading and mutating persisted state.
///
/// Every mutation runs inside [`StateStore::with_exclusive_session`]: the
/// lock is taken, the document is read, the callback runs, and the document
/// is written back only if the callback succeeded.
#[derive(Clone)]
pub struct StateStore {
    paths: StatePaths,
    file: StateFile,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("state_file", &self.paths.state_file)
            .field("lock_file", &self.paths.lock_file)
            .finish()
    }
}

impl StateStore {
    /// Store using the wall clock.
    pub fn new(paths: StatePaths) -> Self {
        Self::with_clock(paths, Arc::new(SystemClock))
    }

    /// Store using `clock` for `updated_at` stamps.
    pub fn with_clock(paths: StatePaths, clock: Arc<dyn Clock>) -> Self {
        Self {
            file: StateFile::new(paths.state_file.clone()),
            paths,
            clock,
        }
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    /// Run `f` against the document under the exclusive lock.
    ///
    /// Fails with [`CoreError::Busy`](crate::CoreError::Busy) right away if
    /// another session holds the lock. Nothing is written when `f` errors,
    /// and the lock is released on every exit path.
    pub fn with_exclusive_session<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut StateDocument) -> Result<T>,
    {
        self.paths.ensure_home()?;
        let _lock = StateLock::try_acquire(&self.paths.lock_file)?;

        let Loaded {
            mut document,
            advisories,
        } = self.file.read()?;
        log_advisories(&advisories);

        let value = f(&mut document)?;
        self.file.write(&mut document, self.clock.now())?;
        Ok(value)
    }

    /// Lock-free read. The result may be stale by the time it is used.
    ///
    /// A corrupt file reads as an empty document with an
    /// [`Advisory::Unreadable`]; only a locked session moves it aside.
    pub fn read_only(&self) -> Result<Loaded> {
        self.file.peek()
    }
}

fn log_advisories(advisories: &[Advisory]) {
    for advisory in advisories {
        match advisory {
            Advisory::Quarantined { path } => {
                tracing::warn!(backup = %path.display(), "Recovered from a corrupt state file")
            }
            Advisory::Unreadable { reason } => {
                tracing::warn!(reason = %reason, "State file is unreadable")
            }
            Advisory::Migrated { from, to } => {
                tracing::debug!(from, to, "State schema upgraded in session")
            }
        }
    }
}
