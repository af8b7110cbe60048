//! Reading and atomically writing the state file.

use crate::error::{CoreError, Result};
use crate::state::migrate;
use crate::state::model::{StateDocument, CURRENT_SCHEMA};
use chrono::{DateTime, Utc};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Something worth telling the user that did not stop the read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advisory {
    /// The file could not be parsed and was moved aside.
    Quarantined {
        /// Where the unreadable bytes now live.
        path: PathBuf,
    },
    /// The file could not be parsed and was left in place for the next
    /// locked session to quarantine.
    Unreadable {
        /// Why decoding failed.
        reason: String,
    },
    /// The document was upgraded from an older schema.
    Migrated { from: u32, to: u32 },
}

/// What to do with a file that cannot be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnCorrupt {
    /// Move it aside. Only safe while holding the state lock.
    Quarantine,
    /// Leave it alone and report it.
    Report,
}

/// Result of a read: the document plus any advisories.
#[derive(Debug, Clone)]
pub struct Loaded {
    pub document: StateDocument,
    pub advisories: Vec<Advisory>,
}

/// The on-disk state document.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document. Callers must hold the state lock.
    ///
    /// A missing file yields a fresh document. An unparseable one is moved
    /// to `<file>.corrupt-<unix-seconds>` and a fresh document is returned.
    /// A document from a newer schema is an error and is left in place.
    pub fn read(&self) -> Result<Loaded> {
        self.load(OnCorrupt::Quarantine)
    }

    /// Load the document without the lock.
    ///
    /// Same as [`StateFile::read`] except that an unparseable file is never
    /// touched: a locked session may be replacing it concurrently.
    pub fn peek(&self) -> Result<Loaded> {
        self.load(OnCorrupt::Report)
    }

    fn load(&self, on_corrupt: OnCorrupt) -> Result<Loaded> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Loaded {
                    document: StateDocument::default(),
                    advisories: Vec::new(),
                });
            }
            Err(e) => {
                return Err(CoreError::io(
                    format!("failed to read {}", self.path.display()),
                    e,
                ))
            }
        };

        let mut raw = match serde_json::from_slice::<serde_json::Value>(&bytes) {
            Ok(value @ serde_json::Value::Object(_)) => value,
            Ok(_) => return self.recover("document is not a JSON object", on_corrupt),
            Err(e) => return self.recover(&e.to_string(), on_corrupt),
        };

        let from = migrate::upgrade(&mut raw)?;

        let document: StateDocument = match serde_json::from_value(raw) {
            Ok(doc) => doc,
            Err(e) => return self.recover(&e.to_string(), on_corrupt),
        };

        let mut advisories = Vec::new();
        if from < CURRENT_SCHEMA {
            tracing::info!(from, to = CURRENT_SCHEMA, "Migrated state document");
            advisories.push(Advisory::Migrated {
                from,
                to: CURRENT_SCHEMA,
            });
        }
        Ok(Loaded {
            document,
            advisories,
        })
    }

    fn recover(&self, reason: &str, on_corrupt: OnCorrupt) -> Result<Loaded> {
        if on_corrupt == OnCorrupt::Report {
            tracing::debug!(reason = %reason, "State file is unreadable, reading as empty");
            return Ok(Loaded {
                document: StateDocument::default(),
                advisories: vec![Advisory::Unreadable {
                    reason: reason.to_string(),
                }],
            });
        }
        let quarantined = self.quarantine()?;
        tracing::warn!(
            path = %quarantined.display(),
            reason = %reason,
            "State file was unreadable; moved it aside and started fresh"
        );
        Ok(Loaded {
            document: StateDocument::default(),
            advisories: vec![Advisory::Quarantined { path: quarantined }],
        })
    }

    fn quarantine(&self) -> Result<PathBuf> {
        let base = format!(
            "{}.corrupt-{}",
            self.path.display(),
            Utc::now().timestamp()
        );
        let mut target = PathBuf::from(&base);
        let mut n = 1;
        while target.exists() {
            target = PathBuf::from(format!("{base}-{n}"));
            n += 1;
        }
        std::fs::rename(&self.path, &target).map_err(|e| {
            CoreError::io(
                format!("failed to quarantine {}", self.path.display()),
                e,
            )
        })?;
        Ok(target)
    }

    /// Atomically replace the file with `doc`.
    ///
    /// Stamps the current schema and `now` onto the document first.
    pub fn write(&self, doc: &mut StateDocument, now: DateTime<Utc>) -> Result<()> {
        doc.schema = CURRENT_SCHEMA;
        doc.updated_at = Some(now);
        let content = serde_json::to_vec_pretty(doc)?;

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)
            .map_err(|e| CoreError::io(format!("failed to create {}", dir.display()), e))?;

        // Same directory so the rename never crosses filesystems.
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| CoreError::io("failed to create temp file", e))?;
        tmp.write_all(&content)
            .map_err(|e| CoreError::io("failed to write temp file", e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| CoreError::io("failed to sync temp file", e))?;
        tmp.persist(&self.path).map_err(|e| {
            CoreError::io(format!("failed to persist {}", self.path.display()), e.error)
        })?;

        sync_dir(dir)?;
        tracing::trace!(path = %self.path.display(), "State written");
        Ok(())
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    std::fs::File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| CoreError::io(format!("failed to sync {}", dir.display()), e))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::model::fixtures::{env, t0};
    use crate::state::model::Status;

    fn state_file(dir: &tempfile::TempDir) -> StateFile {
        StateFile::new(dir.path().join("state.json"))
    }

    fn corrupt_files(dir: &tempfile::TempDir) -> Vec<PathBuf> {
        let mut found: Vec<PathBuf> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.to_string_lossy().contains(".corrupt-"))
            .collect();
        found.sort();
        found
    }

    #[test]
    fn test_missing_file_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = state_file(&dir).read().unwrap();
        assert!(loaded.advisories.is_empty());
        assert_eq!(loaded.document.schema, CURRENT_SCHEMA);
        assert!(loaded.document.vm().is_none());
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let file = state_file(&dir);
        let mut doc = StateDocument::default();
        doc.upsert_environment(env("dev", Status::Running, t0()));
        file.write(&mut doc, t0()).unwrap();

        let loaded = file.read().unwrap();
        assert_eq!(loaded.document, doc);
        assert_eq!(loaded.document.updated_at, Some(t0()));
        // No temp files left behind.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_garbage_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let file = state_file(&dir);
        std::fs::write(file.path(), b"{not json").unwrap();

        let loaded = file.read().unwrap();
        assert!(loaded.document.environments.is_empty());
        let quarantined = corrupt_files(&dir);
        assert_eq!(quarantined.len(), 1);
        assert_eq!(
            loaded.advisories,
            vec![Advisory::Quarantined {
                path: quarantined[0].clone()
            }]
        );
        assert_eq!(std::fs::read(&quarantined[0]).unwrap(), b"{not json");
        assert!(!file.path().exists());
    }

    #[test]
    fn test_empty_file_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let file = state_file(&dir);
        std::fs::write(file.path(), b"").unwrap();
        let loaded = file.read().unwrap();
        assert!(matches!(
            loaded.advisories.as_slice(),
            [Advisory::Quarantined { .. }]
        ));
    }

    #[test]
    fn test_peek_leaves_corrupt_file_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let file = state_file(&dir);
        std::fs::write(file.path(), b"{not json").unwrap();

        let loaded = file.peek().unwrap();
        assert!(loaded.document.environments.is_empty());
        assert!(matches!(
            loaded.advisories.as_slice(),
            [Advisory::Unreadable { .. }]
        ));
        assert_eq!(std::fs::read(file.path()).unwrap(), b"{not json");
        assert!(corrupt_files(&dir).is_empty());
    }

    #[test]
    fn test_peek_after_locked_recovery_sees_new_document() {
        let dir = tempfile::tempdir().unwrap();
        let file = state_file(&dir);
        std::fs::write(file.path(), b"{not json").unwrap();

        // A lock-free reader sees the corrupt bytes first.
        assert!(matches!(
            file.peek().unwrap().advisories.as_slice(),
            [Advisory::Unreadable { .. }]
        ));

        // A locked session then recovers and commits.
        let mut doc = file.read().unwrap().document;
        doc.upsert_environment(env("dev", Status::Running, t0()));
        file.write(&mut doc, t0()).unwrap();

        // Reading again never disturbs the committed document.
        let loaded = file.peek().unwrap();
        assert!(loaded.advisories.is_empty());
        assert!(loaded.document.environment("dev").is_some());
        assert_eq!(corrupt_files(&dir).len(), 1);
    }

    #[test]
    fn test_quarantine_name_collision_gets_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let file = state_file(&dir);
        std::fs::write(file.path(), b"one").unwrap();
        file.read().unwrap();
        std::fs::write(file.path(), b"two").unwrap();
        file.read().unwrap();

        let quarantined = corrupt_files(&dir);
        // Either distinct seconds or a -N suffix; both files survive.
        assert_eq!(quarantined.len(), 2);
    }

    #[test]
    fn test_wrong_shape_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let file = state_file(&dir);
        std::fs::write(file.path(), br#"{"schema": 3, "host": "nope"}"#).unwrap();
        let loaded = file.read().unwrap();
        assert_eq!(corrupt_files(&dir).len(), 1);
        assert_eq!(loaded.advisories.len(), 1);
    }

    #[test]
    fn test_newer_schema_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let file = state_file(&dir);
        let body = format!(r#"{{"schema": {}}}"#, CURRENT_SCHEMA + 1);
        std::fs::write(file.path(), &body).unwrap();

        let err = file.read().unwrap_err();
        assert!(matches!(err, CoreError::UnsupportedSchema { .. }));
        assert_eq!(std::fs::read_to_string(file.path()).unwrap(), body);
        assert!(corrupt_files(&dir).is_empty());
    }

    #[test]
    fn test_v1_document_is_migrated_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let file = state_file(&dir);
        std::fs::write(
            file.path(),
            r#"{
                "host": {"uid": 501, "gid": 20, "arch": "aarch64", "os": "macos"},
                "ports": {"next_ephemeral": 51000, "reserved": {"dev": [3000]}},
                "environments": {
                    "dev": {
                        "name": "dev",
                        "image": "ubuntu:24.04",
                        "runtime": "podman",
                        "project_path": "/Users/me/dev",
                        "ports": {"web": 3000},
                        "user": {"uid": 501, "gid": 20, "name": "me"},
                        "status": "running",
                        "last_active": "2024-05-01T12:00:00Z"
                    }
                }
            }"#,
        )
        .unwrap();

        let loaded = file.read().unwrap();
        assert_eq!(
            loaded.advisories,
            vec![Advisory::Migrated {
                from: 1,
                to: CURRENT_SCHEMA
            }]
        );
        let dev = loaded.document.environment("dev").unwrap();
        assert!(dev.migrated_dirs.is_empty());
        assert_eq!(dev.ports.len(), 1);
        assert_eq!(dev.ports[0].host_port, 3000);
        assert_eq!(loaded.document.port_owner(3000), Some("dev"));
    }
}
