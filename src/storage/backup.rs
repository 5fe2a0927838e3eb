// Backup and Restore of Shared Path Content
//
// Pre-existing content at the shared path is copied into a snapshot
// directory before the first redirect and copied back after the redirect is
// removed.
//
// Layout:
//   <backup_root>/<segment>-<YYYYmmddTHHMMSSZ>-<uuid8>/
//       meta.json
//       content/          byte-identical copy of the shared path
//
// Vacating the shared path is a rename to a sibling tombstone, so the
// original can be reinstated atomically if the redirect cannot be created.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::storage::error::{IsolationError, IsolationResult};
use crate::storage::redirect::{observe, SharedPathState};
use crate::storage::sanitize::sanitize;

const SNAPSHOT_META: &str = "meta.json";
const SNAPSHOT_CONTENT: &str = "content";

/// Suffix of the sibling the shared path is renamed to while vacated
pub const TOMBSTONE_SUFFIX: &str = ".isolaunch-vacated";

/// Suffix of the sibling a restore is copied into
pub const STAGING_SUFFIX: &str = ".isolaunch-restoring";

/// A captured copy of the shared path's original content
///
/// Owned by the caller that created the redirect; it must be handed back to
/// [`BackupStore::restore`] or [`BackupStore::discard`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSnapshot {
    /// Snapshot directory name
    pub id: String,

    /// Identity whose isolation caused the capture
    pub identity: String,

    /// Path the content was captured from
    pub source: PathBuf,

    /// Snapshot directory
    pub path: PathBuf,

    /// Capture time
    pub created_at: DateTime<Utc>,
}

impl BackupSnapshot {
    /// Directory holding the captured content
    pub fn content_path(&self) -> PathBuf {
        self.path.join(SNAPSHOT_CONTENT)
    }
}

/// Snapshot storage under a backup root
#[derive(Debug, Clone)]
pub struct BackupStore {
    root: PathBuf,
}

impl BackupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Capture the shared path if it holds real content
    ///
    /// Returns `None` when the shared path is absent or an empty directory.
    /// A redirected or broken shared path is never captured.
    pub fn capture_if_present(
        &self,
        identity: &str,
        shared: &Path,
    ) -> IsolationResult<Option<BackupSnapshot>> {
        match observe(shared)? {
            SharedPathState::Vacant | SharedPathState::Untouched { empty: true } => Ok(None),
            SharedPathState::Untouched { empty: false } => {
                self.capture(identity, shared).map(Some)
            }
            other => Err(IsolationError::invariant(
                shared,
                format!("refusing to capture, shared path is {}", other),
            )),
        }
    }

    fn capture(&self, identity: &str, shared: &Path) -> IsolationResult<BackupSnapshot> {
        let created_at = Utc::now();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let id = format!(
            "{}-{}-{}",
            sanitize(identity),
            created_at.format("%Y%m%dT%H%M%SZ"),
            &suffix[..8]
        );
        let snapshot = BackupSnapshot {
            id: id.clone(),
            identity: identity.to_string(),
            source: shared.to_path_buf(),
            path: self.root.join(&id),
            created_at,
        };

        let result = fs::create_dir_all(&snapshot.path)
            .and_then(|_| copy_tree(shared, &snapshot.content_path()))
            .and_then(|_| {
                let meta = serde_json::to_vec_pretty(&snapshot).map_err(io::Error::other)?;
                fs::write(snapshot.path.join(SNAPSHOT_META), meta)
            });

        if let Err(source) = result {
            let _ = fs::remove_dir_all(&snapshot.path);
            return Err(IsolationError::Capture {
                path: shared.to_path_buf(),
                source,
            });
        }

        tracing::info!(
            "Captured backup of {} into {}",
            shared.display(),
            snapshot.path.display()
        );
        Ok(snapshot)
    }

    /// Copy a snapshot back to the shared path and consume it
    ///
    /// The shared path must be vacant: absent or an empty directory. Restoring
    /// over a redirect or over real content is rejected.
    pub fn restore(&self, snapshot: BackupSnapshot, shared: &Path) -> IsolationResult<()> {
        let state = observe(shared)?;
        if !state.is_vacant() {
            return Err(IsolationError::RestoreTargetOccupied {
                path: shared.to_path_buf(),
            });
        }
        // Copy next to the shared path and rename into place, so a failed
        // copy never leaves partial content at the shared path
        let staging = staging_path(shared);
        discard_staging(&staging);
        if let Err(source) = copy_tree(&snapshot.content_path(), &staging) {
            discard_staging(&staging);
            // Leave the snapshot in place so the content is not lost
            return Err(IsolationError::Restore {
                snapshot: snapshot.path,
                source,
            });
        }

        if let SharedPathState::Untouched { empty: true } = state {
            if let Err(e) = fs::remove_dir(shared) {
                discard_staging(&staging);
                return Err(IsolationError::io(shared, e));
            }
        }
        if let Err(source) = fs::rename(&staging, shared) {
            discard_staging(&staging);
            return Err(IsolationError::Restore {
                snapshot: snapshot.path,
                source,
            });
        }

        tracing::info!(
            "Restored {} from backup {}",
            shared.display(),
            snapshot.id
        );
        self.discard(snapshot);
        Ok(())
    }

    /// Delete a snapshot without restoring it
    pub fn discard(&self, snapshot: BackupSnapshot) {
        if let Err(e) = fs::remove_dir_all(&snapshot.path) {
            tracing::warn!(
                "Failed to remove backup snapshot {}: {}",
                snapshot.path.display(),
                e
            );
        }
    }

    /// Load a snapshot from its directory
    pub fn open(&self, path: &Path) -> IsolationResult<BackupSnapshot> {
        let meta_path = path.join(SNAPSHOT_META);
        let bytes = fs::read(&meta_path).map_err(|e| IsolationError::io(&meta_path, e))?;
        serde_json::from_slice(&bytes).map_err(|e| IsolationError::Journal {
            path: meta_path,
            message: e.to_string(),
        })
    }

    /// Snapshot directories with their modification times
    pub fn list(&self) -> IsolationResult<Vec<(PathBuf, SystemTime)>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(IsolationError::io(&self.root, e)),
        };

        let mut snapshots = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            snapshots.push((path, modified));
        }
        snapshots.sort();
        Ok(snapshots)
    }
}

/// Original content moved aside while the shared path is redirected
#[derive(Debug)]
pub struct Tombstone {
    original: PathBuf,
    parked: PathBuf,
}

impl Tombstone {
    /// A tombstone left behind for `shared`, e.g. by an interrupted acquisition
    pub fn find(shared: &Path) -> Option<Self> {
        let parked = tombstone_path(shared);
        fs::symlink_metadata(&parked).ok().map(|_| Self {
            original: shared.to_path_buf(),
            parked,
        })
    }

    pub fn parked_path(&self) -> &Path {
        &self.parked
    }

    /// Move the original back into place
    pub fn reinstate(self) -> IsolationResult<()> {
        fs::rename(&self.parked, &self.original).map_err(|source| IsolationError::Restore {
            snapshot: self.parked.clone(),
            source,
        })?;
        tracing::debug!("Reinstated {}", self.original.display());
        Ok(())
    }

    /// Delete the parked original once the redirect is in place
    pub fn purge(self) {
        let result = if self.parked.is_dir() {
            fs::remove_dir_all(&self.parked)
        } else {
            fs::remove_file(&self.parked)
        };
        if let Err(e) = result {
            tracing::warn!(
                "Failed to purge vacated content at {}: {}",
                self.parked.display(),
                e
            );
        }
    }
}

/// Sibling path the shared path is parked at while vacated
pub fn tombstone_path(shared: &Path) -> PathBuf {
    let name = shared
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "shared".to_string());
    shared.with_file_name(format!(".{}{}", name, TOMBSTONE_SUFFIX))
}

/// Sibling path a restore is assembled in before it is renamed into place
pub fn staging_path(shared: &Path) -> PathBuf {
    let name = shared
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "shared".to_string());
    shared.with_file_name(format!(".{}{}", name, STAGING_SUFFIX))
}

/// Remove a half-assembled restore; true if one was there
pub fn discard_staging(staging: &Path) -> bool {
    match fs::symlink_metadata(staging) {
        Ok(meta) => {
            let result = if meta.is_dir() {
                fs::remove_dir_all(staging)
            } else {
                fs::remove_file(staging)
            };
            if let Err(e) = result {
                tracing::warn!("Failed to remove restore staging {}: {}", staging.display(), e);
            }
            true
        }
        Err(_) => false,
    }
}

/// Move real content out of the shared path
///
/// Returns `None` when the shared path was already absent.
pub fn vacate(shared: &Path) -> IsolationResult<Option<Tombstone>> {
    match observe(shared)? {
        SharedPathState::Vacant => Ok(None),
        SharedPathState::Untouched { .. } => {
            let parked = tombstone_path(shared);
            if fs::symlink_metadata(&parked).is_ok() {
                return Err(IsolationError::Vacate {
                    path: shared.to_path_buf(),
                    source: io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("stale tombstone at {}", parked.display()),
                    ),
                });
            }
            fs::rename(shared, &parked).map_err(|source| IsolationError::Vacate {
                path: shared.to_path_buf(),
                source,
            })?;
            Ok(Some(Tombstone {
                original: shared.to_path_buf(),
                parked,
            }))
        }
        other => Err(IsolationError::invariant(
            shared,
            format!("refusing to vacate, shared path is {}", other),
        )),
    }
}

/// Recursively copy `src` to `dst`
///
/// Regular files are copied byte for byte; symlinks inside the tree are
/// recreated rather than followed on Unix.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(src)?;

    if meta.is_file() {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(src, dst)?;
        return Ok(());
    }

    if meta.file_type().is_symlink() {
        #[cfg(unix)]
        {
            let link = fs::read_link(src)?;
            std::os::unix::fs::symlink(link, dst)?;
            return Ok(());
        }
        #[cfg(not(unix))]
        {
            tracing::warn!("Skipping link inside backup tree: {}", src.display());
            return Ok(());
        }
    }

    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        copy_tree(&entry.path(), &dst.join(entry.file_name()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_tree(root: &Path) {
        fs::create_dir_all(root.join("nested")).unwrap();
        fs::write(root.join("hello.txt"), b"hello").unwrap();
        fs::write(root.join("nested").join("bin.dat"), [0u8, 1, 2, 255]).unwrap();
    }

    fn assert_tree(root: &Path) {
        assert_eq!(fs::read(root.join("hello.txt")).unwrap(), b"hello");
        assert_eq!(
            fs::read(root.join("nested").join("bin.dat")).unwrap(),
            [0u8, 1, 2, 255]
        );
    }

    #[test]
    fn test_capture_absent_returns_none() {
        let temp = TempDir::new().unwrap();
        let store = BackupStore::new(temp.path().join("backups"));
        let snapshot = store
            .capture_if_present("alice", &temp.path().join("missing"))
            .unwrap();
        assert!(snapshot.is_none());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_capture_empty_dir_returns_none() {
        let temp = TempDir::new().unwrap();
        let shared = temp.path().join("shared");
        fs::create_dir_all(&shared).unwrap();
        let store = BackupStore::new(temp.path().join("backups"));
        assert!(store.capture_if_present("alice", &shared).unwrap().is_none());
    }

    #[test]
    fn test_capture_then_restore_is_byte_identical() {
        let temp = TempDir::new().unwrap();
        let shared = temp.path().join("shared");
        write_tree(&shared);
        let store = BackupStore::new(temp.path().join("backups"));

        let snapshot = store.capture_if_present("alice", &shared).unwrap().unwrap();
        assert!(snapshot.id.starts_with("alice-"));
        assert_tree(&snapshot.content_path());

        fs::remove_dir_all(&shared).unwrap();
        let snapshot_dir = snapshot.path.clone();
        store.restore(snapshot, &shared).unwrap();

        assert_tree(&shared);
        assert!(!snapshot_dir.exists(), "restored snapshot must be consumed");
    }

    #[test]
    fn test_restore_rejects_occupied_path() {
        let temp = TempDir::new().unwrap();
        let shared = temp.path().join("shared");
        write_tree(&shared);
        let store = BackupStore::new(temp.path().join("backups"));
        let snapshot = store.capture_if_present("alice", &shared).unwrap().unwrap();

        let err = store.restore(snapshot.clone(), &shared).unwrap_err();
        assert!(matches!(err, IsolationError::RestoreTargetOccupied { .. }));
        assert!(snapshot.path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_restore_rejects_redirected_path() {
        let temp = TempDir::new().unwrap();
        let shared = temp.path().join("shared");
        write_tree(&shared);
        let store = BackupStore::new(temp.path().join("backups"));
        let snapshot = store.capture_if_present("alice", &shared).unwrap().unwrap();

        fs::remove_dir_all(&shared).unwrap();
        let area = temp.path().join("area");
        fs::create_dir_all(&area).unwrap();
        std::os::unix::fs::symlink(&area, &shared).unwrap();

        let err = store.restore(snapshot, &shared).unwrap_err();
        assert!(matches!(err, IsolationError::RestoreTargetOccupied { .. }));
        assert!(fs::read_dir(&area).unwrap().next().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_restore_leaves_shared_path_vacant() {
        let temp = TempDir::new().unwrap();
        let shared = temp.path().join("shared");
        write_tree(&shared);
        let store = BackupStore::new(temp.path().join("backups"));
        let snapshot = store.capture_if_present("alice", &shared).unwrap().unwrap();
        fs::remove_dir_all(&shared).unwrap();

        // Sockets cannot be copied, so the copy fails after hello.txt
        let _listener =
            std::os::unix::net::UnixListener::bind(snapshot.content_path().join("zz.sock"))
                .unwrap();

        let err = store.restore(snapshot.clone(), &shared).unwrap_err();
        assert!(matches!(err, IsolationError::Restore { .. }));
        assert_eq!(observe(&shared).unwrap(), SharedPathState::Vacant);
        assert!(!staging_path(&shared).exists());
        assert_tree(&snapshot.content_path());
    }

    #[test]
    fn test_open_reads_metadata() {
        let temp = TempDir::new().unwrap();
        let shared = temp.path().join("shared");
        write_tree(&shared);
        let store = BackupStore::new(temp.path().join("backups"));
        let snapshot = store.capture_if_present("bob", &shared).unwrap().unwrap();

        let reopened = store.open(&snapshot.path).unwrap();
        assert_eq!(reopened, snapshot);
    }

    #[test]
    fn test_vacate_and_reinstate() {
        let temp = TempDir::new().unwrap();
        let shared = temp.path().join("shared");
        write_tree(&shared);

        let tombstone = vacate(&shared).unwrap().unwrap();
        assert!(!shared.exists());
        assert!(tombstone_path(&shared).exists());

        tombstone.reinstate().unwrap();
        assert_tree(&shared);
        assert!(!tombstone_path(&shared).exists());
    }

    #[test]
    fn test_vacate_and_purge() {
        let temp = TempDir::new().unwrap();
        let shared = temp.path().join("shared");
        write_tree(&shared);

        vacate(&shared).unwrap().unwrap().purge();
        assert!(!shared.exists());
        assert!(!tombstone_path(&shared).exists());
    }

    #[test]
    fn test_vacate_refuses_stale_tombstone() {
        let temp = TempDir::new().unwrap();
        let shared = temp.path().join("shared");
        write_tree(&shared);
        fs::create_dir_all(tombstone_path(&shared)).unwrap();

        let err = vacate(&shared).unwrap_err();
        assert!(matches!(err, IsolationError::Vacate { .. }));
        assert_tree(&shared);
    }

    #[test]
    fn test_vacate_absent_is_none() {
        let temp = TempDir::new().unwrap();
        assert!(vacate(&temp.path().join("nothing")).unwrap().is_none());
    }
}
