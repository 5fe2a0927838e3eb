// Active Isolation Journal
//
// The registry lives in memory and is lost if the process dies while the
// shared path is redirected. The journal records the active isolation on
// disk so the startup sweep can undo it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::storage::error::{IsolationError, IsolationResult};

/// Journal file name inside the instances root
pub const JOURNAL_FILE: &str = ".active-isolation.json";

/// On-disk copy of the active isolation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub identity: String,
    pub isolated_content_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub shared_path: PathBuf,
    /// Snapshot directory captured for this isolation, if any
    pub backup: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            path: dir.join(JOURNAL_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically replace the journal with `entry`
    pub fn write(&self, entry: &JournalEntry) -> IsolationResult<()> {
        let data = serde_json::to_vec_pretty(entry).map_err(|e| IsolationError::Journal {
            path: self.path.clone(),
            message: e.to_string(),
        })?;

        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(|e| IsolationError::io(parent, e))?;

        let mut temp =
            tempfile::NamedTempFile::new_in(parent).map_err(|e| IsolationError::io(parent, e))?;
        temp.write_all(&data)
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| IsolationError::io(temp.path(), e))?;
        temp.persist(&self.path)
            .map_err(|e| IsolationError::io(&self.path, e.error))?;
        Ok(())
    }

    /// Read the journal; `None` when no isolation was journaled
    pub fn read(&self) -> IsolationResult<Option<JournalEntry>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(IsolationError::io(&self.path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| IsolationError::Journal {
                path: self.path.clone(),
                message: e.to_string(),
            })
    }

    pub fn clear(&self) -> IsolationResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(IsolationError::io(&self.path, e)),
        }
    }
}
