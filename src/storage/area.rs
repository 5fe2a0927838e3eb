// Isolated Area Provisioning
//
// Each identity owns a directory tree under the instances root:
//
//   <instances_root>/<SafeSegment>/
//       <content_dir>/     redirect target for the shared path
//       logs/ cache/ content/ versions/
//       .last-used         stamp refreshed on every acquisition
//
// Provisioning is idempotent and never deletes or truncates existing content.

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::storage::error::{IsolationError, IsolationResult};
use crate::storage::sanitize::{sanitize, SafeSegment};

/// Name of the stamp file refreshed each time an area is isolated
pub const LAST_USED_STAMP: &str = ".last-used";

/// Default auxiliary subdirectories
pub const DEFAULT_AUX_DIRS: &[&str] = &["logs", "cache", "content", "versions"];

/// Default name of the redirected content subdirectory
pub const DEFAULT_CONTENT_DIR: &str = "storage";

/// A resolved per-identity area
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IsolatedArea {
    /// Identity name as given by the caller
    pub identity: String,

    /// Sanitized directory segment
    pub segment: SafeSegment,

    /// `<instances_root>/<segment>`
    pub root: PathBuf,

    /// Directory the shared path is redirected to
    pub content_path: PathBuf,
}

/// Layout of isolated areas under an instances root
#[derive(Debug, Clone)]
pub struct AreaLayout {
    instances_root: PathBuf,
    content_dir: String,
    aux_dirs: Vec<String>,
}

impl AreaLayout {
    pub fn new(
        instances_root: impl Into<PathBuf>,
        content_dir: impl Into<String>,
        aux_dirs: Vec<String>,
    ) -> Self {
        Self {
            instances_root: instances_root.into(),
            content_dir: content_dir.into(),
            aux_dirs,
        }
    }

    /// Layout with the default content and auxiliary directory names
    pub fn with_defaults(instances_root: impl Into<PathBuf>) -> Self {
        Self::new(
            instances_root,
            DEFAULT_CONTENT_DIR,
            DEFAULT_AUX_DIRS.iter().map(|d| d.to_string()).collect(),
        )
    }

    pub fn instances_root(&self) -> &Path {
        &self.instances_root
    }

    /// Resolve the area for an identity without touching the filesystem
    pub fn resolve(&self, identity: &str) -> IsolatedArea {
        let segment = sanitize(identity);
        let root = self.instances_root.join(segment.as_str());
        let content_path = root.join(&self.content_dir);
        IsolatedArea {
            identity: identity.to_string(),
            segment,
            root,
            content_path,
        }
    }

    /// Ensure the area and all its subdirectories exist
    ///
    /// Safe to call repeatedly; content written by earlier sessions is kept.
    pub fn ensure_area(&self, identity: &str) -> IsolationResult<IsolatedArea> {
        let area = self.resolve(identity);

        let mut dirs = Vec::with_capacity(self.aux_dirs.len() + 1);
        dirs.push(area.content_path.clone());
        dirs.extend(self.aux_dirs.iter().map(|d| area.root.join(d)));

        for dir in dirs {
            fs::create_dir_all(&dir).map_err(|source| IsolationError::Provision {
                path: dir.clone(),
                source,
            })?;
        }

        tracing::debug!(
            "Isolated area ready for {}: {}",
            identity,
            area.root.display()
        );
        Ok(area)
    }

    /// Refresh the last-used stamp of an area
    pub fn touch(&self, area: &IsolatedArea) -> IsolationResult<()> {
        let stamp = area.root.join(LAST_USED_STAMP);
        fs::write(&stamp, chrono::Utc::now().to_rfc3339())
            .map_err(|e| IsolationError::io(&stamp, e))
    }

    /// All area directories currently under the instances root
    pub fn list_area_roots(&self) -> IsolationResult<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.instances_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(IsolationError::io(&self.instances_root, e)),
        };

        let mut roots = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| IsolationError::io(&self.instances_root, e))?;
            let file_type = entry
                .file_type()
                .map_err(|e| IsolationError::io(entry.path(), e))?;
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if file_type.is_dir() && !hidden {
                roots.push(entry.path());
            }
        }
        roots.sort();
        Ok(roots)
    }
}

/// Time an area was last isolated, falling back to the directory mtime
pub fn last_used(area_root: &Path) -> Option<SystemTime> {
    fs::metadata(area_root.join(LAST_USED_STAMP))
        .and_then(|m| m.modified())
        .or_else(|_| fs::metadata(area_root).and_then(|m| m.modified()))
        .ok()
}
