// Isolation Registry
//
// In-memory map of identity -> active isolation record. The shared path can
// only point at one area, so the registry holds at most one record and
// rejects a second identity outright.
//
// The registry is not internally synchronized; `IsolationManager` keeps it
// behind the same lock as the redirect operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::storage::error::{IsolationError, IsolationResult};
use crate::storage::redirect::{observe, SharedPathState};

/// An active redirect of the shared path into an identity's area
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationRecord {
    pub identity: String,
    pub isolated_content_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl IsolationRecord {
    pub fn new(identity: impl Into<String>, isolated_content_path: impl Into<PathBuf>) -> Self {
        Self {
            identity: identity.into(),
            isolated_content_path: isolated_content_path.into(),
            created_at: Utc::now(),
        }
    }
}

/// Per-identity status line for display
#[derive(Debug, Clone, Serialize)]
pub struct RecordStatus {
    pub identity: String,
    pub area_path: PathBuf,
    pub active: bool,
    pub target_exists: bool,
    pub created_at: DateTime<Utc>,
}

/// Registry contents plus the observed shared path state
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub shared_path: PathBuf,
    pub shared_state: Option<SharedPathState>,
    pub records: Vec<RecordStatus>,
}

#[derive(Debug)]
pub struct IsolationRegistry {
    shared_path: PathBuf,
    records: HashMap<String, IsolationRecord>,
}

impl IsolationRegistry {
    pub fn new(shared_path: impl Into<PathBuf>) -> Self {
        Self {
            shared_path: shared_path.into(),
            records: HashMap::new(),
        }
    }

    pub fn shared_path(&self) -> &Path {
        &self.shared_path
    }

    /// Register an isolation
    ///
    /// Fails with `RegistryConflict` when a different identity is registered.
    pub fn register(&mut self, record: IsolationRecord) -> IsolationResult<()> {
        if let Some(active) = self
            .records
            .values()
            .find(|r| r.identity != record.identity)
        {
            return Err(IsolationError::RegistryConflict {
                active: active.identity.clone(),
                requested: record.identity,
            });
        }

        tracing::debug!("Registered isolation for {}", record.identity);
        self.records.insert(record.identity.clone(), record);
        Ok(())
    }

    pub fn unregister(&mut self, identity: &str) -> Option<IsolationRecord> {
        let removed = self.records.remove(identity);
        if removed.is_some() {
            tracing::debug!("Unregistered isolation for {}", identity);
        }
        removed
    }

    pub fn get(&self, identity: &str) -> Option<&IsolationRecord> {
        self.records.get(identity)
    }

    /// The registered record, if any
    pub fn active(&self) -> Option<&IsolationRecord> {
        self.records.values().next()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn identities(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.records.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// True only if `identity` is registered and the shared path really
    /// points at its area
    pub fn is_active(&self, identity: &str) -> bool {
        let Some(record) = self.records.get(identity) else {
            return false;
        };
        match observe(&self.shared_path) {
            Ok(state) => state.points_to(&record.isolated_content_path),
            Err(e) => {
                tracing::warn!(
                    "Cannot observe shared path {}: {}",
                    self.shared_path.display(),
                    e
                );
                false
            }
        }
    }

    /// All records with their verified state
    pub fn snapshot(&self) -> RegistrySnapshot {
        let shared_state = observe(&self.shared_path).ok();
        let mut records: Vec<RecordStatus> = self
            .records
            .values()
            .map(|r| RecordStatus {
                identity: r.identity.clone(),
                area_path: r.isolated_content_path.clone(),
                active: shared_state
                    .as_ref()
                    .is_some_and(|s| s.points_to(&r.isolated_content_path)),
                target_exists: r.isolated_content_path.exists(),
                created_at: r.created_at,
            })
            .collect();
        records.sort_by(|a, b| a.identity.cmp(&b.identity));

        RegistrySnapshot {
            shared_path: self.shared_path.clone(),
            shared_state,
            records,
        }
    }
}
