// Isolation Manager
//
// Owns the shared path. The redirect operations and the registry are one
// critical section: every acquire, release and reconciliation runs under the
// same lock, so the filesystem and the declared state change together.
//
// Acquisition:
// 1. Reject if any isolation is registered, or a journaled backup still
//    awaits restoring
// 2. Reject a broken or foreign redirect at the shared path
// 3. Provision the area
// 4. Capture a backup of real content
// 5. Vacate the shared path (atomic rename to a tombstone)
// 6. Create the redirect, journal it, register it
// Any failure in 4-6 rolls back to the state found in step 2.
//
// The episode lock is separate: it is held by the orchestrator across
// acquire -> launch -> verify -> release so that two identities never
// overlap, while status queries only take the short state lock.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OwnedMutexGuard;

use crate::storage::area::{AreaLayout, IsolatedArea};
use crate::storage::backup::{vacate, BackupSnapshot, BackupStore, Tombstone};
use crate::storage::error::{IsolationError, IsolationResult};
use crate::storage::journal::{Journal, JournalEntry};
use crate::storage::redirect::{
    apply_redirect, force_remove_link, observe, remove_redirect, RedirectBackend,
    SharedPathState,
};
use crate::storage::registry::{IsolationRecord, IsolationRegistry, RecordStatus};

/// Guard held for the whole acquire..release episode of one identity
pub type EpisodeGuard = OwnedMutexGuard<()>;

/// Result of a successful acquisition
#[derive(Debug)]
pub struct Acquisition {
    pub record: IsolationRecord,
    pub area: IsolatedArea,
    /// Backup of the original content; must be handed back to `release`
    pub snapshot: Option<BackupSnapshot>,
}

/// Result of a release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Redirect removed; `restored` tells whether a backup was copied back
    Released { restored: bool },
    /// No isolation was registered for the identity
    NothingToRelease,
}

/// Read-only status for display
#[derive(Debug, Clone, Serialize)]
pub struct IsolationStatus {
    pub redirect_method: &'static str,
    pub shared_path: PathBuf,
    pub shared_state: Option<SharedPathState>,
    pub records: Vec<RecordStatus>,
    pub journal: Option<JournalEntry>,
}

/// Detailed view of one identity's isolation
#[derive(Debug, Clone, Serialize)]
pub struct IdentityInfo {
    pub identity: String,
    pub sanitized_name: String,
    pub area_root: PathBuf,
    pub content_path: PathBuf,
    pub content_exists: bool,
    pub registered: bool,
    pub active: bool,
    pub shared_state: Option<SharedPathState>,
}

#[derive(Debug)]
pub struct IsolationManager {
    layout: AreaLayout,
    backups: BackupStore,
    backend: Arc<dyn RedirectBackend>,
    journal: Journal,
    state: Mutex<IsolationRegistry>,
    episodes: Arc<tokio::sync::Mutex<()>>,
}

impl IsolationManager {
    pub fn new(
        layout: AreaLayout,
        shared_path: impl Into<PathBuf>,
        backups: BackupStore,
        backend: Arc<dyn RedirectBackend>,
    ) -> Self {
        let journal = Journal::in_dir(layout.instances_root());
        Self {
            layout,
            backups,
            backend,
            journal,
            state: Mutex::new(IsolationRegistry::new(shared_path)),
            episodes: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn layout(&self) -> &AreaLayout {
        &self.layout
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn backend(&self) -> &dyn RedirectBackend {
        self.backend.as_ref()
    }

    pub fn shared_path(&self) -> PathBuf {
        self.lock().shared_path().to_path_buf()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, IsolationRegistry> {
        // A panic mid-operation leaves the filesystem as the source of truth;
        // reconciliation repairs the registry.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait for exclusive use of the shared path for one identity's episode
    pub async fn begin_episode(&self) -> EpisodeGuard {
        Arc::clone(&self.episodes).lock_owned().await
    }

    /// Redirect the shared path into `identity`'s isolated area
    pub fn acquire(&self, identity: &str) -> IsolationResult<Acquisition> {
        let mut registry = self.lock();
        let shared = registry.shared_path().to_path_buf();

        if let Some(active) = registry.active() {
            return Err(IsolationError::RegistryConflict {
                active: active.identity.clone(),
                requested: identity.to_string(),
            });
        }
        // A journal with no registered isolation belongs to a release that
        // did not finish; its backup must be restored before anything else
        if let Some(pending) = self
            .journal
            .read()?
            .filter(|entry| entry.backup.as_deref().is_some_and(Path::exists))
        {
            return Err(IsolationError::PendingRecovery {
                identity: pending.identity,
                journal: self.journal.path().to_path_buf(),
            });
        }

        match observe(&shared)? {
            SharedPathState::Broken { target } => {
                return Err(IsolationError::invariant(
                    &shared,
                    format!("broken redirect to {}", target.display()),
                ))
            }
            SharedPathState::Redirected { target } => {
                return Err(IsolationError::invariant(
                    &shared,
                    format!(
                        "redirected to {} with no registered isolation",
                        target.display()
                    ),
                ))
            }
            SharedPathState::Vacant | SharedPathState::Untouched { .. } => {}
        }

        let area = self.layout.ensure_area(identity)?;
        let snapshot = self.backups.capture_if_present(identity, &shared)?;

        let tombstone = match vacate(&shared) {
            Ok(tombstone) => tombstone,
            Err(e) => {
                if let Some(snapshot) = snapshot {
                    self.backups.discard(snapshot);
                }
                return Err(e);
            }
        };

        if let Err(e) = apply_redirect(self.backend.as_ref(), &area.content_path, &shared) {
            self.roll_back(&shared, tombstone, snapshot);
            return Err(e);
        }

        let record = IsolationRecord::new(identity, &area.content_path);
        let entry = JournalEntry {
            identity: identity.to_string(),
            isolated_content_path: area.content_path.clone(),
            created_at: record.created_at,
            shared_path: shared.clone(),
            backup: snapshot.as_ref().map(|s| s.path.clone()),
        };
        if let Err(e) = self.journal.write(&entry) {
            self.roll_back(&shared, tombstone, snapshot);
            return Err(e);
        }
        if let Err(e) = registry.register(record.clone()) {
            if let Err(clear_err) = self.journal.clear() {
                tracing::warn!("Failed to clear isolation journal: {}", clear_err);
            }
            self.roll_back(&shared, tombstone, snapshot);
            return Err(e);
        }

        if let Some(tombstone) = tombstone {
            tombstone.purge();
        }
        if let Err(e) = self.layout.touch(&area) {
            tracing::warn!("Failed to stamp area for {}: {}", identity, e);
        }

        tracing::info!(
            "Storage isolated for {}: {} -> {}",
            identity,
            shared.display(),
            area.content_path.display()
        );
        Ok(Acquisition {
            record,
            area,
            snapshot,
        })
    }

    /// Undo a partially applied acquisition
    fn roll_back(
        &self,
        shared: &Path,
        tombstone: Option<Tombstone>,
        snapshot: Option<BackupSnapshot>,
    ) {
        if let Err(e) = force_remove_link(self.backend.as_ref(), shared) {
            tracing::error!("Rollback could not remove link at {}: {}", shared.display(), e);
        }
        if let Some(tombstone) = tombstone {
            if let Err(e) = tombstone.reinstate() {
                tracing::error!("Rollback could not reinstate {}: {}", shared.display(), e);
            }
        }
        if let Some(snapshot) = snapshot {
            self.backups.discard(snapshot);
        }
    }

    /// Remove `identity`'s redirect and restore the backup taken at acquisition
    ///
    /// Releasing an identity that is not registered is a benign no-op.
    pub fn release(
        &self,
        identity: &str,
        snapshot: Option<BackupSnapshot>,
    ) -> IsolationResult<ReleaseOutcome> {
        let mut registry = self.lock();
        let shared = registry.shared_path().to_path_buf();

        let Some(record) = registry.get(identity).cloned() else {
            if let Some(snapshot) = snapshot {
                tracing::warn!(
                    "No isolation registered for {}, leaving backup {} for the sweep",
                    identity,
                    snapshot.path.display()
                );
            }
            tracing::info!("Nothing to release for {}", identity);
            return Ok(ReleaseOutcome::NothingToRelease);
        };

        match observe(&shared)? {
            state if state.points_to(&record.isolated_content_path) => {
                remove_redirect(self.backend.as_ref(), &shared, &record.isolated_content_path)?;
            }
            SharedPathState::Vacant => {
                tracing::warn!(
                    "Redirect for {} already removed from {}",
                    identity,
                    shared.display()
                );
            }
            other => {
                tracing::error!(
                    "Shared path drifted while {} was isolated: {}",
                    identity,
                    other
                );
                return Err(IsolationError::invariant(
                    &shared,
                    format!(
                        "expected redirect to {}, found {}",
                        record.isolated_content_path.display(),
                        other
                    ),
                ));
            }
        }

        registry.unregister(identity);

        let restored = match snapshot {
            Some(snapshot) => {
                // Journal stays in place on failure so the sweep can retry
                self.backups.restore(snapshot, &shared)?;
                true
            }
            None => false,
        };

        if let Err(e) = self.journal.clear() {
            tracing::warn!("Failed to clear isolation journal: {}", e);
        }

        tracing::info!(
            "Storage isolation released for {} (backup restored: {})",
            identity,
            restored
        );
        Ok(ReleaseOutcome::Released { restored })
    }

    /// Tear down `identity`'s isolation whatever state it is in
    ///
    /// Removes a broken link if it belongs to the identity and restores the
    /// journaled backup when the shared path ends up vacant.
    pub fn force_release(&self, identity: &str) -> IsolationResult<ReleaseOutcome> {
        let mut registry = self.lock();
        let shared = registry.shared_path().to_path_buf();

        let Some(record) = registry.get(identity).cloned() else {
            return Ok(ReleaseOutcome::NothingToRelease);
        };

        let state = observe(&shared)?;
        let ours = match &state {
            SharedPathState::Redirected { .. } => state.points_to(&record.isolated_content_path),
            SharedPathState::Broken { target } => target == &record.isolated_content_path,
            _ => false,
        };
        if ours {
            force_remove_link(self.backend.as_ref(), &shared)?;
        } else if state.link_target().is_some() {
            tracing::error!(
                "Shared path points elsewhere while forcing release of {}: {}",
                identity,
                state
            );
        }

        registry.unregister(identity);
        let restored = self.restore_journaled_backup(identity, &shared);
        tracing::warn!("Forced release of {}", identity);
        Ok(ReleaseOutcome::Released { restored })
    }

    /// Restore the backup recorded in the journal for `identity`, then clear it
    pub(crate) fn restore_journaled_backup(&self, identity: &str, shared: &Path) -> bool {
        let entry = match self.journal.read() {
            Ok(Some(entry)) if entry.identity == identity => entry,
            Ok(_) => return false,
            Err(e) => {
                tracing::error!("Cannot read isolation journal: {}", e);
                return false;
            }
        };

        let mut restored = false;
        if let Some(backup) = entry.backup.as_deref().filter(|p| p.exists()) {
            match self
                .backups
                .open(backup)
                .and_then(|snapshot| self.backups.restore(snapshot, shared))
            {
                Ok(()) => restored = true,
                Err(e) => {
                    tracing::error!("Could not restore journaled backup for {}: {}", identity, e);
                    return false;
                }
            }
        }

        if let Err(e) = self.journal.clear() {
            tracing::warn!("Failed to clear isolation journal: {}", e);
        }
        restored
    }

    /// Force-release every registered identity
    pub fn release_all(&self) -> usize {
        let identities = self.lock().identities();
        let mut released = 0;
        for identity in identities {
            match self.force_release(&identity) {
                Ok(ReleaseOutcome::Released { .. }) => released += 1,
                Ok(ReleaseOutcome::NothingToRelease) => {}
                Err(e) => tracing::error!("Failed to release {}: {}", identity, e),
            }
        }
        released
    }

    pub fn is_registered(&self, identity: &str) -> bool {
        self.lock().get(identity).is_some()
    }

    /// Registered and verified on disk
    pub fn is_active(&self, identity: &str) -> bool {
        self.lock().is_active(identity)
    }

    /// Registered isolations, or the journaled one when this process has
    /// none registered (another process holds it)
    pub fn status(&self) -> IsolationStatus {
        let snapshot = self.lock().snapshot();
        let journal = self.journal.read().ok().flatten();
        let mut records = snapshot.records;
        if records.is_empty() {
            if let Some(entry) = &journal {
                records.push(RecordStatus {
                    identity: entry.identity.clone(),
                    area_path: entry.isolated_content_path.clone(),
                    active: snapshot
                        .shared_state
                        .as_ref()
                        .is_some_and(|s| s.points_to(&entry.isolated_content_path)),
                    target_exists: entry.isolated_content_path.exists(),
                    created_at: entry.created_at,
                });
            }
        }
        IsolationStatus {
            redirect_method: self.backend.name(),
            shared_path: snapshot.shared_path,
            shared_state: snapshot.shared_state,
            records,
            journal,
        }
    }

    pub fn identity_info(&self, identity: &str) -> IdentityInfo {
        let area = self.layout.resolve(identity);
        let registry = self.lock();
        IdentityInfo {
            identity: identity.to_string(),
            sanitized_name: area.segment.to_string(),
            content_exists: area.content_path.exists(),
            area_root: area.root,
            content_path: area.content_path,
            registered: registry.get(identity).is_some(),
            active: registry.is_active(identity),
            shared_state: observe(registry.shared_path()).ok(),
        }
    }
}
