//! Cleanup sweep
//!
//! Brings the registry and the filesystem back into agreement and removes
//! leftovers: stale redirects, journals of isolations that died with the
//! process, tombstones from interrupted acquisitions, and areas or backups
//! that have not been used for longer than the configured age.
//!
//! A redirect whose owner cannot be determined is reported, never removed.

use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::storage::area::last_used;
use crate::storage::backup::{discard_staging, staging_path, Tombstone};
use crate::storage::error::IsolationResult;
use crate::storage::journal::JournalEntry;
use crate::storage::manager::IsolationManager;
use crate::storage::redirect::{force_remove_link, observe, same_path, SharedPathState};

/// What a sweep changed or refused to change
#[derive(Debug, Default, Clone, Serialize)]
pub struct SweepReport {
    /// Identities dropped from the registry because the filesystem disagreed
    pub drifted_records: Vec<String>,
    pub removed_links: Vec<PathBuf>,
    pub restored_backups: Vec<PathBuf>,
    pub reinstated_tombstone: bool,
    pub purged_tombstones: Vec<PathBuf>,
    pub purged_areas: Vec<PathBuf>,
    pub purged_backups: Vec<PathBuf>,
    /// States left untouched because they cannot be resolved safely
    pub violations: Vec<String>,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.drifted_records.is_empty()
            && self.removed_links.is_empty()
            && self.restored_backups.is_empty()
            && !self.reinstated_tombstone
            && self.purged_tombstones.is_empty()
            && self.purged_areas.is_empty()
            && self.purged_backups.is_empty()
            && self.violations.is_empty()
    }
}

impl fmt::Display for SweepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} drifted record(s), {} link(s) removed, {} backup(s) restored, \
             {} area(s) purged, {} backup(s) purged, {} violation(s)",
            self.drifted_records.len(),
            self.removed_links.len(),
            self.restored_backups.len(),
            self.purged_areas.len(),
            self.purged_backups.len(),
            self.violations.len()
        )
    }
}

impl IsolationManager {
    /// Reconcile then purge everything older than `max_age`
    ///
    /// Areas of the identities in `protect` are kept whatever their age.
    pub fn sweep(&self, max_age: Duration, protect: &[String]) -> IsolationResult<SweepReport> {
        let mut report = self.reconcile()?;
        self.purge_stale(max_age, protect, &mut report)?;

        if report.is_clean() {
            tracing::debug!("Cleanup sweep found nothing to do");
        } else {
            tracing::info!("Cleanup sweep: {}", report);
        }
        for violation in &report.violations {
            tracing::error!("Unresolved isolation state: {}", violation);
        }
        Ok(report)
    }

    /// Make the registry agree with the shared path
    ///
    /// The filesystem is trusted over the registry. Recovery from the journal
    /// only happens when no isolation is registered in this process.
    pub fn reconcile(&self) -> IsolationResult<SweepReport> {
        let mut report = SweepReport::default();
        let mut registry = self.lock();
        let shared = registry.shared_path().to_path_buf();

        for identity in registry.identities() {
            let Some(record) = registry.get(&identity).cloned() else {
                continue;
            };
            let state = observe(&shared)?;
            if state.points_to(&record.isolated_content_path) {
                continue;
            }

            match &state {
                SharedPathState::Broken { target }
                    if same_path(target, &record.isolated_content_path) =>
                {
                    if force_remove_link(self.backend(), &shared)? {
                        report.removed_links.push(shared.clone());
                    }
                }
                SharedPathState::Redirected { .. } | SharedPathState::Broken { .. } => {
                    report.violations.push(format!(
                        "{} is registered but {} is {}",
                        identity,
                        shared.display(),
                        state
                    ));
                    continue;
                }
                SharedPathState::Vacant | SharedPathState::Untouched { .. } => {}
            }

            tracing::warn!(
                "Dropping stale registration for {} (shared path is {})",
                identity,
                state
            );
            registry.unregister(&identity);
            report.drifted_records.push(identity);
        }

        if registry.is_empty() {
            match self.journal().read() {
                Ok(Some(entry)) => self.recover_journal(&entry, &shared, &mut report)?,
                Ok(None) => self.remove_orphan_link(&shared, &mut report)?,
                Err(e) => report.violations.push(format!("unreadable journal: {}", e)),
            }
        }

        if discard_staging(&staging_path(&shared)) {
            tracing::warn!("Discarded an unfinished restore next to {}", shared.display());
        }

        if let Some(tombstone) = Tombstone::find(&shared) {
            if observe(&shared)? == SharedPathState::Vacant {
                tracing::warn!(
                    "Reinstating content parked at {}",
                    tombstone.parked_path().display()
                );
                tombstone.reinstate()?;
                report.reinstated_tombstone = true;
            } else {
                let parked = tombstone.parked_path().to_path_buf();
                tombstone.purge();
                report.purged_tombstones.push(parked);
            }
        }

        Ok(report)
    }

    /// Undo an isolation journaled by a process that is gone
    fn recover_journal(
        &self,
        entry: &JournalEntry,
        shared: &Path,
        report: &mut SweepReport,
    ) -> IsolationResult<()> {
        tracing::warn!(
            "Recovering isolation of {} left by a previous run",
            entry.identity
        );

        let state = observe(shared)?;
        let ours = match &state {
            SharedPathState::Redirected { .. } => state.points_to(&entry.isolated_content_path),
            SharedPathState::Broken { target } => same_path(target, &entry.isolated_content_path),
            _ => false,
        };
        if ours {
            if force_remove_link(self.backend(), shared)? {
                report.removed_links.push(shared.to_path_buf());
            }
        } else if state.link_target().is_some() {
            report.violations.push(format!(
                "journal names {} but {} is {}",
                entry.identity,
                shared.display(),
                state
            ));
            return Ok(());
        }

        // The journal outlives its backup until the content is back in place
        if let Some(backup) = entry.backup.as_deref().filter(|p| p.exists()) {
            if !observe(shared)?.is_vacant() {
                report.violations.push(format!(
                    "journal names {} but {} already holds content, keeping backup {}",
                    entry.identity,
                    shared.display(),
                    backup.display()
                ));
                return Ok(());
            }
            let restored = self
                .backups()
                .open(backup)
                .and_then(|snapshot| self.backups().restore(snapshot, shared));
            if let Err(e) = restored {
                report.violations.push(format!(
                    "backup {} of {} could not be restored: {}",
                    backup.display(),
                    entry.identity,
                    e
                ));
                return Ok(());
            }
            report.restored_backups.push(backup.to_path_buf());
        }

        self.journal().clear()
    }

    /// Remove a redirect into our instances root that nobody owns
    fn remove_orphan_link(&self, shared: &Path, report: &mut SweepReport) -> IsolationResult<()> {
        let state = observe(shared)?;
        let Some(target) = state.link_target() else {
            return Ok(());
        };

        if is_within(target, self.layout().instances_root()) {
            if force_remove_link(self.backend(), shared)? {
                report.removed_links.push(shared.to_path_buf());
            }
        } else {
            report.violations.push(format!(
                "{} is {} and was not created by this tool",
                shared.display(),
                state
            ));
        }
        Ok(())
    }

    /// Delete areas and backups unused for longer than `max_age`
    ///
    /// The registered area, the areas of `protect` and anything the journal
    /// references are kept.
    pub fn purge_stale(
        &self,
        max_age: Duration,
        protect: &[String],
        report: &mut SweepReport,
    ) -> IsolationResult<()> {
        let registry = self.lock();
        let journal = self.journal().read().ok().flatten();
        let now = SystemTime::now();
        let is_stale =
            |time: SystemTime| now.duration_since(time).unwrap_or_default() >= max_age;

        let mut protected: Vec<PathBuf> = registry
            .active()
            .map(|r| r.isolated_content_path.clone())
            .into_iter()
            .collect();
        if let Some(entry) = &journal {
            protected.push(entry.isolated_content_path.clone());
        }
        protected.extend(protect.iter().map(|id| self.layout().resolve(id).root));

        for root in self.layout().list_area_roots()? {
            if protected.iter().any(|p| p.starts_with(&root)) {
                continue;
            }
            let Some(used) = last_used(&root) else {
                continue;
            };
            if !is_stale(used) {
                continue;
            }
            match fs::remove_dir_all(&root) {
                Ok(()) => {
                    tracing::info!("Purged unused area {}", root.display());
                    report.purged_areas.push(root);
                }
                Err(e) => tracing::warn!("Failed to purge area {}: {}", root.display(), e),
            }
        }

        let journaled_backup = journal.as_ref().and_then(|e| e.backup.clone());
        for (path, modified) in self.backups().list()? {
            if journaled_backup.as_deref() == Some(path.as_path()) || !is_stale(modified) {
                continue;
            }
            match fs::remove_dir_all(&path) {
                Ok(()) => {
                    tracing::info!("Purged stale backup {}", path.display());
                    report.purged_backups.push(path);
                }
                Err(e) => tracing::warn!("Failed to purge backup {}: {}", path.display(), e),
            }
        }

        Ok(())
    }
}

fn is_within(path: &Path, root: &Path) -> bool {
    if path.starts_with(root) {
        return true;
    }
    match (path.canonicalize(), root.canonicalize()) {
        (Ok(path), Ok(root)) => path.starts_with(root),
        _ => false,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::storage::area::AreaLayout;
    use crate::storage::backup::{tombstone_path, BackupStore};
    use crate::storage::redirect::Redirector;
    use std::os::unix::fs::symlink;
    use std::sync::Arc;
    use tempfile::TempDir;

    const HOUR: Duration = Duration::from_secs(3600);

    fn manager(temp: &TempDir) -> IsolationManager {
        IsolationManager::new(
            AreaLayout::with_defaults(temp.path().join("instances")),
            temp.path().join("app").join("LocalStorage"),
            BackupStore::new(temp.path().join("backups")),
            Arc::new(Redirector::Symlink),
        )
    }

    #[test]
    fn test_clean_state_sweeps_clean() {
        let temp = TempDir::new().unwrap();
        let report = manager(&temp).sweep(HOUR, &[]).unwrap();
        assert!(report.is_clean(), "{report}");
    }

    #[test]
    fn test_recovers_isolation_left_by_dead_process() {
        let temp = TempDir::new().unwrap();
        let shared = temp.path().join("app").join("LocalStorage");
        fs::create_dir_all(&shared).unwrap();
        fs::write(shared.join("hello.txt"), b"hello").unwrap();

        {
            let crashed = manager(&temp);
            crashed.acquire("alice").unwrap();
            // dropped without release
        }
        assert!(observe(&shared).unwrap().is_redirected());

        let report = manager(&temp).sweep(HOUR, &[]).unwrap();
        assert_eq!(report.removed_links, vec![shared.clone()]);
        assert_eq!(report.restored_backups.len(), 1);
        assert_eq!(fs::read(shared.join("hello.txt")).unwrap(), b"hello");

        let fresh = manager(&temp);
        assert!(fresh.journal().read().unwrap().is_none());
        assert!(fresh.backups().list().unwrap().is_empty());
    }

    #[test]
    fn test_drifted_record_is_dropped() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp);
        mgr.acquire("alice").unwrap();
        // Someone removed the link behind our back
        fs::remove_file(mgr.shared_path()).unwrap();

        let report = mgr.reconcile().unwrap();
        assert_eq!(report.drifted_records, vec!["alice".to_string()]);
        assert!(!mgr.is_registered("alice"));
        assert!(mgr.journal().read().unwrap().is_none());
    }

    #[test]
    fn test_orphan_link_into_instances_root_is_removed() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp);
        let area = mgr.layout().ensure_area("ghost").unwrap();
        let shared = mgr.shared_path();
        fs::create_dir_all(shared.parent().unwrap()).unwrap();
        symlink(&area.content_path, &shared).unwrap();

        let report = mgr.reconcile().unwrap();
        assert_eq!(report.removed_links, vec![shared.clone()]);
        assert_eq!(observe(&shared).unwrap(), SharedPathState::Vacant);
    }

    #[test]
    fn test_foreign_link_is_reported_not_removed() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp);
        let elsewhere = temp.path().join("elsewhere");
        fs::create_dir_all(&elsewhere).unwrap();
        let shared = mgr.shared_path();
        fs::create_dir_all(shared.parent().unwrap()).unwrap();
        symlink(&elsewhere, &shared).unwrap();

        let report = mgr.reconcile().unwrap();
        assert_eq!(report.violations.len(), 1);
        assert!(report.removed_links.is_empty());
        assert!(observe(&shared).unwrap().points_to(&elsewhere));
    }

    #[test]
    fn test_interrupted_vacate_is_reinstated() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp);
        let shared = mgr.shared_path();
        fs::create_dir_all(&shared).unwrap();
        fs::write(shared.join("hello.txt"), b"hello").unwrap();
        fs::rename(&shared, tombstone_path(&shared)).unwrap();

        let report = mgr.reconcile().unwrap();
        assert!(report.reinstated_tombstone);
        assert_eq!(fs::read(shared.join("hello.txt")).unwrap(), b"hello");
    }

    #[test]
    fn test_purge_keeps_active_area() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp);
        let idle = mgr.layout().ensure_area("bob").unwrap();
        let acq = mgr.acquire("alice").unwrap();

        let mut report = SweepReport::default();
        mgr.purge_stale(Duration::ZERO, &[], &mut report).unwrap();

        assert_eq!(report.purged_areas, vec![idle.root.clone()]);
        assert!(!idle.root.exists());
        assert!(acq.area.content_path.exists());
    }

    #[test]
    fn test_purge_respects_age() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp);
        let area = mgr.layout().ensure_area("bob").unwrap();
        mgr.layout().touch(&area).unwrap();

        let mut report = SweepReport::default();
        mgr.purge_stale(HOUR, &[], &mut report).unwrap();
        assert!(report.purged_areas.is_empty());
        assert!(area.root.exists());
    }

    #[test]
    fn test_purge_keeps_protected_identities() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp);
        let batch = mgr.layout().ensure_area("alice").unwrap();
        let idle = mgr.layout().ensure_area("bob").unwrap();

        let report = mgr.sweep(Duration::ZERO, &["alice".to_string()]).unwrap();

        assert_eq!(report.purged_areas, vec![idle.root.clone()]);
        assert!(batch.content_path.exists());
    }

    fn crash_with_content(temp: &TempDir) -> (PathBuf, PathBuf) {
        let shared = temp.path().join("app").join("LocalStorage");
        fs::create_dir_all(&shared).unwrap();
        fs::write(shared.join("hello.txt"), b"hello").unwrap();
        let crashed = manager(temp);
        crashed.acquire("alice").unwrap();
        let backup = crashed
            .journal()
            .read()
            .unwrap()
            .and_then(|entry| entry.backup)
            .unwrap();
        (shared, backup)
    }

    #[test]
    fn test_journal_kept_when_shared_path_is_occupied() {
        let temp = TempDir::new().unwrap();
        let (shared, backup) = crash_with_content(&temp);
        fs::remove_file(&shared).unwrap();
        fs::create_dir_all(&shared).unwrap();
        fs::write(shared.join("other.txt"), b"other").unwrap();

        let mgr = manager(&temp);
        let report = mgr.sweep(Duration::ZERO, &[]).unwrap();

        assert_eq!(report.violations.len(), 1, "{report}");
        assert!(report.restored_backups.is_empty());
        assert!(mgr.journal().read().unwrap().is_some());
        assert!(backup.exists());
        assert_eq!(fs::read(shared.join("other.txt")).unwrap(), b"other");
    }

    #[test]
    fn test_journal_kept_until_restore_succeeds() {
        use std::os::unix::net::UnixListener;

        let temp = TempDir::new().unwrap();
        let (shared, backup) = crash_with_content(&temp);
        let socket = backup.join("content").join("zz.sock");
        let _listener = UnixListener::bind(&socket).unwrap();

        let mgr = manager(&temp);
        let report = mgr.sweep(Duration::ZERO, &[]).unwrap();
        assert_eq!(report.violations.len(), 1, "{report}");
        assert!(observe(&shared).unwrap().is_vacant());
        assert!(mgr.journal().read().unwrap().is_some());
        assert!(backup.exists());

        fs::remove_file(&socket).unwrap();
        let report = mgr.sweep(Duration::ZERO, &[]).unwrap();
        assert_eq!(report.restored_backups, vec![backup]);
        assert_eq!(fs::read(shared.join("hello.txt")).unwrap(), b"hello");
        assert!(mgr.journal().read().unwrap().is_none());
    }
}
