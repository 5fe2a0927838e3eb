// Shared Path Redirection
//
// Makes the shared path resolve into an isolated area and undoes it again.
//
// Two mechanisms are supported, selected once at startup:
// - Symlink:  native directory symlink (Unix, or Windows with privilege)
// - Junction: Windows directory junction, no elevation required
//
// Key invariants:
// - A failed apply leaves the shared path exactly as it was found
// - Removal deletes only the link artifact, never the target content
// - A dangling link (Broken) is reported, never silently removed here

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::storage::error::{IsolationError, IsolationResult};

/// Observed state of the shared path
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SharedPathState {
    /// Nothing exists at the shared path
    Vacant,

    /// Real content, no redirect applied
    Untouched { empty: bool },

    /// Redirect present and its target exists
    Redirected { target: PathBuf },

    /// Redirect present but its target is missing
    Broken { target: PathBuf },
}

impl SharedPathState {
    pub fn is_redirected(&self) -> bool {
        matches!(self, Self::Redirected { .. })
    }

    /// Whether the path can receive a new redirect or a restore
    pub fn is_vacant(&self) -> bool {
        matches!(self, Self::Vacant | Self::Untouched { empty: true })
    }

    /// Link target, for redirected and broken states
    pub fn link_target(&self) -> Option<&Path> {
        match self {
            Self::Redirected { target } | Self::Broken { target } => Some(target),
            _ => None,
        }
    }

    /// Whether the path is redirected to `expected`
    pub fn points_to(&self, expected: &Path) -> bool {
        match self {
            Self::Redirected { target } => same_path(target, expected),
            _ => false,
        }
    }
}

impl fmt::Display for SharedPathState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vacant => write!(f, "vacant"),
            Self::Untouched { empty: true } => write!(f, "untouched (empty)"),
            Self::Untouched { empty: false } => write!(f, "untouched"),
            Self::Redirected { target } => write!(f, "redirected -> {}", target.display()),
            Self::Broken { target } => write!(f, "BROKEN -> {} (target missing)", target.display()),
        }
    }
}

/// Observe the shared path without following or modifying it
pub fn observe(shared: &Path) -> IsolationResult<SharedPathState> {
    let meta = match fs::symlink_metadata(shared) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(SharedPathState::Vacant),
        Err(e) => return Err(IsolationError::io(shared, e)),
    };

    if meta.file_type().is_symlink() {
        let raw = fs::read_link(shared).map_err(|e| IsolationError::io(shared, e))?;
        let target = if raw.is_relative() {
            shared.parent().map(|p| p.join(&raw)).unwrap_or(raw)
        } else {
            raw
        };
        return Ok(if fs::metadata(shared).is_ok() {
            SharedPathState::Redirected { target }
        } else {
            SharedPathState::Broken { target }
        });
    }

    let empty = if meta.is_dir() {
        fs::read_dir(shared)
            .map_err(|e| IsolationError::io(shared, e))?
            .next()
            .is_none()
    } else {
        false
    };
    Ok(SharedPathState::Untouched { empty })
}

/// Compare two paths, resolving them when both exist
pub fn same_path(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Platform link mechanism
///
/// Implemented by [`Redirector`] in production; tests substitute failing
/// backends to exercise rollback paths.
pub trait RedirectBackend: Send + Sync + fmt::Debug {
    /// Create a directory link at `link` resolving to `target`
    fn create(&self, target: &Path, link: &Path) -> io::Result<()>;

    /// Remove the link artifact at `link` without touching its target
    fn remove(&self, link: &Path) -> io::Result<()>;

    /// Mechanism name for logs and status output
    fn name(&self) -> &'static str;
}

/// Configured redirect mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedirectMethod {
    /// Junction on Windows, symlink elsewhere
    #[default]
    Auto,
    Symlink,
    Junction,
}

impl FromStr for RedirectMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "symlink" => Ok(Self::Symlink),
            "junction" => Ok(Self::Junction),
            other => anyhow::bail!(
                "Invalid redirect method: {}. Must be one of: auto, symlink, junction",
                other
            ),
        }
    }
}

/// Production redirect mechanism, chosen once at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redirector {
    Symlink,
    Junction,
}

impl Redirector {
    /// Pick the mechanism for the current platform
    pub fn detect() -> Self {
        if cfg!(windows) {
            Self::Junction
        } else {
            Self::Symlink
        }
    }

    pub fn from_method(method: RedirectMethod) -> Self {
        match method {
            RedirectMethod::Auto => Self::detect(),
            RedirectMethod::Symlink => Self::Symlink,
            RedirectMethod::Junction => Self::Junction,
        }
    }
}

impl RedirectBackend for Redirector {
    fn create(&self, target: &Path, link: &Path) -> io::Result<()> {
        match self {
            Self::Symlink => create_symlink_dir(target, link),
            Self::Junction => create_junction(target, link),
        }
    }

    fn remove(&self, link: &Path) -> io::Result<()> {
        remove_link(link)
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Symlink => "symlink",
            Self::Junction => "junction",
        }
    }
}

#[cfg(unix)]
fn create_symlink_dir(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn create_symlink_dir(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

#[cfg(windows)]
fn create_junction(target: &Path, link: &Path) -> io::Result<()> {
    let output = std::process::Command::new("cmd")
        .arg("/C")
        .arg("mklink")
        .arg("/J")
        .arg(link)
        .arg(target)
        .output()?;
    if output.status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!(
            "mklink /J exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

#[cfg(not(windows))]
fn create_junction(_target: &Path, _link: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "directory junctions are only available on Windows",
    ))
}

#[cfg(windows)]
fn remove_link(link: &Path) -> io::Result<()> {
    // Directory symlinks and junctions are both removed as directories
    fs::remove_dir(link)
}

#[cfg(not(windows))]
fn remove_link(link: &Path) -> io::Result<()> {
    fs::remove_file(link)
}

/// Redirect the vacant shared path to `target`
///
/// The caller must have vacated the shared path first. On failure any stray
/// link left behind by the backend is removed before returning.
pub fn apply_redirect(
    backend: &dyn RedirectBackend,
    target: &Path,
    shared: &Path,
) -> IsolationResult<()> {
    let before = observe(shared)?;
    if before != SharedPathState::Vacant {
        return Err(IsolationError::invariant(
            shared,
            format!("cannot redirect, shared path is {}", before),
        ));
    }

    if let Some(parent) = shared.parent() {
        fs::create_dir_all(parent).map_err(|e| IsolationError::io(parent, e))?;
    }

    if let Err(source) = backend.create(target, shared) {
        discard_stray_link(backend, shared);
        return Err(IsolationError::Redirect {
            link: shared.to_path_buf(),
            target: target.to_path_buf(),
            source,
        });
    }

    let after = observe(shared)?;
    if !after.points_to(target) {
        discard_stray_link(backend, shared);
        return Err(IsolationError::Redirect {
            link: shared.to_path_buf(),
            target: target.to_path_buf(),
            source: io::Error::other(format!("redirect did not resolve, observed {}", after)),
        });
    }

    tracing::info!(
        "Redirect created ({}): {} -> {}",
        backend.name(),
        shared.display(),
        target.display()
    );
    Ok(())
}

/// Remove the redirect at `shared`, which must currently point to `expected`
pub fn remove_redirect(
    backend: &dyn RedirectBackend,
    shared: &Path,
    expected: &Path,
) -> IsolationResult<()> {
    match observe(shared)? {
        SharedPathState::Redirected { target } if same_path(&target, expected) => {
            backend
                .remove(shared)
                .map_err(|source| IsolationError::RedirectRemoval {
                    link: shared.to_path_buf(),
                    source,
                })?;
            tracing::info!("Redirect removed: {}", shared.display());
            Ok(())
        }
        SharedPathState::Broken { target } => Err(IsolationError::invariant(
            shared,
            format!("redirect is broken, target {} is missing", target.display()),
        )),
        other => Err(IsolationError::invariant(
            shared,
            format!(
                "expected redirect to {}, found {}",
                expected.display(),
                other
            ),
        )),
    }
}

/// Remove whatever link sits at `shared`, broken or not
///
/// Only used by forced teardown and reconciliation. Real content is never
/// touched; returns `false` when there was no link to remove.
pub fn force_remove_link(backend: &dyn RedirectBackend, shared: &Path) -> IsolationResult<bool> {
    match fs::symlink_metadata(shared) {
        Ok(meta) if meta.file_type().is_symlink() => {
            backend
                .remove(shared)
                .map_err(|source| IsolationError::RedirectRemoval {
                    link: shared.to_path_buf(),
                    source,
                })?;
            tracing::warn!("Forcibly removed link at {}", shared.display());
            Ok(true)
        }
        Ok(_) => Ok(false),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(IsolationError::io(shared, e)),
    }
}

fn discard_stray_link(backend: &dyn RedirectBackend, shared: &Path) {
    if let Ok(meta) = fs::symlink_metadata(shared) {
        if meta.file_type().is_symlink() {
            if let Err(e) = backend.remove(shared) {
                tracing::error!(
                    "Failed to remove stray link at {}: {}",
                    shared.display(),
                    e
                );
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Creates the link, then reports failure anyway
    #[derive(Debug)]
    struct HalfFailingBackend;

    impl RedirectBackend for HalfFailingBackend {
        fn create(&self, target: &Path, link: &Path) -> io::Result<()> {
            std::os::unix::fs::symlink(target, link)?;
            Err(io::Error::other("simulated failure after link creation"))
        }

        fn remove(&self, link: &Path) -> io::Result<()> {
            fs::remove_file(link)
        }

        fn name(&self) -> &'static str {
            "half-failing"
        }
    }

    fn setup() -> (TempDir, PathBuf, PathBuf) {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("area").join("storage");
        fs::create_dir_all(&target).unwrap();
        let shared = temp.path().join("app").join("LocalStorage");
        (temp, target, shared)
    }

    #[test]
    fn test_observe_vacant_and_untouched() {
        let (_temp, _target, shared) = setup();
        assert_eq!(observe(&shared).unwrap(), SharedPathState::Vacant);

        fs::create_dir_all(&shared).unwrap();
        assert_eq!(
            observe(&shared).unwrap(),
            SharedPathState::Untouched { empty: true }
        );

        fs::write(shared.join("f"), b"x").unwrap();
        assert_eq!(
            observe(&shared).unwrap(),
            SharedPathState::Untouched { empty: false }
        );
    }

    #[test]
    fn test_apply_and_remove_redirect() {
        let (_temp, target, shared) = setup();
        let redirector = Redirector::Symlink;

        apply_redirect(&redirector, &target, &shared).unwrap();
        let state = observe(&shared).unwrap();
        assert!(state.points_to(&target));

        fs::write(shared.join("through-link"), b"data").unwrap();
        assert!(target.join("through-link").exists());

        remove_redirect(&redirector, &shared, &target).unwrap();
        assert_eq!(observe(&shared).unwrap(), SharedPathState::Vacant);
        // Target content survives link removal
        assert!(target.join("through-link").exists());
    }

    #[test]
    fn test_apply_rejects_occupied_shared_path() {
        let (_temp, target, shared) = setup();
        fs::create_dir_all(&shared).unwrap();
        fs::write(shared.join("original"), b"keep").unwrap();

        let err = apply_redirect(&Redirector::Symlink, &target, &shared).unwrap_err();
        assert!(matches!(err, IsolationError::InvariantViolation { .. }));
        assert_eq!(fs::read(shared.join("original")).unwrap(), b"keep");
    }

    #[test]
    fn test_failed_apply_removes_stray_link() {
        let (_temp, target, shared) = setup();

        let err = apply_redirect(&HalfFailingBackend, &target, &shared).unwrap_err();
        assert!(matches!(err, IsolationError::Redirect { .. }));
        assert_eq!(observe(&shared).unwrap(), SharedPathState::Vacant);
    }

    #[test]
    fn test_broken_redirect_fails_loudly() {
        let (_temp, target, shared) = setup();
        let redirector = Redirector::Symlink;
        apply_redirect(&redirector, &target, &shared).unwrap();

        fs::remove_dir_all(&target).unwrap();
        assert!(matches!(
            observe(&shared).unwrap(),
            SharedPathState::Broken { .. }
        ));

        let err = remove_redirect(&redirector, &shared, &target).unwrap_err();
        assert!(matches!(err, IsolationError::InvariantViolation { .. }));
        // The dangling link is still there for reconciliation to handle
        assert!(fs::symlink_metadata(&shared).is_ok());

        assert!(force_remove_link(&redirector, &shared).unwrap());
        assert_eq!(observe(&shared).unwrap(), SharedPathState::Vacant);
    }

    #[test]
    fn test_remove_rejects_unexpected_target() {
        let (temp, target, shared) = setup();
        let other = temp.path().join("other");
        fs::create_dir_all(&other).unwrap();
        let redirector = Redirector::Symlink;
        apply_redirect(&redirector, &other, &shared).unwrap();

        let err = remove_redirect(&redirector, &shared, &target).unwrap_err();
        assert!(matches!(err, IsolationError::InvariantViolation { .. }));
        assert!(observe(&shared).unwrap().points_to(&other));
    }

    #[test]
    fn test_force_remove_leaves_real_content() {
        let (_temp, _target, shared) = setup();
        fs::create_dir_all(&shared).unwrap();
        assert!(!force_remove_link(&Redirector::Symlink, &shared).unwrap());
        assert!(shared.is_dir());
    }

    #[test]
    fn test_junction_unsupported_off_windows() {
        let (_temp, target, shared) = setup();
        let err = apply_redirect(&Redirector::Junction, &target, &shared).unwrap_err();
        assert!(matches!(err, IsolationError::Redirect { .. }));
        assert_eq!(observe(&shared).unwrap(), SharedPathState::Vacant);
    }

    #[test]
    fn test_redirect_method_parse() {
        assert_eq!("Junction".parse::<RedirectMethod>().unwrap(), RedirectMethod::Junction);
        assert!("hardlink".parse::<RedirectMethod>().is_err());
        assert_eq!(Redirector::from_method(RedirectMethod::Auto), Redirector::Symlink);
    }
}
