//! Storage isolation
//!
//! Gives each identity a private storage area and points the single shared
//! storage path at it for the duration of one launch.

pub mod area;
pub mod backup;
pub mod cleanup;
pub mod error;
pub mod journal;
pub mod manager;
pub mod redirect;
pub mod registry;
pub mod sanitize;

pub use area::{AreaLayout, IsolatedArea};
pub use backup::{BackupSnapshot, BackupStore};
pub use cleanup::SweepReport;
pub use error::{IsolationError, IsolationResult};
pub use journal::{Journal, JournalEntry};
pub use manager::{
    Acquisition, EpisodeGuard, IdentityInfo, IsolationManager, IsolationStatus, ReleaseOutcome,
};
pub use redirect::{RedirectBackend, RedirectMethod, Redirector, SharedPathState};
pub use registry::{IsolationRecord, IsolationRegistry};
pub use sanitize::{sanitize, SafeSegment};
