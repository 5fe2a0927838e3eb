//! Launch orchestration
//!
//! Runs identities one at a time through storage isolation, an external
//! launch, liveness verification and teardown.

// Collaborator seams and their production implementations
pub mod collaborator;

pub mod error;

// Per-identity state machine and batch loop
pub mod orchestrator;

pub mod record;

// Backoff for storage acquisition
pub mod retry;

pub mod verify;

pub use collaborator::{
    CommandLauncher, CommandSpec, CredentialSource, LaunchCollaborator, LaunchHandle,
    LaunchMethod, LaunchRequest, LivenessProbe, MapCredentials, ProcessCountProbe,
};
pub use error::{LaunchError, LaunchResult};
pub use orchestrator::{
    BatchControl, BatchReport, EventKind, IdentityOutcome, LaunchOrchestrator, LaunchStage,
    OrchestratorSettings, StatusEvent,
};
pub use record::{LaunchLog, LaunchRecord};
pub use retry::RetryConfig;
pub use verify::{Verification, VerifyPolicy};
