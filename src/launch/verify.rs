// Liveness Verification
//
// After a launch the external process takes a while to show up. Poll the
// liveness probe until the count rises above the pre-launch baseline. Partway
// through the window the collaborator's secondary trigger is fired once.
// The window is a hard ceiling.

use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::launch::collaborator::{LaunchCollaborator, LaunchRequest, LivenessProbe};

/// Polling bounds for verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Elapsed time after which the secondary trigger fires
    pub fallback_after: Duration,
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(25),
            poll_interval: Duration::from_secs(2),
            fallback_after: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Live {
        count: usize,
        elapsed: Duration,
        fallback_used: bool,
    },
    TimedOut {
        elapsed: Duration,
        fallback_used: bool,
    },
}

impl Verification {
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live { .. })
    }

    pub fn fallback_used(&self) -> bool {
        match self {
            Self::Live { fallback_used, .. } | Self::TimedOut { fallback_used, .. } => {
                *fallback_used
            }
        }
    }
}

/// Wait until `probe` reports more than `baseline` processes
pub async fn verify_liveness(
    probe: &dyn LivenessProbe,
    collaborator: &dyn LaunchCollaborator,
    request: &LaunchRequest,
    baseline: usize,
    policy: &VerifyPolicy,
) -> Verification {
    let start = Instant::now();
    let mut fallback_used = false;

    loop {
        match probe.count().await {
            Ok(count) if count > baseline => {
                let elapsed = start.elapsed();
                tracing::info!(
                    "{} verified live ({} running, baseline {}) after {:?}",
                    request.identity,
                    count,
                    baseline,
                    elapsed
                );
                return Verification::Live {
                    count,
                    elapsed,
                    fallback_used,
                };
            }
            Ok(count) => tracing::debug!(
                "Waiting for {}: {} running, baseline {}",
                request.identity,
                count,
                baseline
            ),
            Err(e) => tracing::warn!("Liveness probe failed: {:#}", e),
        }

        let elapsed = start.elapsed();
        if !fallback_used && elapsed >= policy.fallback_after {
            fallback_used = true;
            tracing::warn!(
                "{} not live after {:?}, firing {} fallback",
                request.identity,
                elapsed,
                collaborator.name()
            );
            if let Err(e) = collaborator.fallback_trigger(request).await {
                tracing::warn!("Fallback trigger failed for {}: {:#}", request.identity, e);
            }
        }

        let elapsed = start.elapsed();
        if elapsed >= policy.timeout {
            tracing::warn!(
                "{} not verified live within {:?}",
                request.identity,
                policy.timeout
            );
            return Verification::TimedOut {
                elapsed,
                fallback_used,
            };
        }
        sleep(policy.poll_interval.min(policy.timeout - elapsed)).await;
    }
}
