//! Collaborator Contracts
//!
//! The orchestrator never starts external processes itself. It talks to
//! three seams:
//!
//! - **`LaunchCollaborator`**: starts the external session for an identity
//! - **`LivenessProbe`**: counts running external processes
//! - **`CredentialSource`**: hands out an opaque token per identity
//!
//! Production implementations run configured commands, count processes via
//! `sysinfo` and read tokens from a JSON file. Tests inject mocks.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use sysinfo::{ProcessesToUpdate, System};
use tokio::process::Command;

/// Environment variable carrying the authentication token to launched commands
pub const TOKEN_ENV: &str = "ISOLAUNCH_AUTH_TOKEN";

/// Environment variable carrying the identity name to launched commands
pub const IDENTITY_ENV: &str = "ISOLAUNCH_IDENTITY";

/// Environment variable carrying the redirected content path
pub const CONTENT_PATH_ENV: &str = "ISOLAUNCH_CONTENT_PATH";

/// Everything a collaborator needs to start one identity's session
#[derive(Clone)]
pub struct LaunchRequest {
    pub identity: String,
    /// Opaque target descriptor (server link, session id, ...)
    pub target: String,
    /// Passed through untouched
    pub token: Option<String>,
    /// Isolated area the shared path currently points at
    pub content_path: PathBuf,
}

impl fmt::Debug for LaunchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchRequest")
            .field("identity", &self.identity)
            .field("target", &self.target)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("content_path", &self.content_path)
            .finish()
    }
}

/// How the external session was started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMethod {
    Helper,
    Direct,
}

impl fmt::Display for LaunchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helper => write!(f, "helper"),
            Self::Direct => write!(f, "direct"),
        }
    }
}

/// Confirmation returned by a collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchHandle {
    pub method: LaunchMethod,
    /// Collaborator-specific handle such as a pid
    pub external_handle: Option<String>,
}

#[async_trait]
pub trait LaunchCollaborator: Send + Sync {
    /// Start the external session; success means it was started, not that it is live
    async fn launch(&self, request: &LaunchRequest) -> Result<LaunchHandle>;

    /// Secondary trigger used when verification stalls
    async fn fallback_trigger(&self, request: &LaunchRequest) -> Result<()>;

    fn name(&self) -> &str;
}

#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// Number of external processes currently running
    async fn count(&self) -> Result<usize>;
}

#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Token for `identity`, `None` if the identity needs none
    async fn token(&self, identity: &str) -> Result<Option<String>>;
}

/// A program plus argument template
///
/// `{identity}` and `{target}` in arguments are substituted per launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// `None` for an empty program
    pub fn non_empty(program: &str, args: &[String]) -> Option<Self> {
        let program = program.trim();
        (!program.is_empty()).then(|| Self::new(program, args.to_vec()))
    }

    fn render_args(&self, request: &LaunchRequest) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{identity}", &request.identity)
                    .replace("{target}", &request.target)
            })
            .collect()
    }

    fn command(&self, request: &LaunchRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.render_args(request))
            .env(IDENTITY_ENV, &request.identity)
            .env(CONTENT_PATH_ENV, &request.content_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(token) = &request.token {
            cmd.env(TOKEN_ENV, token);
        }
        cmd
    }
}

/// Launches through configured commands
///
/// The helper program is run to completion and must exit successfully. When
/// no helper is configured, or it cannot be found, the direct program is
/// spawned and left running. The direct program doubles as the fallback
/// trigger during verification.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    helper: Option<CommandSpec>,
    direct: Option<CommandSpec>,
}

impl CommandLauncher {
    pub fn new(helper: Option<CommandSpec>, direct: Option<CommandSpec>) -> Self {
        Self { helper, direct }
    }

    async fn run_helper(&self, helper: &CommandSpec, request: &LaunchRequest) -> Result<bool> {
        let mut cmd = helper.command(request);
        cmd.kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && self.direct.is_some() => {
                tracing::warn!(
                    "Launch helper {} not found, falling back to direct launch",
                    helper.program
                );
                return Ok(false);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to spawn {}", helper.program))
            }
        };

        let status = child
            .wait()
            .await
            .with_context(|| format!("Failed to wait for {}", helper.program))?;
        if !status.success() {
            anyhow::bail!("{} exited with {}", helper.program, status);
        }
        Ok(true)
    }

    fn spawn_direct(&self, direct: &CommandSpec, request: &LaunchRequest) -> Result<Option<u32>> {
        let child = direct
            .command(request)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", direct.program))?;
        // Not awaited: the session outlives the launch call
        Ok(child.id())
    }
}

#[async_trait]
impl LaunchCollaborator for CommandLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<LaunchHandle> {
        if let Some(helper) = &self.helper {
            if self.run_helper(helper, request).await? {
                return Ok(LaunchHandle {
                    method: LaunchMethod::Helper,
                    external_handle: None,
                });
            }
        }

        let direct = self
            .direct
            .as_ref()
            .context("No launch program configured")?;
        let pid = self.spawn_direct(direct, request)?;
        Ok(LaunchHandle {
            method: LaunchMethod::Direct,
            external_handle: pid.map(|p| p.to_string()),
        })
    }

    async fn fallback_trigger(&self, request: &LaunchRequest) -> Result<()> {
        match &self.direct {
            Some(direct) => {
                self.spawn_direct(direct, request)?;
                Ok(())
            }
            None => {
                tracing::debug!("No fallback program configured for {}", request.identity);
                Ok(())
            }
        }
    }

    fn name(&self) -> &str {
        "command"
    }
}

/// Counts processes with an exact executable name
pub struct ProcessCountProbe {
    process_name: String,
    system: tokio::sync::Mutex<System>,
}

impl ProcessCountProbe {
    pub fn new(process_name: impl Into<String>) -> Self {
        Self {
            process_name: process_name.into(),
            system: tokio::sync::Mutex::new(System::new()),
        }
    }
}

#[async_trait]
impl LivenessProbe for ProcessCountProbe {
    async fn count(&self) -> Result<usize> {
        let mut system = self.system.lock().await;
        system.refresh_processes(ProcessesToUpdate::All, true);
        Ok(system
            .processes_by_exact_name(OsStr::new(&self.process_name))
            .count())
    }
}

/// Tokens keyed by identity
#[derive(Clone, Default)]
pub struct MapCredentials {
    tokens: HashMap<String, String>,
}

impl MapCredentials {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }

    /// Read a JSON object of `identity -> token`
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read credentials from {:?}", path))?;
        let tokens: HashMap<String, String> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse credentials from {:?}", path))?;
        tracing::debug!("Loaded credentials for {} identities", tokens.len());
        Ok(Self { tokens })
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl fmt::Debug for MapCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapCredentials")
            .field("identities", &self.tokens.len())
            .finish()
    }
}

#[async_trait]
impl CredentialSource for MapCredentials {
    async fn token(&self, identity: &str) -> Result<Option<String>> {
        Ok(self.tokens.get(identity).cloned())
    }
}
