// Configuration File Support
//
// TOML configuration with environment variable overrides. The default file
// lives in the platform config directory, e.g. ~/.config/isolaunch/config.toml
// on Linux. A missing file means defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::launch::{CommandLauncher, CommandSpec, OrchestratorSettings, RetryConfig, VerifyPolicy};
use crate::storage::area::{DEFAULT_AUX_DIRS, DEFAULT_CONTENT_DIR};
use crate::storage::{AreaLayout, BackupStore, IsolationManager, RedirectMethod, Redirector};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    pub launch: LaunchConfig,
    pub orchestrator: OrchestratorConfig,
    pub retry: RetrySection,
    pub cleanup: CleanupConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// Where isolated areas, backups and the shared path live
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Parent of all per-identity areas
    pub instances_root: PathBuf,

    /// The host application's storage directory; required to launch
    pub shared_path: Option<PathBuf>,

    /// Parent of backup snapshots
    pub backup_root: PathBuf,

    /// Area subdirectory the shared path is redirected to
    pub content_dir: String,

    /// Extra area subdirectories
    pub aux_dirs: Vec<String>,

    /// auto, symlink or junction
    pub redirect_method: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = Config::data_dir();
        Self {
            instances_root: data_dir.join("instances"),
            shared_path: None,
            backup_root: data_dir.join("backups"),
            content_dir: DEFAULT_CONTENT_DIR.to_string(),
            aux_dirs: DEFAULT_AUX_DIRS.iter().map(|d| d.to_string()).collect(),
            redirect_method: "auto".to_string(),
        }
    }
}

/// External launch commands
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LaunchConfig {
    /// Helper program run to completion for each launch (empty: none)
    pub program: String,

    /// Helper arguments; `{identity}` and `{target}` are substituted
    pub args: Vec<String>,

    /// Program spawned directly, and as the verification fallback
    pub fallback_program: String,

    pub fallback_args: Vec<String>,

    /// Executable name counted by the liveness probe
    pub process_name: String,

    /// Admission limit on running external processes (0: unlimited)
    pub max_running_processes: usize,

    pub launch_timeout_secs: u64,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            program: String::new(),
            args: vec!["{identity}".to_string(), "{target}".to_string()],
            fallback_program: String::new(),
            fallback_args: vec!["{target}".to_string()],
            process_name: String::new(),
            max_running_processes: 10,
            launch_timeout_secs: 60,
        }
    }
}

/// Per-identity timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub verify_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub fallback_after_secs: u64,
    /// How long the isolation stays after the process is seen live
    pub claim_delay_secs: u64,
    pub inter_identity_delay_secs: u64,
    pub inter_identity_jitter_secs: u64,
    pub admission_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            verify_timeout_secs: 25,
            poll_interval_secs: 2,
            fallback_after_secs: 15,
            claim_delay_secs: 10,
            inter_identity_delay_secs: 5,
            inter_identity_jitter_secs: 0,
            admission_timeout_secs: 120,
        }
    }
}

/// Storage acquisition retry policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1500,
            max_delay_ms: 6000,
            jitter: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CleanupConfig {
    /// Areas and backups unused for longer than this are purged
    pub max_age_hours: u64,

    /// Run the sweep before every batch
    pub sweep_on_startup: bool,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            max_age_hours: 168,
            sweep_on_startup: true,
        }
    }
}

impl Config {
    /// Load configuration from the default config directory
    ///
    /// A missing file yields defaults; a malformed one is an error.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        let config = config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn project_dirs() -> Option<directories::ProjectDirs> {
        directories::ProjectDirs::from("com", "isolaunch", "isolaunch")
    }

    /// Default configuration file path
    pub fn config_path() -> PathBuf {
        if let Some(proj_dirs) = Self::project_dirs() {
            proj_dirs.config_dir().join("config.toml")
        } else {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home)
                .join(".config")
                .join("isolaunch")
                .join("config.toml")
        }
    }

    /// Default parent of instances and backups
    pub fn data_dir() -> PathBuf {
        if let Some(proj_dirs) = Self::project_dirs() {
            proj_dirs.data_local_dir().to_path_buf()
        } else {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".local").join("share").join("isolaunch")
        }
    }

    /// Apply environment variable overrides
    ///
    /// - ISOLAUNCH_LOG_LEVEL
    /// - ISOLAUNCH_LOG_FORMAT
    /// - ISOLAUNCH_INSTANCES_ROOT
    /// - ISOLAUNCH_SHARED_PATH
    /// - ISOLAUNCH_BACKUP_ROOT
    /// - ISOLAUNCH_REDIRECT_METHOD
    /// - ISOLAUNCH_MAX_ATTEMPTS
    /// - ISOLAUNCH_CLEANUP_MAX_AGE_HOURS
    fn apply_env_overrides(mut self) -> Self {
        if let Ok(level) = std::env::var("ISOLAUNCH_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("ISOLAUNCH_LOG_FORMAT") {
            self.logging.format = format;
        }

        if let Ok(root) = std::env::var("ISOLAUNCH_INSTANCES_ROOT") {
            self.storage.instances_root = PathBuf::from(root);
        }
        if let Ok(shared) = std::env::var("ISOLAUNCH_SHARED_PATH") {
            if !shared.is_empty() {
                self.storage.shared_path = Some(PathBuf::from(shared));
            }
        }
        if let Ok(root) = std::env::var("ISOLAUNCH_BACKUP_ROOT") {
            self.storage.backup_root = PathBuf::from(root);
        }
        if let Ok(method) = std::env::var("ISOLAUNCH_REDIRECT_METHOD") {
            self.storage.redirect_method = method;
        }

        if let Ok(attempts) = std::env::var("ISOLAUNCH_MAX_ATTEMPTS") {
            if let Ok(attempts) = attempts.parse::<usize>() {
                if (1..=10).contains(&attempts) {
                    self.retry.max_attempts = attempts;
                }
            }
        }
        if let Ok(hours) = std::env::var("ISOLAUNCH_CLEANUP_MAX_AGE_HOURS") {
            if let Ok(hours) = hours.parse::<u64>() {
                self.cleanup.max_age_hours = hours;
            }
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        self.redirect_method()?;

        let content_dir = self.storage.content_dir.trim();
        if content_dir.is_empty() {
            anyhow::bail!("storage.content_dir must not be empty");
        }
        if self.storage.aux_dirs.iter().any(|d| d == content_dir) {
            anyhow::bail!(
                "storage.content_dir '{}' must not also be an aux directory",
                content_dir
            );
        }

        if !(1..=10).contains(&self.retry.max_attempts) {
            anyhow::bail!("retry.max_attempts must be between 1 and 10");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            anyhow::bail!("retry.jitter must be between 0.0 and 1.0");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            anyhow::bail!("retry.base_delay_ms must be <= retry.max_delay_ms");
        }

        let orch = &self.orchestrator;
        if orch.poll_interval_secs == 0 {
            anyhow::bail!("orchestrator.poll_interval_secs must be > 0");
        }
        if orch.fallback_after_secs >= orch.verify_timeout_secs {
            anyhow::bail!(
                "orchestrator.fallback_after_secs ({}) must be less than verify_timeout_secs ({})",
                orch.fallback_after_secs,
                orch.verify_timeout_secs
            );
        }
        if orch.inter_identity_delay_secs > 30 {
            anyhow::bail!("orchestrator.inter_identity_delay_secs must be <= 30");
        }

        if self.launch.launch_timeout_secs == 0 {
            anyhow::bail!("launch.launch_timeout_secs must be > 0");
        }

        Ok(())
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }

    pub fn redirect_method(&self) -> Result<RedirectMethod> {
        self.storage.redirect_method.parse()
    }

    pub fn cleanup_max_age(&self) -> Duration {
        Duration::from_secs(self.cleanup.max_age_hours.saturating_mul(3600))
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new()
            .max_attempts(self.retry.max_attempts)
            .base_delay(Duration::from_millis(self.retry.base_delay_ms))
            .max_delay(Duration::from_millis(self.retry.max_delay_ms))
            .jitter(self.retry.jitter)
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        let orch = &self.orchestrator;
        OrchestratorSettings {
            verify: VerifyPolicy {
                timeout: Duration::from_secs(orch.verify_timeout_secs),
                poll_interval: Duration::from_secs(orch.poll_interval_secs),
                fallback_after: Duration::from_secs(orch.fallback_after_secs),
            },
            retry: self.retry_config(),
            launch_timeout: Duration::from_secs(self.launch.launch_timeout_secs),
            claim_delay: Duration::from_secs(orch.claim_delay_secs),
            inter_identity_delay: Duration::from_secs(orch.inter_identity_delay_secs),
            inter_identity_jitter: Duration::from_secs(orch.inter_identity_jitter_secs),
            max_running_processes: self.launch.max_running_processes,
            admission_timeout: Duration::from_secs(orch.admission_timeout_secs),
        }
    }

    pub fn shared_path(&self) -> Result<&Path> {
        self.storage
            .shared_path
            .as_deref()
            .context("storage.shared_path is not configured (set it or ISOLAUNCH_SHARED_PATH)")
    }

    /// Build the isolation manager described by `[storage]`
    pub fn isolation_manager(&self) -> Result<IsolationManager> {
        let shared_path = self.shared_path()?;
        let layout = AreaLayout::new(
            &self.storage.instances_root,
            self.storage.content_dir.trim(),
            self.storage.aux_dirs.clone(),
        );
        let backend = Redirector::from_method(self.redirect_method()?);
        tracing::debug!("Using {:?} redirects", backend);

        Ok(IsolationManager::new(
            layout,
            shared_path,
            BackupStore::new(&self.storage.backup_root),
            Arc::new(backend),
        ))
    }

    /// Build the command launcher described by `[launch]`
    pub fn command_launcher(&self) -> CommandLauncher {
        CommandLauncher::new(
            CommandSpec::non_empty(&self.launch.program, &self.launch.args),
            CommandSpec::non_empty(&self.launch.fallback_program, &self.launch.fallback_args),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    // Environment variables are process-wide
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ENV_VARS: &[&str] = &[
        "ISOLAUNCH_LOG_LEVEL",
        "ISOLAUNCH_LOG_FORMAT",
        "ISOLAUNCH_INSTANCES_ROOT",
        "ISOLAUNCH_SHARED_PATH",
        "ISOLAUNCH_BACKUP_ROOT",
        "ISOLAUNCH_REDIRECT_METHOD",
        "ISOLAUNCH_MAX_ATTEMPTS",
        "ISOLAUNCH_CLEANUP_MAX_AGE_HOURS",
    ];

    fn clear_env() {
        for var in ENV_VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.storage.content_dir, "storage");
        assert_eq!(config.storage.aux_dirs, vec!["logs", "cache", "content", "versions"]);
        assert!(config.storage.shared_path.is_none());
        assert_eq!(config.launch.max_running_processes, 10);
        assert_eq!(config.orchestrator.verify_timeout_secs, 25);
        assert_eq!(config.orchestrator.poll_interval_secs, 2);
        assert_eq!(config.orchestrator.fallback_after_secs, 15);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.cleanup.max_age_hours, 168);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_invalid_log_format() {
        let mut config = Config::default();
        config.logging.format = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_redirect_method() {
        let mut config = Config::default();
        config.storage.redirect_method = "hardlink".to_string();
        assert!(config.validate().is_err());

        config.storage.redirect_method = "Junction".to_string();
        assert!(config.validate().is_ok());
        assert_eq!(config.redirect_method().unwrap(), RedirectMethod::Junction);
    }

    #[test]
    fn test_config_validation_content_dir() {
        let mut config = Config::default();
        config.storage.content_dir = " ".to_string();
        assert!(config.validate().is_err());

        config.storage.content_dir = "cache".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_retry_bounds() {
        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        config.retry.max_attempts = 11;
        assert!(config.validate().is_err());

        config.retry.max_attempts = 3;
        config.retry.base_delay_ms = 10_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_orchestrator_timing() {
        let mut config = Config::default();
        config.orchestrator.poll_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.orchestrator.fallback_after_secs = 25;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.orchestrator.inter_identity_delay_secs = 31;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_nonexistent_file() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        clear_env();

        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().with_extension("nonexistent");
        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_valid_toml_config() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        clear_env();

        let temp_file = NamedTempFile::new().unwrap();
        let toml_content = r#"
[logging]
level = "debug"
format = "json"

[storage]
instances_root = "/data/instances"
shared_path = "/data/app/LocalStorage"
redirect_method = "symlink"

[launch]
fallback_program = "app-launcher"
process_name = "App.exe"
max_running_processes = 4

[orchestrator]
claim_delay_secs = 3

[retry]
max_attempts = 5
"#;
        fs::write(temp_file.path(), toml_content).unwrap();

        let config = Config::load_from_path(temp_file.path()).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.storage.instances_root, PathBuf::from("/data/instances"));
        assert_eq!(
            config.shared_path().unwrap(),
            Path::new("/data/app/LocalStorage")
        );
        assert_eq!(config.launch.process_name, "App.exe");
        assert_eq!(config.retry.max_attempts, 5);

        let settings = config.orchestrator_settings();
        assert_eq!(settings.claim_delay, Duration::from_secs(3));
        assert_eq!(settings.max_running_processes, 4);
        assert_eq!(settings.verify.timeout, Duration::from_secs(25));
        assert_eq!(settings.retry.max_attempts, 5);
        // Defaults fill the rest
        assert_eq!(config.cleanup.max_age_hours, 168);
        assert_eq!(config.storage.content_dir, "storage");
    }

    #[test]
    fn test_load_invalid_toml_config() {
        let temp_file = NamedTempFile::new().unwrap();
        fs::write(temp_file.path(), "[logging\nlevel = \"debug\"\n").unwrap();
        assert!(Config::load_from_path(temp_file.path()).is_err());
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        clear_env();

        let temp_file = NamedTempFile::new().unwrap();
        fs::write(
            temp_file.path(),
            "[orchestrator]\nverify_timeout_secs = 10\nfallback_after_secs = 15\n",
        )
        .unwrap();
        assert!(Config::load_from_path(temp_file.path()).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        clear_env();

        std::env::set_var("ISOLAUNCH_LOG_LEVEL", "debug");
        std::env::set_var("ISOLAUNCH_SHARED_PATH", "/env/shared");
        std::env::set_var("ISOLAUNCH_BACKUP_ROOT", "/env/backups");
        std::env::set_var("ISOLAUNCH_REDIRECT_METHOD", "symlink");
        std::env::set_var("ISOLAUNCH_MAX_ATTEMPTS", "5");
        std::env::set_var("ISOLAUNCH_CLEANUP_MAX_AGE_HOURS", "48");

        let config = Config::default().apply_env_overrides();
        clear_env();

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.storage.shared_path, Some(PathBuf::from("/env/shared")));
        assert_eq!(config.storage.backup_root, PathBuf::from("/env/backups"));
        assert_eq!(config.storage.redirect_method, "symlink");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.cleanup_max_age(), Duration::from_secs(48 * 3600));
    }

    #[test]
    fn test_env_overrides_invalid_values() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        clear_env();

        std::env::set_var("ISOLAUNCH_MAX_ATTEMPTS", "25");
        std::env::set_var("ISOLAUNCH_CLEANUP_MAX_AGE_HOURS", "soon");

        let config = Config::default().apply_env_overrides();
        clear_env();

        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.cleanup.max_age_hours, 168);
    }

    #[test]
    fn test_isolation_manager_requires_shared_path() {
        let config = Config::default();
        assert!(config.isolation_manager().is_err());

        let mut config = Config::default();
        config.storage.shared_path = Some(PathBuf::from("/tmp/isolaunch-shared"));
        config.storage.redirect_method = "symlink".to_string();
        let manager = config.isolation_manager().unwrap();
        assert_eq!(manager.shared_path(), PathBuf::from("/tmp/isolaunch-shared"));
        assert_eq!(manager.backend().name(), "symlink");
    }

    #[test]
    fn test_config_path() {
        let path = Config::config_path();
        assert!(path.ends_with("config.toml"));
    }

    #[test]
    fn test_log_level_parsing() {
        let mut config = Config::default();
        config.logging.level = "debug".to_string();
        assert_eq!(config.log_level().unwrap(), tracing::Level::DEBUG);

        config.logging.level = "invalid".to_string();
        assert!(config.log_level().is_err());
    }
}
