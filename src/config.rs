//! Sandbox configuration.
//!
//! Every option has a safe default, so a missing `execbox.toml` yields a
//! locked-down sandbox: seccomp on, read-only root, no capabilities, no
//! network.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sandbox::{NetworkMode, SandboxError};

const CONFIG_FILE: &str = "execbox.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Per-language resource overrides, keyed by language id
    #[serde(default)]
    pub languages: HashMap<String, LanguageOverride>,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
}

/// Container engine connection and image settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine socket path. Uses the local defaults (`DOCKER_HOST` or
    /// `/var/run/docker.sock`) when unset.
    #[serde(default)]
    pub socket: Option<String>,

    /// Prefix for hardened per-language images (`<prefix>-<language>:latest`)
    #[serde(default = "default_image_prefix")]
    pub image_prefix: String,

    /// Build missing hardened images when the executor starts
    #[serde(default)]
    pub build_images: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            socket: None,
            image_prefix: default_image_prefix(),
            build_images: false,
        }
    }
}

/// Which executor backs the sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutorMode {
    /// Container executor when the engine is reachable, process executor otherwise
    #[default]
    Auto,
    /// Container executor only; startup fails without an engine
    Container,
    /// Process executor only (insecure fallback)
    Process,
}

impl std::str::FromStr for ExecutorMode {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "container" | "docker" => Ok(Self::Container),
            "process" => Ok(Self::Process),
            _ => Err(SandboxError::config(format!(
                "unknown executor mode '{s}'. Supported: auto, container, process"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default)]
    pub mode: ExecutorMode,

    /// Directory holding per-execution workspaces
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,

    /// Wait between a graceful stop and a forced kill
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// Delay before a finished execution's workspace is removed
    #[serde(default = "default_cleanup_delay_ms")]
    pub cleanup_delay_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            mode: ExecutorMode::Auto,
            workspace_root: None,
            grace_period_ms: default_grace_period_ms(),
            cleanup_delay_ms: default_cleanup_delay_ms(),
        }
    }
}

/// Global resource ceilings, used for languages without an override
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Memory limit (e.g., "256m")
    #[serde(default = "default_memory")]
    pub memory: String,

    /// CPU limit in cores
    #[serde(default = "default_cpus")]
    pub cpus: f64,

    /// Wall-clock timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Maximum number of processes/threads
    #[serde(default = "default_pids")]
    pub pids: i64,

    /// Size of the /tmp scratch space (e.g., "64m")
    #[serde(default = "default_scratch")]
    pub scratch: String,

    /// Cap on captured stdout and stderr, each
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            memory: default_memory(),
            cpus: default_cpus(),
            timeout_secs: default_timeout(),
            pids: default_pids(),
            scratch: default_scratch(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

/// Per-language override; unset fields keep the built-in profile value
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LanguageOverride {
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub cpus: Option<f64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub pids: Option<i64>,
    #[serde(default)]
    pub scratch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_true")]
    pub seccomp: bool,

    /// Apply the engine's default AppArmor profile (Linux hosts only)
    #[serde(default = "default_apparmor")]
    pub apparmor: bool,

    #[serde(default = "default_true")]
    pub read_only_root: bool,

    #[serde(default = "default_true")]
    pub drop_capabilities: bool,

    #[serde(default = "default_true")]
    pub no_new_privileges: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            seccomp: true,
            apparmor: default_apparmor(),
            read_only_root: true,
            drop_capabilities: true,
            no_new_privileges: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Network mode for executions; `none` unless explicitly opted in
    #[serde(default)]
    pub mode: NetworkMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Mount shared package caches into executions
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub base_dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Audit log path; defaults to `$TMPDIR/execbox-audit.log`, outside the
    /// workspace root so shutdown does not remove it
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Run the periodic orphan/workspace sweep
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,

    /// Age after which units and workspaces are reclaimed
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_cleanup_interval(),
            max_age_secs: default_max_age(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Hard ceiling on simultaneous executions; excess requests are rejected
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_apparmor() -> bool {
    cfg!(target_os = "linux")
}

fn default_image_prefix() -> String {
    "execbox-sandbox".to_string()
}

fn default_grace_period_ms() -> u64 {
    2000
}

fn default_cleanup_delay_ms() -> u64 {
    500
}

fn default_memory() -> String {
    "256m".to_string()
}

fn default_cpus() -> f64 {
    0.5
}

fn default_timeout() -> u64 {
    30
}

fn default_pids() -> i64 {
    100
}

fn default_scratch() -> String {
    "64m".to_string()
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_cleanup_interval() -> u64 {
    300
}

fn default_max_age() -> u64 {
    600
}

fn default_max_concurrent() -> u32 {
    50
}

impl Config {
    /// Load `execbox.toml` from a directory, using defaults if not found
    pub fn load(dir: &Path) -> Result<Self, SandboxError> {
        let config_path = dir.join(CONFIG_FILE);

        if !config_path.exists() {
            return Ok(Self::default());
        }

        Self::from_file(&config_path)
    }

    /// Load configuration from an explicit file path
    pub fn from_file(path: &Path) -> Result<Self, SandboxError> {
        let content = fs::read_to_string(path).map_err(|e| {
            SandboxError::config(format!("failed to read {}: {e}", path.display()))
        })?;

        toml::from_str(&content)
            .map_err(|e| SandboxError::config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Directory holding per-execution workspaces
    pub fn workspace_root(&self) -> PathBuf {
        self.executor
            .workspace_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("execbox-sandbox"))
    }

    /// Host directory for shared package caches
    pub fn cache_dir(&self) -> PathBuf {
        self.cache
            .base_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("execbox-pkg-cache"))
    }

    /// Audit log location
    pub fn audit_path(&self) -> PathBuf {
        self.audit
            .path
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("execbox-audit.log"))
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.executor.grace_period_ms)
    }

    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.executor.cleanup_delay_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup.interval_secs.max(1))
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.cleanup.max_age_secs)
    }
}

/// Parse memory limit string (e.g., "1g", "512m", "64k") to bytes
pub fn parse_memory_limit(limit: &str) -> Result<u64, SandboxError> {
    let limit = limit.trim().to_lowercase();
    let invalid = || SandboxError::config(format!("invalid memory limit '{limit}'"));

    let (num, unit) = if let Some(num) = limit.strip_suffix('g') {
        (num, 1024 * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('m') {
        (num, 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('k') {
        (num, 1024)
    } else {
        (limit.as_str(), 1)
    };

    let count: u64 = num.parse().map_err(|_| invalid())?;
    count
        .checked_mul(unit)
        .filter(|bytes| i64::try_from(*bytes).is_ok())
        .ok_or_else(|| SandboxError::config(format!("memory limit '{limit}' is too large")))
}
