//! Supervisor configuration
//!
//! Loaded once at startup from a TOML file and never reloaded. Every
//! component receives the part it needs by value or through an `Arc`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::registry::RetryPolicy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub protocol_node: ProtocolNodeConfig,
}

/// What the supervisor does when the child exits on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CleanExitPolicy {
    /// Fetch the pool state again and relaunch (default)
    #[default]
    Restart,
    /// Stop supervising and exit the process
    Stop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSection {
    /// Host target key used to select a download link, e.g. "linux-x64"
    #[serde(default = "default_host_target")]
    pub host_target: String,

    /// Download binaries that are not installed yet
    #[serde(default = "default_true")]
    pub auto_download: bool,

    /// Verify the content hash of freshly downloaded binaries
    #[serde(default = "default_true")]
    pub verify_checksums: bool,

    /// Root directory of installed binaries
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,

    /// Directory holding the mnemonic and keyfile
    #[serde(default = "default_secrets_dir")]
    pub secrets_dir: PathBuf,

    /// Registry REST endpoint; derived from the network when unset
    #[serde(default)]
    pub registry_endpoint: Option<String>,

    #[serde(default)]
    pub clean_exit: CleanExitPolicy,

    /// Extra attempts for download/extract failures before giving up
    #[serde(default = "default_artifact_retries")]
    pub artifact_retries: u32,

    #[serde(default = "default_artifact_retry_delay")]
    pub artifact_retry_delay_secs: u64,

    /// Pause before relaunching a validator that exited on its own; grows
    /// with each consecutive quick exit, capped by `retry.max_delay_secs`
    #[serde(default = "default_restart_delay")]
    pub restart_delay_ms: u64,

    /// A run at least this long resets the restart pause
    #[serde(default = "default_healthy_run")]
    pub healthy_run_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Backoff grows by this many seconds per failed attempt
    #[serde(default = "default_retry_step")]
    pub step_secs: u64,

    /// Upper bound on a single backoff sleep
    #[serde(default = "default_retry_max_delay")]
    pub max_delay_secs: u64,

    /// Unset means retry forever
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Stderr substring the validator prints when its version is stale
    #[serde(default = "default_restart_sentinel")]
    pub restart_sentinel: String,

    /// How long to wait for stdio forwarding to drain once the child is gone
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

/// Settings forwarded to the validator binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolNodeConfig {
    /// Pool to validate for
    #[serde(default)]
    pub pool_id: String,

    /// Chain id of the network
    #[serde(default = "default_network")]
    pub network: String,

    /// Stake to bond when not yet a validator
    #[serde(default)]
    pub initial_stake: Option<u64>,

    /// Disk space quota in bytes
    #[serde(default)]
    pub space: Option<u64>,

    #[serde(default)]
    pub batch_size: Option<u32>,

    #[serde(default)]
    pub verbose: bool,

    /// Run the validator's metrics server
    #[serde(default)]
    pub metrics: bool,

    /// Appended verbatim after the generated flags
    #[serde(default)]
    pub extra_args: Vec<String>,
}

// Defaults
fn default_true() -> bool { true }
fn default_artifact_dir() -> PathBuf { PathBuf::from("./kysor") }
fn default_secrets_dir() -> PathBuf { PathBuf::from("./secrets") }
fn default_artifact_retries() -> u32 { 3 }
fn default_artifact_retry_delay() -> u64 { 10 }
fn default_restart_delay() -> u64 { 10_000 }
fn default_healthy_run() -> u64 { 60 }
fn default_retry_step() -> u64 { 10 }
fn default_retry_max_delay() -> u64 { 300 } // 5 minutes
fn default_restart_sentinel() -> String { "Running an invalid version.".to_string() }
fn default_shutdown_grace() -> u64 { 5 }
fn default_network() -> String { "korellia".to_string() }

fn default_host_target() -> String {
    detect_host_target().unwrap_or_default()
}

/// Host target key for the machine we are running on
pub fn detect_host_target() -> Option<String> {
    let os = match std::env::consts::OS {
        "linux" => "linux",
        "macos" => "macos",
        _ => return None,
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => "x64",
        "aarch64" => "arm64",
        _ => return None,
    };
    Some(format!("{}-{}", os, arch))
}

/// Public REST endpoint for a known network
pub fn rest_endpoint_for(network: &str) -> Option<&'static str> {
    match network {
        "korellia" => Some("https://api.korellia.kyve.network"),
        "beta" => Some("https://api.beta.kyve.network"),
        "kyve-1" | "mainnet" => Some("https://api.kyve.network"),
        _ => None,
    }
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            host_target: default_host_target(),
            auto_download: true,
            verify_checksums: true,
            artifact_dir: default_artifact_dir(),
            secrets_dir: default_secrets_dir(),
            registry_endpoint: None,
            clean_exit: CleanExitPolicy::Restart,
            artifact_retries: default_artifact_retries(),
            artifact_retry_delay_secs: default_artifact_retry_delay(),
            restart_delay_ms: default_restart_delay(),
            healthy_run_secs: default_healthy_run(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            step_secs: default_retry_step(),
            max_delay_secs: default_retry_max_delay(),
            max_attempts: None,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            restart_sentinel: default_restart_sentinel(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl Default for ProtocolNodeConfig {
    fn default() -> Self {
        Self {
            pool_id: String::new(),
            network: default_network(),
            initial_stake: None,
            space: None,
            batch_size: None,
            verbose: false,
            metrics: false,
            extra_args: Vec::new(),
        }
    }
}

impl SupervisorConfig {
    /// Load from a TOML file, falling back to defaults when it does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Check the settings the loop cannot run without
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol_node.pool_id.trim().is_empty() {
            return Err(ConfigError::Invalid("pool_id is not set".to_string()));
        }
        if self.supervisor.host_target.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "host_target is not set and could not be detected".to_string(),
            ));
        }
        if self.retry.step_secs == 0 {
            return Err(ConfigError::Invalid("retry.step_secs must be positive".to_string()));
        }
        self.registry_endpoint()?;
        Ok(())
    }

    /// Explicit endpoint, or the public one for the configured network
    pub fn registry_endpoint(&self) -> Result<String, ConfigError> {
        if let Some(endpoint) = &self.supervisor.registry_endpoint {
            return Ok(endpoint.trim_end_matches('/').to_string());
        }
        rest_endpoint_for(&self.protocol_node.network)
            .map(str::to_string)
            .ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "no registry endpoint known for network {:?}, set supervisor.registry_endpoint",
                    self.protocol_node.network
                ))
            })
    }

    /// Pause schedule between relaunches after the validator exits
    pub fn restart_policy(&self) -> RetryPolicy {
        RetryPolicy {
            step: Duration::from_millis(self.supervisor.restart_delay_ms),
            max_delay: Duration::from_secs(self.retry.max_delay_secs),
            max_attempts: None,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            step: Duration::from_secs(self.retry.step_secs),
            max_delay: Duration::from_secs(self.retry.max_delay_secs),
            max_attempts: self.retry.max_attempts,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Read(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// A config the operator has to fix is a policy stop, not a crash
    pub fn exit_code(&self) -> i32 {
        0
    }
}
