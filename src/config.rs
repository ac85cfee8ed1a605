//! Configuration file parsing
//!
//! Parses the TOML configuration consumed by the orchestrator. The values
//! here are produced and pre-validated by an external setup layer; this
//! module only checks internal consistency.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Storage orchestrator configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Remote appliance API settings
    pub api: ApiConfig,

    /// Export (target/subsystem) settings
    pub export: ExportConfig,

    /// Volume creation defaults
    #[serde(default)]
    pub volume: VolumeDefaults,
}

/// Remote API settings
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Appliance API endpoint (URL for rest, host:port for socket)
    pub endpoint: String,

    /// Bearer credential
    pub api_key: String,

    /// Wire transport
    #[serde(default)]
    pub transport: TransportKind,

    /// Retry bounds for transient failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Per-call timeout in seconds
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

fn default_call_timeout_secs() -> u64 {
    30
}

/// Wire transport selection
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Stateless HTTPS request/response
    #[default]
    Rest,
    /// Persistent framed-JSON connection
    Socket,
}

/// Retry bounds
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Maximum retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff delay in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff cap in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Export settings
#[derive(Debug, Clone, Deserialize)]
pub struct ExportConfig {
    /// Parent dataset path on the appliance (e.g. "tank/vmdata")
    pub dataset: String,

    /// Target IQN or NVMe subsystem NQN to bind exports to
    pub target: String,

    /// Primary portal address (host:port)
    pub portal: String,

    /// Additional portals for multipath
    #[serde(default)]
    pub extra_portals: Vec<String>,
}

impl ExportConfig {
    /// All configured portals, primary first.
    pub fn portals(&self) -> Vec<String> {
        let mut portals = vec![self.portal.clone()];
        portals.extend(self.extra_portals.iter().cloned());
        portals
    }
}

/// Volume creation defaults
#[derive(Debug, Clone, Deserialize)]
pub struct VolumeDefaults {
    /// Block granularity (e.g. "128K"); absent means no alignment
    #[serde(default)]
    pub blocksize: Option<String>,

    /// Create sparse (thin-provisioned) volumes
    #[serde(default)]
    pub sparse: bool,

    /// Ceiling for waiting on local device appearance, in milliseconds
    #[serde(default = "default_device_wait_ms")]
    pub device_wait_ms: u64,
}

fn default_device_wait_ms() -> u64 {
    8000
}

impl Default for VolumeDefaults {
    fn default() -> Self {
        Self {
            blocksize: None,
            sparse: false,
            device_wait_ms: default_device_wait_ms(),
        }
    }
}

impl StorageConfig {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: StorageConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        if self.api.endpoint.is_empty() {
            return Err(ConfigError::Invalid("api.endpoint is empty".to_string()));
        }
        if self.export.dataset.is_empty() {
            return Err(ConfigError::Invalid("export.dataset is empty".to_string()));
        }
        if self.export.target.is_empty() {
            return Err(ConfigError::Invalid("export.target is empty".to_string()));
        }

        // Check for duplicate portals
        let mut seen = std::collections::HashSet::new();
        for portal in self.export.portals() {
            if !seen.insert(portal.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate portal: {}",
                    portal
                )));
            }
        }

        if self.api.retry.base_delay_ms > self.api.retry.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "retry base delay {} ms exceeds cap {} ms",
                self.api.retry.base_delay_ms, self.api.retry.max_delay_ms
            )));
        }

        Ok(())
    }
}
