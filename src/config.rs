//! Configuration loading and types for s3stream.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! system: which storage service receives uploads, how uploads are split
//! and retried, and logging.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::errors::UploadError;
use crate::retry::{Backoff, RetryPolicy, DEFAULT_MAX_ATTEMPTS};
use crate::upload::{MAX_PART_SIZE, MIN_PART_SIZE};

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Storage service settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Part sizing and retry settings.
    #[serde(default)]
    pub upload: UploadConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Client type: `aws` or `memory`.
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Bucket used when none is given on the command line.
    #[serde(default)]
    pub bucket: Option<String>,

    /// AWS S3 configuration.
    #[serde(default)]
    pub aws: Option<AwsStorageConfig>,

    /// Memory service configuration.
    #[serde(default)]
    pub memory: MemoryStorageConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            bucket: None,
            aws: None,
            memory: MemoryStorageConfig::default(),
        }
    }
}

/// AWS S3 configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AwsStorageConfig {
    /// AWS region.
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom S3-compatible endpoint (e.g. MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: String,
    /// Force path-style URL addressing.
    #[serde(default)]
    pub use_path_style: bool,
    /// Explicit AWS access key (falls back to env/credential chain).
    #[serde(default)]
    pub access_key_id: String,
    /// Explicit AWS secret key (falls back to env/credential chain).
    #[serde(default)]
    pub secret_access_key: String,
}

impl Default for AwsStorageConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: String::new(),
            use_path_style: false,
            access_key_id: String::new(),
            secret_access_key: String::new(),
        }
    }
}

/// Memory service configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MemoryStorageConfig {
    /// Maximum total size in bytes (0 = unlimited).
    #[serde(default)]
    pub max_size_bytes: u64,
}

/// How a stream is split into parts and how transient errors are retried.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Buffer size that triggers a part flush, in bytes.
    #[serde(default = "default_part_size")]
    pub part_size: usize,

    /// Confirm a new session with a list-parts call before sending anything.
    #[serde(default)]
    pub probe_visibility: bool,

    /// Transient-error retry settings.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            part_size: default_part_size(),
            probe_visibility: false,
            retry: RetryConfig::default(),
        }
    }
}

impl UploadConfig {
    /// Reject settings the storage service would refuse.
    pub fn validate(&self) -> Result<(), UploadError> {
        if self.part_size < MIN_PART_SIZE {
            return Err(UploadError::InvalidConfig(format!(
                "part_size {} is below the minimum of {MIN_PART_SIZE} bytes",
                self.part_size
            )));
        }
        if self.part_size as u64 > MAX_PART_SIZE {
            return Err(UploadError::InvalidConfig(format!(
                "part_size {} exceeds the maximum of {MAX_PART_SIZE} bytes",
                self.part_size
            )));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(UploadError::InvalidConfig(format!(
                "retry.max_delay_ms {} is below retry.base_delay_ms {}",
                self.retry.max_delay_ms, self.retry.base_delay_ms
            )));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.policy()
    }
}

/// Retry settings for the session-not-yet-visible error.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Attempts per call including the first (0 = unbounded).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff curve: none, linear, exponential.
    #[serde(default = "default_backoff")]
    pub backoff: Backoff,

    /// First retry delay in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Delay cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: default_backoff(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: (self.max_attempts > 0).then_some(self.max_attempts),
            backoff: self.backoff,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_storage_backend() -> String {
    "aws".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_part_size() -> usize {
    MIN_PART_SIZE
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_backoff() -> Backoff {
    Backoff::Exponential
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    config.upload.validate()?;
    Ok(config)
}

// -- Tests -------------------------------------------------------------------
