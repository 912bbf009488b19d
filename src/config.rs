//! Tool configuration
//!
//! A JSON file; every field is optional. Missing fields take the defaults
//! below, unknown fields are rejected.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointConfig;
use crate::crypto::{
    CipherSpec, DEFAULT_KDF_ITERATIONS, DEFAULT_KDF_MEMORY_KIB, DEFAULT_PAGE_SIZE,
};
use crate::observability::{log_event_with_fields, Event, Logger, Severity};
use crate::repair::DEFAULT_COMMIT_BATCH_ROWS;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Page cipher parameters used when a key is supplied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CipherConfig {
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Argon2 memory cost in KiB
    #[serde(default = "default_kdf_memory_kib")]
    pub kdf_memory_kib: u32,

    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}
fn default_kdf_memory_kib() -> u32 {
    DEFAULT_KDF_MEMORY_KIB
}
fn default_kdf_iterations() -> u32 {
    DEFAULT_KDF_ITERATIONS
}

impl Default for CipherConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            kdf_memory_kib: default_kdf_memory_kib(),
            kdf_iterations: default_kdf_iterations(),
        }
    }
}

impl CipherConfig {
    /// Cipher for `key` with these parameters.
    pub fn spec(&self, key: impl Into<Vec<u8>>) -> CipherSpec {
        CipherSpec::new(key)
            .with_page_size(self.page_size)
            .with_kdf(self.kdf_memory_kib, self.kdf_iterations)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub cipher: CipherConfig,

    /// Rows per destination transaction during repair
    #[serde(default = "default_commit_batch_rows")]
    pub commit_batch_rows: usize,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Minimum severity written to stdout
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_commit_batch_rows() -> usize {
    DEFAULT_COMMIT_BATCH_ROWS
}
fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cipher: CipherConfig::default(),
            commit_batch_rows: default_commit_batch_rows(),
            checkpoint: CheckpointConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;

        log_event_with_fields(
            Event::ConfigLoaded,
            &[("path", &path.display().to_string())],
        );
        Ok(config)
    }

    /// `path` if given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> ConfigResult<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let page_size = self.cipher.page_size;
        if !(512..=65536).contains(&page_size) || !page_size.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "cipher.page_size must be a power of two in 512..=65536, got {}",
                page_size
            )));
        }
        if self.cipher.kdf_memory_kib < 8 {
            return Err(ConfigError::Invalid("cipher.kdf_memory_kib must be >= 8".into()));
        }
        if self.cipher.kdf_iterations == 0 {
            return Err(ConfigError::Invalid("cipher.kdf_iterations must be > 0".into()));
        }
        if self.commit_batch_rows == 0 {
            return Err(ConfigError::Invalid("commit_batch_rows must be > 0".into()));
        }
        self.checkpoint
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        self.severity()?;
        Ok(())
    }

    pub fn severity(&self) -> ConfigResult<Severity> {
        self.log_level
            .parse::<Severity>()
            .map_err(ConfigError::Invalid)
    }

    /// Install the configured log level process-wide.
    pub fn apply_logging(&self) -> ConfigResult<()> {
        Logger::set_min_severity(self.severity()?);
        Ok(())
    }
}
