//! Checkpoint scheduler configuration

use serde::{Deserialize, Serialize};

use super::errors::{CheckpointError, CheckpointResult};

fn default_low_watermark() -> u32 {
    100
}

fn default_high_watermark() -> u32 {
    300
}

fn default_workers() -> usize {
    1
}

/// WAL frame thresholds and pool size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Frames at which a passive checkpoint is queued
    #[serde(default = "default_low_watermark")]
    pub low_watermark: u32,

    /// Frames at which the queued checkpoint blocks writers
    #[serde(default = "default_high_watermark")]
    pub high_watermark: u32,

    /// Background worker threads
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            low_watermark: default_low_watermark(),
            high_watermark: default_high_watermark(),
            workers: default_workers(),
        }
    }
}

impl CheckpointConfig {
    pub fn validate(&self) -> CheckpointResult<()> {
        if self.low_watermark == 0 {
            return Err(CheckpointError::InvalidConfig(
                "low_watermark must be greater than 0".into(),
            ));
        }
        if self.high_watermark < self.low_watermark {
            return Err(CheckpointError::InvalidConfig(format!(
                "high_watermark ({}) must be >= low_watermark ({})",
                self.high_watermark, self.low_watermark
            )));
        }
        if self.workers == 0 {
            return Err(CheckpointError::InvalidConfig(
                "workers must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = CheckpointConfig::default();
        assert_eq!(config.low_watermark, 100);
        assert_eq!(config.high_watermark, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config: CheckpointConfig = serde_json::from_str(r#"{"workers": 2}"#).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.low_watermark, 100);
    }

    #[test]
    fn test_inverted_watermarks_rejected() {
        let config = CheckpointConfig {
            low_watermark: 50,
            high_watermark: 10,
            workers: 1,
        };
        assert!(matches!(
            config.validate(),
            Err(CheckpointError::InvalidConfig(_))
        ));
    }
}
