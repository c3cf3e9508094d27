//! Uplink configuration.
//!
//! A single JSON file, every field optional:
//!
//! ```json
//! {
//!   "max_retries": 3,
//!   "retry_delay_secs": 5,
//!   "state_dir": "/var/lib/uplink",
//!   "parallel_streams": 4
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uplink_protocol::TransferParameters;

use crate::starter::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY, RetryPolicy};

const APP_DIR: &str = "archive-uplink";

/// Errors loading the configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UplinkConfig {
    /// Session start attempts per submission attempt.
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    /// Where submission records live.
    pub state_dir: PathBuf,
    /// Stream count for the parameters of new jobs.
    pub parallel_streams: usize,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_secs: DEFAULT_RETRY_DELAY.as_secs(),
            state_dir: default_state_dir(),
            parallel_streams: 4,
        }
    }
}

impl UplinkConfig {
    /// Reads `path`, falling back to defaults if the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        if config.max_retries == 0 {
            warn!(path = %path.display(), "max_retries is 0, one attempt will still be made");
        }
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            retry_delay: Duration::from_secs(self.retry_delay_secs),
        }
    }

    /// Default job parameters with the configured stream count.
    pub fn transfer_parameters(&self) -> TransferParameters {
        TransferParameters {
            parallel_streams: self.parallel_streams.max(1),
            ..TransferParameters::default()
        }
    }
}

/// `<config dir>/archive-uplink/config.json`.
pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join(APP_DIR).join("config.json"))
}

fn default_state_dir() -> PathBuf {
    config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR)
        .join("submissions")
}

/// Returns the platform-specific config directory.
fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(".config"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = UplinkConfig::load(&tmp.path().join("absent.json")).unwrap();
        assert_eq!(config, UplinkConfig::default());
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert!(config.state_dir.ends_with("archive-uplink/submissions"));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{ "retry_delay_secs": 30 }"#).unwrap();

        let config = UplinkConfig::load(&path).unwrap();
        assert_eq!(config.retry_delay_secs, 30);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_policy().retry_delay, Duration::from_secs(30));
        assert_eq!(config.transfer_parameters().parallel_streams, 4);
    }

    #[test]
    fn save_then_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested/config.json");
        let config = UplinkConfig {
            max_retries: 5,
            state_dir: tmp.path().join("state"),
            ..UplinkConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(UplinkConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, "max_retries = 3").unwrap();
        assert!(matches!(UplinkConfig::load(&path), Err(ConfigError::Json(_))));
    }
}
