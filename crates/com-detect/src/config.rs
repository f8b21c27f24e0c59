//! Fleet configuration

use std::path::Path;
use std::time::Duration;

use com_port::PortConfig;
use serde::{Deserialize, Serialize};

use crate::error::DetectError;

/// Port name fragments skipped during enumeration
pub fn default_skip_patterns() -> Vec<String> {
    vec![
        // Bluetooth ports on macOS
        "Bluetooth".to_string(),
        // Debug/logging ports
        "debug".to_string(),
    ]
}

/// Discovery and rescan settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Delay between scans in milliseconds; negative disables rescanning
    pub rescan_interval_ms: i64,
    /// Delay before retrying a failed `init`
    pub init_retry_delay_ms: u64,
    /// Ports whose path contains any of these are ignored
    pub skip_patterns: Vec<String>,
    /// Settings applied to every new connection
    pub port: PortConfig,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            rescan_interval_ms: 10_000,
            init_retry_delay_ms: 5_000,
            skip_patterns: default_skip_patterns(),
            port: PortConfig::default(),
        }
    }
}

impl FleetConfig {
    /// Rescan interval, or `None` when rescanning is disabled
    pub fn rescan_interval(&self) -> Option<Duration> {
        u64::try_from(self.rescan_interval_ms)
            .ok()
            .map(Duration::from_millis)
    }

    /// Delay before retrying a failed `init`
    pub fn init_retry_delay(&self) -> Duration {
        Duration::from_millis(self.init_retry_delay_ms)
    }

    /// Parse from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, DetectError> {
        serde_json::from_str(json).map_err(|e| DetectError::Config {
            path: "<inline>".to_string(),
            reason: e.to_string(),
        })
    }

    /// Read a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DetectError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| DetectError::Config {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|e| DetectError::Config {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }
}
