//! Port configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How callers waiting on a busy port are ordered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockOrdering {
    /// Callers queue in arrival order and each operation runs as a unit
    #[default]
    Fifo,
    /// Each macro re-acquires the port; waiters race when it frees up
    Polled,
}

impl LockOrdering {
    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Fifo => "FIFO",
            Self::Polled => "Polled",
        }
    }
}

/// Bounds on waiting for a port to become available
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockPolicy {
    /// Ordering guarantee between concurrent callers
    pub ordering: LockOrdering,
    /// Longest single wait between state checks
    pub poll_interval_ms: u64,
    /// Checks allowed while the port is connecting
    pub connect_attempts: u32,
    /// Checks allowed while the port is busy
    pub lock_attempts: u32,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            ordering: LockOrdering::Fifo,
            poll_interval_ms: 100,
            connect_attempts: 50,
            lock_attempts: 100,
        }
    }
}

impl LockPolicy {
    /// Interval between state checks
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Total time a caller may wait for a busy port
    pub fn lock_budget(&self) -> Duration {
        self.poll_interval() * self.lock_attempts
    }
}

/// Per-port settings applied when a connection is created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    /// Response deadline for each macro, in milliseconds
    pub read_timeout_ms: u64,
    /// Appended to every command written
    pub line_terminator: String,
    /// Waiting policy for concurrent callers
    pub lock: LockPolicy,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 5000,
            line_terminator: "\n".to_string(),
            lock: LockPolicy::default(),
        }
    }
}

impl PortConfig {
    /// Read timeout as a duration
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_config_defaults() {
        let config = PortConfig::default();
        assert_eq!(config.read_timeout(), Duration::from_millis(5000));
        assert_eq!(config.line_terminator, "\n");
        assert_eq!(config.lock.ordering, LockOrdering::Fifo);
        assert_eq!(config.lock.lock_budget(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: PortConfig =
            serde_json::from_str(r#"{ "read_timeout_ms": 250, "lock": { "ordering": "polled" } }"#)
                .unwrap();
        assert_eq!(config.read_timeout_ms, 250);
        assert_eq!(config.line_terminator, "\n");
        assert_eq!(config.lock.ordering, LockOrdering::Polled);
        assert_eq!(config.lock.lock_attempts, 100);
    }
}
