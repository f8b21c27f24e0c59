//! Error types for fleet discovery and routing

use com_port::PortError;
use com_protocol::ProtocolError;
use thiserror::Error;

/// Errors that can occur while discovering or addressing devices
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DetectError {
    /// No profile registered under this name
    #[error("no profile named {0}")]
    ProfileNotFound(String),

    /// No connection of the profile carries this name
    #[error("no {profile} connection named {name}")]
    ConnectionNotFound { profile: String, name: String },

    /// Index past the end of the profile's connections
    #[error("no {profile} connection at index {index} ({count} connected)")]
    IndexOutOfRange {
        profile: String,
        index: usize,
        count: usize,
    },

    /// Port-level failure
    #[error(transparent)]
    Port(#[from] PortError),

    /// Profile validation failure
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A background scan task panicked or was cancelled
    #[error("scan task failed: {0}")]
    ScanTask(String),

    /// Configuration could not be read or parsed
    #[error("invalid configuration {path}: {reason}")]
    Config { path: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_error_reports_index_and_count() {
        let err = DetectError::IndexOutOfRange {
            profile: "mock".into(),
            index: 99,
            count: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("99"));
        assert!(msg.contains("2 connected"));
    }

    #[test]
    fn test_port_errors_convert() {
        let err: DetectError = PortError::NoProfile("/dev/ttyS0".into()).into();
        assert!(matches!(err, DetectError::Port(PortError::NoProfile(_))));
    }
}
