//! Error types for port connections

use thiserror::Error;

/// Errors that can occur while driving a port
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PortError {
    /// Neither an explicit baud rate nor a profile was available
    #[error("cannot connect {0}: no baud rate given and no profile assigned")]
    NoBaudRate(String),

    /// An operation name was used on a port without a profile
    #[error("port {0} has no profile assigned")]
    NoProfile(String),

    /// Nothing to execute
    #[error("port {0}: empty macro list")]
    EmptyMacroList(String),

    /// Profile lookup or validation failure
    #[error(transparent)]
    Protocol(#[from] com_protocol::ProtocolError),

    /// Failed to enumerate ports
    #[error("failed to enumerate ports: {0}")]
    Enumeration(String),

    /// Transport refused to open
    #[error("failed to open port {path}: {reason}")]
    Open { path: String, reason: String },

    /// No matching response within the read timeout
    #[error("timeout after {timeout_ms}ms waiting for response on {path}")]
    Timeout { path: String, timeout_ms: u64 },

    /// Port stayed in the connecting state for too long
    #[error("port {path} still connecting after {attempts} attempts")]
    ConnectTimeout { path: String, attempts: u32 },

    /// Port stayed busy for too long
    #[error("port {path} still busy after {attempts} attempts")]
    LockTimeout { path: String, attempts: u32 },

    /// Write failed
    #[error("write to {path} failed: {reason}")]
    Write { path: String, reason: String },

    /// Asynchronous transport error, or the port closed under a pending read
    #[error("transport error on {path}: {message}")]
    Transport { path: String, message: String },

    /// Shutdown of the transport reported an error
    #[error("failed to close port {path}: {reason}")]
    Close { path: String, reason: String },
}

impl PortError {
    /// Whether this is a response timeout (as opposed to a lock/connect wait)
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether this error comes from bad arguments or missing configuration
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::NoBaudRate(_) | Self::NoProfile(_) | Self::EmptyMacroList(_) | Self::Protocol(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_names_port_and_duration() {
        let err = PortError::Timeout {
            path: "/dev/ttyUSB3".into(),
            timeout_ms: 5000,
        };
        let msg = err.to_string();
        assert!(msg.contains("/dev/ttyUSB3"));
        assert!(msg.contains("5000ms"));
        assert!(err.is_timeout());
        assert!(!err.is_configuration());
    }
}
