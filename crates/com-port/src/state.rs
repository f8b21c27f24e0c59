//! Port state tracking

use serde::{Deserialize, Serialize};

use crate::transport::PortDescriptor;

/// Lifecycle state of a port connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    /// No transport handle open
    #[default]
    Closed,
    /// Open requested, waiting for the transport
    Connecting,
    /// Open and idle; incoming data goes to the background log
    Background,
    /// A command is in flight; incoming data is matched against its pattern
    Busy,
}

impl PortState {
    /// Whether a transport handle is live
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Background | Self::Busy)
    }

    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Connecting => "connecting",
            Self::Background => "background",
            Self::Busy => "busy",
        }
    }
}

/// Point-in-time view of a port for display and diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSnapshot {
    /// Serial port path
    pub path: String,
    /// Display name used for routing
    pub name: Option<String>,
    /// Current state
    pub state: PortState,
    /// Assigned profile name
    pub profile: Option<String>,
    /// Last transport or open error
    pub last_error: Option<String>,
    /// Entries in the background log
    pub log_len: usize,
    /// Device metadata reported by enumeration
    pub info: PortDescriptor,
}

impl PortSnapshot {
    /// Format state for display
    pub fn state_display(&self) -> String {
        match &self.profile {
            Some(profile) => format!("{} ({})", self.state.name(), profile),
            None => self.state.name().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_open() {
        assert!(!PortState::Closed.is_open());
        assert!(!PortState::Connecting.is_open());
        assert!(PortState::Background.is_open());
        assert!(PortState::Busy.is_open());
    }

    #[test]
    fn test_state_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&PortState::Background).unwrap(), "\"background\"");
    }
}
