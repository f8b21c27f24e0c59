//! Serial port scanner
//!
//! This module provides port enumeration with name-based filtering.

use std::sync::Arc;

use com_port::{PortDescriptor, Transport};
use tracing::{debug, info};

use crate::config::default_skip_patterns;
use crate::error::DetectError;

/// Lists candidate ports through a transport
pub struct PortScanner {
    transport: Arc<dyn Transport>,
    skip_patterns: Vec<String>,
}

impl PortScanner {
    /// Create a scanner with the default skip patterns
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_skip_patterns(transport, default_skip_patterns())
    }

    /// Create a scanner that ignores ports whose path contains any pattern
    pub fn with_skip_patterns(transport: Arc<dyn Transport>, skip_patterns: Vec<String>) -> Self {
        Self {
            transport,
            skip_patterns,
        }
    }

    /// Enumerate all candidate ports
    pub fn enumerate_ports(&self) -> Result<Vec<PortDescriptor>, DetectError> {
        debug!("Enumerating serial ports...");
        let ports = self.transport.list_ports()?;

        let result: Vec<_> = ports
            .into_iter()
            .filter(|p| !self.should_skip_port(p))
            .collect();

        if result.is_empty() {
            info!("No serial ports found");
        } else {
            info!("Found {} serial port(s)", result.len());
            for port in &result {
                let desc = port.product.as_deref().unwrap_or("Unknown");
                debug!("  {} - {}", port.path, desc);
            }
        }

        Ok(result)
    }

    /// Check if a port should be skipped
    fn should_skip_port(&self, port: &PortDescriptor) -> bool {
        self.skip_patterns
            .iter()
            .any(|pattern| port.path.contains(pattern.as_str()))
    }
}
