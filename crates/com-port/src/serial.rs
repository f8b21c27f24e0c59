//! Native serial transport
//!
//! Enumerates ports through the `serialport` crate and opens them as async
//! streams through `tokio_serial`.

use std::time::Duration;

use serialport::{available_ports, SerialPortType};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info};

use crate::error::PortError;
use crate::transport::{BoxedIo, PortDescriptor, Transport};

impl PortDescriptor {
    /// Create from serialport crate's port info
    fn from_serialport(name: String, port_type: &SerialPortType) -> Self {
        match port_type {
            SerialPortType::UsbPort(usb) => Self {
                path: name,
                manufacturer: usb.manufacturer.clone(),
                serial_number: usb.serial_number.clone(),
                vendor_id: Some(usb.vid),
                product_id: Some(usb.pid),
                product: usb.product.clone(),
                ..Default::default()
            },
            _ => Self::new(name),
        }
    }
}

/// Transport backed by the operating system's serial ports
#[derive(Debug, Clone)]
pub struct SerialTransport {
    /// Driver-level read timeout; reads time out quietly and are retried
    read_timeout: Duration,
}

impl SerialTransport {
    /// Create a transport with the default driver timeout
    pub fn new() -> Self {
        Self {
            read_timeout: Duration::from_millis(100),
        }
    }
}

impl Default for SerialTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SerialTransport {
    fn list_ports(&self) -> Result<Vec<PortDescriptor>, PortError> {
        let ports = available_ports().map_err(|e| PortError::Enumeration(e.to_string()))?;

        let result: Vec<_> = ports
            .into_iter()
            .map(|p| PortDescriptor::from_serialport(p.port_name, &p.port_type))
            .collect();

        debug!("Serial driver reports {} port(s)", result.len());
        Ok(result)
    }

    fn open(&self, path: &str, baud_rate: u32) -> Result<BoxedIo, PortError> {
        let stream = tokio_serial::new(path, baud_rate)
            .timeout(self.read_timeout)
            .open_native_async()
            .map_err(|e| PortError::Open {
                path: path.to_string(),
                reason: e.to_string(),
            })?;

        info!("Opened {} at {} baud", path, baud_rate);
        Ok(Box::new(stream))
    }
}
