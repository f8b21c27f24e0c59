//! Transport seam
//!
//! A transport knows how to list the ports present on the machine and how to
//! open one of them as an async byte stream. The port state machine does the
//! rest: it splits the stream, runs a reader task and turns reads into
//! `receive_data` / `receive_error` events.

use std::io::ErrorKind;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::PortError;

/// Byte stream returned by [`Transport::open`]
///
/// Implemented for anything async-readable and writable, which covers
/// `tokio_serial::SerialStream` and `tokio::io::DuplexStream`.
pub trait SerialIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> SerialIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Boxed stream owned by one connection at a time
pub type BoxedIo = Box<dyn SerialIo>;

/// Information about an enumerated port
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDescriptor {
    /// Port path (e.g., /dev/ttyUSB0, COM3)
    pub path: String,
    /// USB manufacturer string
    pub manufacturer: Option<String>,
    /// USB serial number
    pub serial_number: Option<String>,
    /// Plug-and-play identifier (Windows)
    pub pnp_id: Option<String>,
    /// Physical location identifier
    pub location_id: Option<String>,
    /// USB Vendor ID
    pub vendor_id: Option<u16>,
    /// USB Product ID
    pub product_id: Option<u16>,
    /// USB product string
    pub product: Option<String>,
}

impl PortDescriptor {
    /// Descriptor with only a path
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}

/// Lists and opens ports
pub trait Transport: Send + Sync + 'static {
    /// Enumerate the ports currently present
    fn list_ports(&self) -> Result<Vec<PortDescriptor>, PortError>;

    /// Open `path` at `baud_rate`
    ///
    /// Called from the blocking pool, so it may block while the driver
    /// configures the line.
    fn open(&self, path: &str, baud_rate: u32) -> Result<BoxedIo, PortError>;
}

/// An asynchronous error reported by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFault {
    /// Error text
    pub message: String,
    /// Whether the transport still reports the port as open
    pub still_open: bool,
}

impl TransportFault {
    /// Error that left the port open
    pub fn open(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            still_open: true,
        }
    }

    /// Error that closed the port
    pub fn closed(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            still_open: false,
        }
    }

    /// Classify an I/O error from the reader task
    ///
    /// Returns `None` for errors that just mean "no data yet".
    pub fn from_io(err: &std::io::Error) -> Option<Self> {
        match err.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted => None,
            ErrorKind::BrokenPipe
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof => Some(Self::closed(err.to_string())),
            _ => Some(Self::open(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_classification() {
        let would_block = std::io::Error::new(ErrorKind::WouldBlock, "again");
        assert_eq!(TransportFault::from_io(&would_block), None);

        let reset = std::io::Error::new(ErrorKind::BrokenPipe, "unplugged");
        assert!(!TransportFault::from_io(&reset).unwrap().still_open);

        let framing = std::io::Error::new(ErrorKind::InvalidData, "framing error");
        assert!(TransportFault::from_io(&framing).unwrap().still_open);
    }
}
