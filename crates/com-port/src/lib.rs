//! Serial Port Connection Library
//!
//! This crate drives one serial port as a command/response channel:
//!
//! - **ComPort**: connection state machine (closed, connecting, background,
//!   busy) with a port lock that serializes concurrent callers
//! - **BackgroundLog**: bounded line log of data that arrives while idle
//! - **Transport**: seam between the state machine and the serial driver,
//!   implemented by [`SerialTransport`] for real hardware and by
//!   [`sim::SimTransport`] for scripted devices
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use com_port::{ComPort, SerialTransport};
//! use com_protocol::{DeviceProfile, Macro};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let profile = DeviceProfile::builder("meter", 115200, vec![Macro::new("*IDN?", "METER")?])
//!     .operation("read", vec![Macro::new("MEAS?", r"^[-0-9.]+$")?])
//!     .build()?;
//!
//! let port = ComPort::new("/dev/ttyUSB0", Arc::new(SerialTransport::new()));
//! if port.classify(&profile).await? {
//!     port.set_profile(Some(Arc::new(profile)));
//!     let values = port.send("read", None).await?;
//!     println!("{:?}", values);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod log;
pub mod port;
pub mod serial;
pub mod sim;
pub mod state;
pub mod transport;

pub use config::{LockOrdering, LockPolicy, PortConfig};
pub use error::PortError;
pub use log::{BackgroundLog, LOG_CAPACITY, LOG_EVICTION};
pub use port::ComPort;
pub use serial::SerialTransport;
pub use state::{PortSnapshot, PortState};
pub use transport::{BoxedIo, PortDescriptor, SerialIo, Transport, TransportFault};
