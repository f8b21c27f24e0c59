//! Serial Device Fleet Library
//!
//! This crate discovers text-protocol devices on the serial ports of the
//! machine, identifies each one against a set of device profiles, keeps
//! them under periodic liveness checks and routes operations to them by
//! profile name plus index or display name.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use com_detect::{FleetConfig, FleetManager};
//! use com_port::SerialTransport;
//! use com_protocol::{DeviceProfile, Macro};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let profile = DeviceProfile::builder("mock", 9600, vec![Macro::new("ID?", "^INITTED$")?])
//!     .operation("status", vec![Macro::new("STATUS?", "^READY")?])
//!     .build()?;
//!
//! let fleet = FleetManager::with_config(Arc::new(SerialTransport::new()), FleetConfig::default());
//! fleet.init(vec![profile]).await?;
//!
//! let status = fleet.send("mock", 0, "status", None).await?;
//! println!("{:?}", status);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod manager;
pub mod scanner;

pub use config::{default_skip_patterns, FleetConfig};
pub use error::DetectError;
pub use manager::{FleetManager, Selector};
pub use scanner::PortScanner;
