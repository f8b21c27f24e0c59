//! Text Command Protocol Library
//!
//! This crate provides the data model for talking to line-oriented serial
//! devices:
//!
//! - **Macro**: a command template paired with the response pattern that
//!   signals its completion
//! - **DeviceProfile**: a named bundle of baud rate, startup delay and
//!   operation name → ordered macro list, with a mandatory `init` probe
//! - **Templating**: `{placeholder}` substitution with dotted/indexed paths
//!   resolved against a JSON parameter tree
//!
//! # Example
//!
//! ```rust
//! use com_protocol::{DeviceProfile, Macro};
//! use serde_json::json;
//!
//! let profile = DeviceProfile::builder("plotter", 9600, vec![Macro::new("ID?", "^PLT")?])
//!     .operation("goto", vec![Macro::new("GOTO {target.x} {target.y}", "^OK")?])
//!     .build()?;
//!
//! let goto = &profile.operation("goto")?[0];
//! let resolved = goto.with_params(&json!({ "target": { "x": 10, "y": 20 } }));
//! assert_eq!(resolved.command(), "GOTO 10 20");
//! # Ok::<(), com_protocol::ProtocolError>(())
//! ```

pub mod error;
pub mod macros;
pub mod profile;
pub mod template;

pub use error::ProtocolError;
pub use macros::Macro;
pub use profile::{DeviceProfile, DeviceProfileBuilder, INIT_OPERATION};
pub use template::{render, resolve_path};
