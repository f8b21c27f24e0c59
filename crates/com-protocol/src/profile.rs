//! Device profiles
//!
//! A profile describes one kind of device: the baud rate it talks at, how
//! long it needs after the port opens before it listens, and the named
//! operations it supports. Every profile carries an `init` operation, which
//! doubles as the identification probe during discovery and as the liveness
//! check on later scans.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::ProtocolError;
use crate::macros::Macro;

/// Name of the mandatory identification operation
pub const INIT_OPERATION: &str = "init";

/// Named device capability bundle
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    name: String,
    baud_rate: u32,
    startup_delay: Duration,
    operations: HashMap<String, Vec<Macro>>,
}

impl DeviceProfile {
    /// Start building a profile; `init` is required up front
    pub fn builder(
        name: impl Into<String>,
        baud_rate: u32,
        init: Vec<Macro>,
    ) -> DeviceProfileBuilder {
        let mut operations = HashMap::new();
        operations.insert(INIT_OPERATION.to_string(), init);
        DeviceProfileBuilder {
            name: name.into(),
            baud_rate,
            startup_delay: Duration::ZERO,
            operations,
        }
    }

    /// Profile name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Baud rate used to open ports for this profile
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Time to wait after opening before probing
    pub fn startup_delay(&self) -> Duration {
        self.startup_delay
    }

    /// The identification probe
    pub fn init(&self) -> &[Macro] {
        // Presence is checked in `DeviceProfileBuilder::build`
        self.operations
            .get(INIT_OPERATION)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Look up an operation by name
    pub fn operation(&self, name: &str) -> Result<&[Macro], ProtocolError> {
        self.operations
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| ProtocolError::UnknownOperation {
                profile: self.name.clone(),
                operation: name.to_string(),
            })
    }

    /// Names of all operations, sorted
    pub fn operation_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.operations.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Builder for [`DeviceProfile`]
#[derive(Debug)]
pub struct DeviceProfileBuilder {
    name: String,
    baud_rate: u32,
    startup_delay: Duration,
    operations: HashMap<String, Vec<Macro>>,
}

impl DeviceProfileBuilder {
    /// Wait this long after opening a port before sending `init`
    pub fn startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }

    /// Add (or replace) a named operation
    pub fn operation(mut self, name: impl Into<String>, macros: Vec<Macro>) -> Self {
        self.operations.insert(name.into(), macros);
        self
    }

    /// Validate and finish the profile
    pub fn build(self) -> Result<DeviceProfile, ProtocolError> {
        for (operation, macros) in &self.operations {
            if !macros.is_empty() {
                continue;
            }
            if operation == INIT_OPERATION {
                return Err(ProtocolError::EmptyInit(self.name));
            }
            return Err(ProtocolError::EmptyOperation {
                profile: self.name,
                operation: operation.clone(),
            });
        }

        Ok(DeviceProfile {
            name: self.name,
            baud_rate: self.baud_rate,
            startup_delay: self.startup_delay,
            operations: self.operations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init() -> Vec<Macro> {
        vec![Macro::new("ID?", "^INITTED").unwrap()]
    }

    #[test]
    fn test_profile_defaults() {
        let profile = DeviceProfile::builder("mock", 9600, init()).build().unwrap();

        assert_eq!(profile.name(), "mock");
        assert_eq!(profile.baud_rate(), 9600);
        assert_eq!(profile.startup_delay(), Duration::ZERO);
        assert_eq!(profile.init().len(), 1);
        assert_eq!(profile.operation_names(), vec!["init"]);
    }

    #[test]
    fn test_empty_init_rejected() {
        let err = DeviceProfile::builder("mock", 9600, vec![]).build().unwrap_err();
        assert_eq!(err, ProtocolError::EmptyInit("mock".into()));
    }

    #[test]
    fn test_empty_operation_rejected() {
        let err = DeviceProfile::builder("mock", 9600, init())
            .operation("reset", vec![])
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::EmptyOperation { operation, .. } if operation == "reset"
        ));
    }

    #[test]
    fn test_unknown_operation() {
        let profile = DeviceProfile::builder("mock", 9600, init()).build().unwrap();
        let err = profile.operation("launch").unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownOperation { .. }));
    }

    #[test]
    fn test_operations_keep_macro_order() {
        let profile = DeviceProfile::builder("mock", 9600, init())
            .operation(
                "home",
                vec![
                    Macro::new("HOME X", "^OK").unwrap(),
                    Macro::new("HOME Y", "^OK").unwrap(),
                ],
            )
            .startup_delay(Duration::from_millis(250))
            .build()
            .unwrap();

        let home = profile.operation("home").unwrap();
        assert_eq!(home[0].command(), "HOME X");
        assert_eq!(home[1].command(), "HOME Y");
        assert_eq!(profile.startup_delay(), Duration::from_millis(250));
    }
}
