//! Device drivers available to experiments.
//!
//! Drivers are looked up by the `driver` field of a device database entry and
//! constructed from its `arguments` mapping:
//!
//! ```json
//! {
//!     "ttl": {"driver": "mock_ttl", "arguments": {"channel": 3}},
//!     "dds": {"driver": "mock_dds", "arguments": {"center_frequency": 110e6}},
//!     "pmt": "ttl"
//! }
//! ```
//!
//! A string entry is an alias for another entry; the broker resolves aliases
//! before it reaches this registry.

pub mod mock;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

use crate::error::{MasterError, MasterResult};
use crate::protocol::Value;

/// Command envelope for device control.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Read a named setting or measurement
    Get(String),
    /// Change a named setting
    Set(String, Value),
    /// Driver-specific operation with arguments
    Custom(String, Value),
}

/// A device opened for the duration of one run.
#[async_trait]
pub trait Device: Send + Sync {
    /// Name of the device database entry this device was created from
    fn id(&self) -> &str;

    /// Open the hardware connection. Called once before first use.
    async fn initialize(&mut self) -> Result<()>;

    /// Execute a command and return its result (`Value::None` when there is
    /// nothing to return).
    async fn execute(&mut self, cmd: Command) -> Result<Value>;

    /// Release the hardware connection. Called once when the run ends.
    async fn shutdown(&mut self) -> Result<()>;
}

type DeviceFactory = Box<dyn Fn(&str, &Value) -> Result<Box<dyn Device>> + Send + Sync>;

/// Driver name to device constructor.
pub struct DeviceRegistry {
    factories: HashMap<String, DeviceFactory>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    /// Registry with the built-in mock drivers.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        mock::register(&mut registry);
        registry
    }

    /// Registry without any drivers.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registers `factory` for `driver`.
    pub fn register<F>(&mut self, driver: &str, factory: F)
    where
        F: Fn(&str, &Value) -> Result<Box<dyn Device>> + Send + Sync + 'static,
    {
        self.factories.insert(driver.to_string(), Box::new(factory));
    }

    /// Registered driver names, sorted.
    pub fn drivers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Builds (but does not initialize) the device described by `descriptor`.
    pub fn create(&self, name: &str, descriptor: &Value) -> MasterResult<Box<dyn Device>> {
        let driver = descriptor
            .get("driver")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                MasterError::Lookup(format!("device '{name}' has no driver in its description"))
            })?;
        let factory = self
            .factories
            .get(driver)
            .ok_or_else(|| MasterError::Lookup(format!("driver '{driver}' not found")))?;
        let arguments = descriptor.get("arguments").cloned().unwrap_or_default();
        factory(name, &arguments).map_err(|e| MasterError::Device(format!("{name}: {e:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_drivers() {
        let registry = DeviceRegistry::new();
        assert_eq!(registry.drivers(), vec!["mock_dds", "mock_ttl"]);
    }

    #[test]
    fn test_create_from_descriptor() {
        let registry = DeviceRegistry::new();
        let descriptor = Value::from_pairs([
            ("driver", Value::from("mock_ttl")),
            ("arguments", Value::from_pairs([("channel", Value::Int(2))])),
        ]);
        let device = registry.create("ttl0", &descriptor).unwrap();
        assert_eq!(device.id(), "ttl0");
    }

    #[test]
    fn test_unknown_driver_is_lookup_error() {
        let registry = DeviceRegistry::new();
        let descriptor = Value::from_pairs([("driver", Value::from("laser"))]);
        assert!(matches!(
            registry.create("x", &descriptor),
            Err(MasterError::Lookup(_))
        ));
        assert!(matches!(
            registry.create("x", &Value::Int(3)),
            Err(MasterError::Lookup(_))
        ));
    }

    #[test]
    fn test_factory_failure_is_device_error() {
        let mut registry = DeviceRegistry::empty();
        registry.register("broken", |_, _| Err(anyhow::anyhow!("no hardware")));
        let descriptor = Value::from_pairs([("driver", Value::from("broken"))]);
        match registry.create("b", &descriptor) {
            Err(MasterError::Device(msg)) => assert!(msg.contains("no hardware")),
            other => panic!("unexpected: {:?}", other.map(|d| d.id().to_string())),
        }
    }
}
