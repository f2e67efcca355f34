use crate::{Driver, EchoDriver};
use agentwire_core::{AgentDefinition, Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub type DriverConstructor = Arc<dyn Fn(&AgentDefinition) -> Result<Arc<dyn Driver>> + Send + Sync>;

/// Drivers available to a container, keyed by the name a definition
/// selects in its `driver` field.
#[derive(Clone)]
pub struct DriverRegistry {
    constructors: Arc<RwLock<HashMap<String, DriverConstructor>>>,
}

impl Default for DriverRegistry {
    fn default() -> Self {
        let registry = Self::empty();
        registry.provide("echo", |_| Ok(Arc::new(EchoDriver::new()) as Arc<dyn Driver>));
        registry
    }
}

impl DriverRegistry {
    /// Registry with the built-in `echo` driver.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn empty() -> Self {
        Self {
            constructors: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register (or replace) the constructor for `name`.
    pub fn provide<F>(&self, name: &str, constructor: F)
    where
        F: Fn(&AgentDefinition) -> Result<Arc<dyn Driver>> + Send + Sync + 'static,
    {
        debug!(driver = name, "Driver registered");
        self.constructors
            .write()
            .insert(name.to_string(), Arc::new(constructor));
    }

    pub fn resolve(&self, definition: &AgentDefinition) -> Result<Arc<dyn Driver>> {
        let constructor = self
            .constructors
            .read()
            .get(&definition.driver)
            .cloned()
            .ok_or_else(|| {
                Error::Config(format!(
                    "unknown driver '{}' for definition '{}'",
                    definition.driver, definition.name
                ))
            })?;
        constructor(definition)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.read().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Resolve a driver from the built-in registry.
pub fn create_driver(definition: &AgentDefinition) -> Result<Arc<dyn Driver>> {
    DriverRegistry::new().resolve(definition)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_echo() {
        let driver = create_driver(&AgentDefinition::new("Echo")).unwrap();
        assert_eq!(driver.name(), "echo");
    }

    #[test]
    fn test_unknown_driver_is_config_error() {
        let def = AgentDefinition::new("X").with_driver("nope");
        match create_driver(&def) {
            Err(Error::Config(msg)) => assert!(msg.contains("nope")),
            other => panic!("expected config error, got {:?}", other.map(|d| d.name().to_string())),
        }
    }

    #[test]
    fn test_provide_custom() {
        let registry = DriverRegistry::empty();
        assert!(registry.names().is_empty());
        registry.provide("slow", |_| {
            Ok(Arc::new(EchoDriver::new().with_delay(std::time::Duration::from_millis(1)))
                as Arc<dyn Driver>)
        });
        let def = AgentDefinition::new("S").with_driver("slow");
        assert!(registry.resolve(&def).is_ok());
        assert_eq!(registry.names(), vec!["slow"]);
    }
}
