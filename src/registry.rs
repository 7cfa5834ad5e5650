//! Capability catalog mapping task-type names to resource and complexity
//! metadata.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MeshError, Result};

/// A registered task capability. Immutable at runtime except through
/// [`CapabilityRegistry::update`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCapability {
    pub name: String,
    /// Relative complexity in `[0, 1]`, feeding the load-factor model.
    pub complexity: f64,
    pub required_resource_tags: HashSet<String>,
    pub estimated_duration_minutes: u32,
    pub depends_on_capabilities: HashSet<String>,
}

impl TaskCapability {
    pub fn new(name: impl Into<String>, complexity: f64, estimated_duration_minutes: u32) -> Self {
        Self {
            name: name.into(),
            complexity: complexity.clamp(0.0, 1.0),
            required_resource_tags: HashSet::new(),
            estimated_duration_minutes,
            depends_on_capabilities: HashSet::new(),
        }
    }

    pub fn with_resource_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_resource_tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// Thread-safe catalog of known capabilities, keyed by name.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    capabilities: RwLock<HashMap<String, TaskCapability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new capability. Registering an existing name is an error;
    /// use [`update`](Self::update) for administrative changes.
    pub fn register(&self, capability: TaskCapability) -> Result<()> {
        let mut map = self.capabilities.write();
        if map.contains_key(&capability.name) {
            return Err(MeshError::Config(format!(
                "capability already registered: {}",
                capability.name
            )));
        }
        debug!(name = %capability.name, "registered capability");
        map.insert(capability.name.clone(), capability);
        Ok(())
    }

    /// Administrative replacement of an existing capability definition.
    pub fn update(&self, capability: TaskCapability) -> Result<()> {
        let mut map = self.capabilities.write();
        if !map.contains_key(&capability.name) {
            return Err(MeshError::CapabilityNotFound(capability.name));
        }
        map.insert(capability.name.clone(), capability);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<TaskCapability> {
        self.capabilities.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.capabilities.read().contains_key(name)
    }

    pub fn list(&self) -> Vec<TaskCapability> {
        self.capabilities.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.capabilities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup() {
        let registry = CapabilityRegistry::new();
        registry
            .register(
                TaskCapability::new("assess-data-quality", 0.6, 30)
                    .with_resource_tags(["analysis_engine"]),
            )
            .unwrap();

        assert!(registry.contains("assess-data-quality"));
        let cap = registry.get("assess-data-quality").unwrap();
        assert!(cap.required_resource_tags.contains("analysis_engine"));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = CapabilityRegistry::new();
        registry
            .register(TaskCapability::new("plan-workshop", 0.4, 60))
            .unwrap();
        assert!(
            registry
                .register(TaskCapability::new("plan-workshop", 0.4, 60))
                .is_err()
        );
    }

    #[test]
    fn update_requires_existing_capability() {
        let registry = CapabilityRegistry::new();
        assert!(
            registry
                .update(TaskCapability::new("missing", 0.1, 5))
                .is_err()
        );
    }

}
