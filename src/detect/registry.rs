use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use super::backend::DetectorBackend;
use super::backends::{MotionBackend, StubBackend};

/// Constructs a fresh detector instance.
pub type BackendFactory = Arc<dyn Fn() -> Result<Box<dyn DetectorBackend>> + Send + Sync>;

/// Registry of detector backend factories.
///
/// Backends keep per-stream state and `detect` takes `&mut self`, so the registry
/// hands out a new instance per camera instead of sharing one behind a lock.
#[derive(Clone)]
pub struct BackendRegistry {
    factories: BTreeMap<String, BackendFactory>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
            default_name: None,
        }
    }

    /// Registry with the built-in backends. `stub` is the default.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("stub", || Ok(Box::new(StubBackend::new())));
        registry.register("motion", || Ok(Box::new(MotionBackend::default())));
        registry
    }

    /// Register a factory. The first registered backend becomes the default.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Result<Box<dyn DetectorBackend>> + Send + Sync + 'static,
    {
        if self.default_name.is_none() {
            self.default_name = Some(name.to_string());
        }
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    /// Set default backend by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.factories.contains_key(name) {
            return Err(anyhow!("backend '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default_name.as_deref()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Build a new instance of the named backend.
    pub fn create(&self, name: &str) -> Result<Box<dyn DetectorBackend>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| anyhow!("backend '{}' not registered", name))?;
        factory()
    }

    /// Build a new instance of the default backend.
    pub fn create_default(&self) -> Result<Box<dyn DetectorBackend>> {
        let name = self
            .default_name
            .as_deref()
            .ok_or_else(|| anyhow!("no detector backends registered"))?;
        self.create(name)
    }

    /// Factory for the default backend, for handing to a stream.
    pub fn default_factory(&self) -> Result<BackendFactory> {
        let name = self
            .default_name
            .as_deref()
            .ok_or_else(|| anyhow!("no detector backends registered"))?;
        self.factories
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("backend '{}' not registered", name))
    }

    /// List registered backends (sorted).
    pub fn list(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_registered_is_default() {
        let registry = BackendRegistry::with_builtin();
        assert_eq!(registry.default_name(), Some("stub"));
        assert_eq!(registry.list(), vec!["motion".to_string(), "stub".to_string()]);

        let backend = registry.create_default().unwrap();
        assert_eq!(backend.name(), "stub");
    }

    #[test]
    fn set_default_requires_registration() {
        let mut registry = BackendRegistry::with_builtin();
        assert!(registry.set_default("yolo").is_err());
        registry.set_default("motion").unwrap();
        assert_eq!(registry.create_default().unwrap().name(), "motion");
        assert!(registry.create("yolo").is_err());
    }

    #[test]
    fn empty_registry_has_no_default() {
        let registry = BackendRegistry::new();
        assert!(registry.create_default().is_err());
        assert!(registry.default_factory().is_err());
    }
}
