//! Backend registry - the built-in backend factories.
//!
//! The registry lives alongside the transformer contract, so factories taken
//! from it always implement the contract the orchestrator was compiled
//! against. Construction never fails and performs no I/O.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::template::TemplateBackend;
use crate::backend::trait_def::{BackendFactory, BackendKind};
use crate::backend::xslt::XsltBackend;

/// Registry of backend factories keyed by module name.
pub struct BackendRegistry {
    factories: HashMap<&'static str, Arc<dyn BackendFactory>>,
}

impl BackendRegistry {
    /// Create a registry with all built-in backends.
    pub fn new() -> Self {
        let mut registry = BackendRegistry::empty();
        registry.register(Arc::new(XsltBackend));
        registry.register(Arc::new(TemplateBackend));
        registry
    }

    /// Create a registry without any backends.
    pub fn empty() -> Self {
        BackendRegistry {
            factories: HashMap::new(),
        }
    }

    /// Register a factory. A factory for the same kind is replaced.
    pub fn register(&mut self, factory: Arc<dyn BackendFactory>) {
        self.factories.insert(factory.kind().module_name(), factory);
    }

    /// Look up a factory by module name.
    pub fn get(&self, module_name: &str) -> Option<Arc<dyn BackendFactory>> {
        self.factories.get(module_name).cloned()
    }

    pub fn contains(&self, kind: BackendKind) -> bool {
        self.factories.contains_key(kind.module_name())
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
