//! The ambient module loader - project module directories.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::loader::{resource_path, LoadError, Module, ModuleKind, ModuleLoader, ModuleOrigin};

/// Serves modules from a list of directories plus explicitly registered modules.
///
/// Used as the parent of the isolated loader.
#[derive(Debug, Default)]
pub struct AmbientLoader {
    module_path: Vec<PathBuf>,
    registered: HashMap<String, Arc<Module>>,
}

impl AmbientLoader {
    pub fn new(module_path: Vec<PathBuf>) -> Self {
        AmbientLoader {
            module_path,
            registered: HashMap::new(),
        }
    }

    /// A loader that knows no modules.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Register a module under `name`; registered modules shadow the module path.
    pub fn register(&mut self, name: impl Into<String>, kind: ModuleKind) {
        let name = name.into();
        let module = Module::new(name.clone(), ModuleOrigin::Ambient("registered".into()), kind);
        self.registered.insert(name, Arc::new(module));
    }
}

impl ModuleLoader for AmbientLoader {
    fn load_module(&self, name: &str) -> Result<Arc<Module>, LoadError> {
        if let Some(module) = self.registered.get(name) {
            return Ok(module.clone());
        }

        self.module_path
            .iter()
            .find_map(|dir| resource_path(dir, name))
            .map(|path| {
                Arc::new(Module::new(
                    name,
                    ModuleOrigin::Ambient("module path".into()),
                    ModuleKind::Resource(path),
                ))
            })
            .ok_or_else(|| LoadError::not_found(name))
    }
}
