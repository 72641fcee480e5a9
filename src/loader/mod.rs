//! Module loading for transformation backends.
//!
//! Backends and the libraries they depend on are looked up by name through
//! a [`ModuleLoader`]. The [`IsolatedBackendLoader`] serves the names from
//! an externally resolved, version-pinned set of artifact roots first, keeps
//! backend implementations bound to the contract compiled into this crate,
//! and hands everything else to a parent loader.

pub mod ambient;
pub mod coordinate;
pub mod isolated;
pub mod resolver;

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::backend::trait_def::{BackendFactory, ContractId};

pub use ambient::AmbientLoader;
pub use coordinate::{Coordinate, LibraryCatalog, LibrarySpec, LibraryVersions, VersionSetting};
pub use isolated::IsolatedBackendLoader;
pub use resolver::{ArtifactResolver, LocalRepository};

/// Where a module was defined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleOrigin {
    /// A resolved artifact root.
    Artifact(PathBuf),
    /// The origin of the transformer contract, i.e. this crate.
    Contract,
    /// An ambient loader, with a label describing it.
    Ambient(String),
}

/// What a module provides.
#[derive(Clone)]
pub enum ModuleKind {
    /// A file, such as a template library or stylesheet.
    Resource(PathBuf),
    /// A backend implementation.
    Backend(Arc<dyn BackendFactory>),
}

impl fmt::Debug for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleKind::Resource(path) => f.debug_tuple("Resource").field(path).finish(),
            ModuleKind::Backend(factory) => f
                .debug_tuple("Backend")
                .field(&factory.kind())
                .field(&factory.contract())
                .finish(),
        }
    }
}

/// A named module returned by a loader.
#[derive(Debug, Clone)]
pub struct Module {
    name: String,
    origin: ModuleOrigin,
    kind: ModuleKind,
}

impl Module {
    pub fn new(name: impl Into<String>, origin: ModuleOrigin, kind: ModuleKind) -> Self {
        Module {
            name: name.into(),
            origin,
            kind,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn origin(&self) -> &ModuleOrigin {
        &self.origin
    }

    pub fn kind(&self) -> &ModuleKind {
        &self.kind
    }

    /// The file behind a resource module.
    pub fn resource_path(&self) -> Option<&Path> {
        match &self.kind {
            ModuleKind::Resource(path) => Some(path),
            ModuleKind::Backend(_) => None,
        }
    }

    pub fn factory(&self) -> Option<&Arc<dyn BackendFactory>> {
        match &self.kind {
            ModuleKind::Backend(factory) => Some(factory),
            ModuleKind::Resource(_) => None,
        }
    }
}

/// Error loading a module.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    #[error("module `{name}` not found{}", cause_suffix(.cause))]
    NotFound {
        name: String,
        /// Why the resolved artifact set was unavailable, if it was.
        cause: Option<String>,
    },

    #[error("module `{name}` implements contract {found}, expected {expected}")]
    ContractMismatch {
        name: String,
        expected: ContractId,
        found: ContractId,
    },

    #[error("module `{name}` is not a backend")]
    NotABackend { name: String },

    #[error("library versions cannot change after the backend libraries have been resolved")]
    VersionsCommitted,
}

fn cause_suffix(cause: &Option<String>) -> String {
    match cause {
        Some(cause) => format!(" (backend libraries unavailable: {})", cause),
        None => String::new(),
    }
}

impl LoadError {
    pub fn not_found(name: &str) -> Self {
        LoadError::NotFound {
            name: name.to_string(),
            cause: None,
        }
    }
}

/// Looks up modules by name.
pub trait ModuleLoader: Send + Sync {
    fn load_module(&self, name: &str) -> Result<Arc<Module>, LoadError>;

    /// Note a file a backend read while resolving an include or a module.
    fn record_dependency(&self, _path: &Path) {}
}

/// Path of resource `name` below `root`, if `name` is a plain relative path
/// that stays inside `root`.
pub(crate) fn resource_path(root: &Path, name: &str) -> Option<PathBuf> {
    let relative = Path::new(name);
    if name.is_empty() {
        return None;
    }
    let contained = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !contained {
        return None;
    }
    let candidate = root.join(relative);
    candidate.is_file().then_some(candidate)
}
