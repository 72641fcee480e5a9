//! The isolated backend loader.
//!
//! Lookup order for a module name:
//!
//! 1. the resolved artifact roots, as resource `{root}/{name}`;
//! 2. names in a backend namespace are defined from the built-in
//!    [`BackendRegistry`], the origin of the transformer contract, and never
//!    reach the parent;
//! 3. the parent loader.
//!
//! Artifacts carry resources only, so backend namespace names skip step 1.
//! The artifact set is resolved lazily, on the first lookup, so library
//! versions set after construction are still honored. Once resolved the set
//! is committed for the lifetime of the loader.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use crate::backend::registry::BackendRegistry;
use crate::backend::trait_def::{
    BackendContext, BackendDescriptor, BackendKind, Transformer, TRANSFORMER_CONTRACT,
};
use crate::loader::coordinate::{LibraryCatalog, LibraryVersions, VersionSetting};
use crate::loader::resolver::ArtifactResolver;
use crate::loader::{resource_path, LoadError, Module, ModuleKind, ModuleLoader, ModuleOrigin};
use crate::util::log::Logger;

/// Module name prefixes that are always defined by the contract's origin.
const BACKEND_NAMESPACES: [&str; 2] = ["munge::backend::xslt", "munge::backend::template"];

/// Outcome of the one-time artifact resolution.
type Resolution = Result<Vec<PathBuf>, String>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Loads backends and their libraries from a lazily resolved artifact set.
pub struct IsolatedBackendLoader {
    catalog: LibraryCatalog,
    versions: Mutex<LibraryVersions>,
    committed: AtomicBool,
    resolver: Arc<dyn ArtifactResolver>,
    resolved: OnceLock<Resolution>,
    registry: BackendRegistry,
    parent: Arc<dyn ModuleLoader>,
    /// Per-name definition locks.
    name_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    defined: Mutex<HashMap<String, Arc<Module>>>,
    /// Files read through this loader beyond the sets' own inputs.
    dependencies: Mutex<BTreeSet<PathBuf>>,
    logger: Logger,
}

impl IsolatedBackendLoader {
    pub fn new(
        catalog: LibraryCatalog,
        versions: LibraryVersions,
        resolver: Arc<dyn ArtifactResolver>,
        parent: Arc<dyn ModuleLoader>,
        logger: Logger,
    ) -> Self {
        IsolatedBackendLoader {
            catalog,
            versions: Mutex::new(versions),
            committed: AtomicBool::new(false),
            resolver,
            resolved: OnceLock::new(),
            registry: BackendRegistry::new(),
            parent,
            name_locks: Mutex::new(HashMap::new()),
            defined: Mutex::new(HashMap::new()),
            dependencies: Mutex::new(BTreeSet::new()),
            logger,
        }
    }

    /// Replace the backend registry.
    pub fn with_registry(mut self, registry: BackendRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Override the version of one library.
    ///
    /// Fails once the artifact set has been resolved.
    pub fn set_version(&self, key: &str, setting: VersionSetting) -> Result<(), LoadError> {
        let mut versions = lock(&self.versions);
        if self.committed.load(Ordering::SeqCst) {
            return Err(LoadError::VersionsCommitted);
        }
        versions.set(key, setting);
        Ok(())
    }

    /// Files the backends reported reading, in path order.
    pub fn dependencies(&self) -> Vec<PathBuf> {
        lock(&self.dependencies).iter().cloned().collect()
    }

    /// Whether the artifact set has been resolved (or its resolution started).
    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::SeqCst)
    }

    /// The resolved artifact roots, resolving them on first use.
    pub fn search_path(&self) -> Result<&[PathBuf], &str> {
        match self.resolution() {
            Ok(roots) => Ok(roots),
            Err(cause) => Err(cause),
        }
    }

    fn resolution(&self) -> &Resolution {
        self.resolved.get_or_init(|| {
            let coordinates = {
                let versions = lock(&self.versions);
                self.committed.store(true, Ordering::SeqCst);
                versions.coordinates(&self.catalog)
            };

            let names: Vec<String> = coordinates.iter().map(|c| c.to_string()).collect();
            self.logger.debug(format!(
                "resolving backend libraries: [{}]",
                names.join(", ")
            ));

            match self.resolver.resolve(&coordinates) {
                Ok(roots) => Ok(roots),
                Err(e) => {
                    self.logger.failure("failed to resolve backend libraries", &e);
                    Err(format!("{:#}", e))
                }
            }
        })
    }

    fn is_backend_name(name: &str) -> bool {
        BACKEND_NAMESPACES.iter().any(|ns| name.starts_with(ns))
    }

    fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        lock(&self.name_locks)
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    fn define(&self, name: &str) -> Result<Arc<Module>, LoadError> {
        let resolution = self.resolution();

        // Artifacts carry resources only, so backend names skip the artifact
        // roots and come straight from the contract's origin.
        if Self::is_backend_name(name) {
            return self
                .registry
                .get(name)
                .map(|factory| {
                    Arc::new(Module::new(
                        name,
                        ModuleOrigin::Contract,
                        ModuleKind::Backend(factory),
                    ))
                })
                .ok_or_else(|| LoadError::NotFound {
                    name: name.to_string(),
                    cause: resolution.as_ref().err().cloned(),
                });
        }

        if let Ok(roots) = resolution {
            for root in roots {
                if let Some(path) = resource_path(root, name) {
                    return Ok(Arc::new(Module::new(
                        name,
                        ModuleOrigin::Artifact(root.clone()),
                        ModuleKind::Resource(path),
                    )));
                }
            }
        }

        self.parent.load_module(name).map_err(|e| match (e, resolution) {
            (LoadError::NotFound { name, cause: None }, Err(cause)) => LoadError::NotFound {
                name,
                cause: Some(cause.clone()),
            },
            (e, _) => e,
        })
    }

    /// Construct a transformer of `kind`, bound to this loader for its
    /// library lookups.
    pub fn instantiate(
        self: &Arc<Self>,
        kind: BackendKind,
        base_dir: &Path,
        logger: Logger,
    ) -> Result<Box<dyn Transformer>, LoadError> {
        let name = kind.module_name();
        let module = self.load_module(name)?;
        let factory = module.factory().ok_or_else(|| LoadError::NotABackend {
            name: name.to_string(),
        })?;

        if factory.contract() != TRANSFORMER_CONTRACT {
            return Err(LoadError::ContractMismatch {
                name: name.to_string(),
                expected: TRANSFORMER_CONTRACT,
                found: factory.contract(),
            });
        }

        let search_path = self.search_path().map(<[_]>::to_vec).unwrap_or_default();
        let context = BackendContext {
            descriptor: BackendDescriptor {
                kind,
                search_path,
                base_dir: base_dir.to_path_buf(),
            },
            modules: self.clone(),
            logger,
        };

        Ok(factory.create(context))
    }
}

impl ModuleLoader for IsolatedBackendLoader {
    fn load_module(&self, name: &str) -> Result<Arc<Module>, LoadError> {
        if let Some(module) = lock(&self.defined).get(name) {
            return Ok(module.clone());
        }

        let name_lock = self.name_lock(name);
        let _guard = lock(&name_lock);

        if let Some(module) = lock(&self.defined).get(name) {
            return Ok(module.clone());
        }

        let module = self.define(name)?;
        lock(&self.defined).insert(name.to_string(), module.clone());
        Ok(module)
    }

    fn record_dependency(&self, path: &Path) {
        lock(&self.dependencies).insert(path.to_path_buf());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::trait_def::{BackendFactory, ContractId};
    use crate::loader::ambient::AmbientLoader;
    use crate::loader::coordinate::{Coordinate, LibrarySpec};
    use crate::test_support::{CountingResolver, FailingResolver};
    use tempfile::TempDir;

    struct ForeignXslt;

    impl BackendFactory for ForeignXslt {
        fn kind(&self) -> BackendKind {
            BackendKind::Xslt
        }

        fn contract(&self) -> ContractId {
            ContractId {
                name: "munge::Transformer",
                version: "0.0.0-foreign",
            }
        }

        fn create(&self, _context: BackendContext) -> Box<dyn Transformer> {
            panic!("foreign backends must never be constructed")
        }
    }

    fn catalog() -> LibraryCatalog {
        let mut catalog = LibraryCatalog::new();
        catalog.add(LibrarySpec::new("macros", "munge", "macros", Some("1.0")));
        catalog
    }

    fn loader_with(
        resolver: Arc<dyn ArtifactResolver>,
        parent: AmbientLoader,
    ) -> Arc<IsolatedBackendLoader> {
        Arc::new(IsolatedBackendLoader::new(
            catalog(),
            LibraryVersions::new(),
            resolver,
            Arc::new(parent),
            Logger::new("loader"),
        ))
    }

    #[test]
    fn test_resolution_is_lazy_and_honors_late_versions() {
        let tmp = TempDir::new().unwrap();
        let resolver = Arc::new(CountingResolver::new(tmp.path()));
        let loader = loader_with(resolver.clone(), AmbientLoader::empty());

        assert_eq!(resolver.calls(), 0);
        loader
            .set_version("macros", VersionSetting::version("2.0"))
            .unwrap();
        assert!(!loader.is_committed());

        let _ = loader.load_module("anything");
        assert_eq!(resolver.calls(), 1);
        assert_eq!(
            resolver.last_request(),
            vec![Coordinate::new("munge", "macros", "2.0")]
        );
    }

    #[test]
    fn test_resolves_at_most_once() {
        let tmp = TempDir::new().unwrap();
        let resolver = Arc::new(CountingResolver::new(tmp.path()));
        let loader = loader_with(resolver.clone(), AmbientLoader::empty());

        for name in ["a", "b", "a", BackendKind::Xslt.module_name()] {
            let _ = loader.load_module(name);
        }
        let _ = loader.search_path();

        assert_eq!(resolver.calls(), 1);
    }

    #[test]
    fn test_version_change_after_commit_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let loader = loader_with(
            Arc::new(CountingResolver::new(tmp.path())),
            AmbientLoader::empty(),
        );

        let _ = loader.search_path();
        assert!(matches!(
            loader.set_version("macros", VersionSetting::excluded()),
            Err(LoadError::VersionsCommitted)
        ));
    }

    #[test]
    fn test_artifacts_are_consulted_before_parent() {
        let tmp = TempDir::new().unwrap();
        let resolver = Arc::new(CountingResolver::new(tmp.path().join("repo")));
        let artifact_root = resolver.root_for(&Coordinate::new("munge", "macros", "1.0"));
        std::fs::create_dir_all(&artifact_root).unwrap();
        std::fs::write(artifact_root.join("shared.j2"), "artifact").unwrap();

        let ambient = tmp.path().join("lib");
        std::fs::create_dir_all(&ambient).unwrap();
        std::fs::write(ambient.join("shared.j2"), "ambient").unwrap();
        std::fs::write(ambient.join("local.j2"), "ambient").unwrap();

        let loader = loader_with(resolver, AmbientLoader::new(vec![ambient.clone()]));

        let shared = loader.load_module("shared.j2").unwrap();
        assert_eq!(shared.origin(), &ModuleOrigin::Artifact(artifact_root));

        let local = loader.load_module("local.j2").unwrap();
        assert_eq!(local.resource_path(), Some(ambient.join("local.j2").as_path()));
    }

    #[test]
    fn test_backend_comes_from_contract_origin_not_parent() {
        let tmp = TempDir::new().unwrap();
        let mut parent = AmbientLoader::empty();
        parent.register(
            BackendKind::Xslt.module_name(),
            ModuleKind::Backend(Arc::new(ForeignXslt)),
        );
        let loader = loader_with(Arc::new(CountingResolver::new(tmp.path())), parent);

        let module = loader.load_module(BackendKind::Xslt.module_name()).unwrap();
        assert_eq!(module.origin(), &ModuleOrigin::Contract);
        assert_eq!(module.factory().unwrap().contract(), TRANSFORMER_CONTRACT);

        let transformer = loader.instantiate(BackendKind::Xslt, tmp.path(), Logger::new("t"));
        assert!(transformer.is_ok());
    }

    #[test]
    fn test_contract_mismatch_is_reported() {
        let tmp = TempDir::new().unwrap();
        let mut registry = BackendRegistry::empty();
        registry.register(Arc::new(ForeignXslt));
        let loader = Arc::new(
            IsolatedBackendLoader::new(
                catalog(),
                LibraryVersions::new(),
                Arc::new(CountingResolver::new(tmp.path())),
                Arc::new(AmbientLoader::empty()),
                Logger::new("loader"),
            )
            .with_registry(registry),
        );

        let err = loader
            .instantiate(BackendKind::Xslt, tmp.path(), Logger::new("t"))
            .err()
            .unwrap();
        assert!(matches!(err, LoadError::ContractMismatch { .. }));
    }

    #[test]
    fn test_backend_namespace_never_falls_through_to_parent() {
        let tmp = TempDir::new().unwrap();
        let mut parent = AmbientLoader::empty();
        parent.register(
            "munge::backend::xslt::Extension",
            ModuleKind::Resource(PathBuf::from("/ext")),
        );
        let loader = loader_with(Arc::new(CountingResolver::new(tmp.path())), parent);

        assert!(matches!(
            loader.load_module("munge::backend::xslt::Extension"),
            Err(LoadError::NotFound { .. })
        ));
    }

    #[test]
    fn test_resolution_failure_surfaces_as_not_found_with_cause() {
        let tmp = TempDir::new().unwrap();
        let ambient = tmp.path().join("lib");
        std::fs::create_dir_all(&ambient).unwrap();
        std::fs::write(ambient.join("local.xsl"), "").unwrap();

        let loader = loader_with(
            Arc::new(FailingResolver::new("repository offline")),
            AmbientLoader::new(vec![ambient]),
        );

        match loader.load_module("macros.j2") {
            Err(LoadError::NotFound { cause: Some(cause), .. }) => {
                assert!(cause.contains("repository offline"))
            }
            other => panic!("unexpected result: {:?}", other.map(|m| m.name().to_string())),
        }

        // The ambient loader and the contract origin still work.
        assert!(loader.load_module("local.xsl").is_ok());
        assert!(loader
            .instantiate(BackendKind::Template, tmp.path(), Logger::new("t"))
            .is_ok());
    }

    #[test]
    fn test_modules_are_cached() {
        let tmp = TempDir::new().unwrap();
        let ambient = tmp.path().join("lib");
        std::fs::create_dir_all(&ambient).unwrap();
        std::fs::write(ambient.join("a.xsl"), "").unwrap();

        let loader = loader_with(
            Arc::new(CountingResolver::new(tmp.path())),
            AmbientLoader::new(vec![ambient.clone()]),
        );
        let first = loader.load_module("a.xsl").unwrap();
        std::fs::remove_file(ambient.join("a.xsl")).unwrap();
        let second = loader.load_module("a.xsl").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_concurrent_lookups_define_once() {
        let tmp = TempDir::new().unwrap();
        let resolver = Arc::new(CountingResolver::new(tmp.path()));
        let loader = loader_with(resolver.clone(), AmbientLoader::empty());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let loader = loader.clone();
                std::thread::spawn(move || {
                    loader
                        .load_module(BackendKind::Template.module_name())
                        .unwrap()
                })
            })
            .collect();
        let modules: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(modules.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(resolver.calls(), 1);
    }
}
