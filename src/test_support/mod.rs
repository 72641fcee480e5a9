//! Test utilities for munge unit tests.
//!
//! Provides a temporary project directory fixture, artifact resolvers that
//! record or fail their calls, and an output registry that records what it
//! is told.
//!
//! # Example
//!
//! ```rust,ignore
//! use munge::test_support::{test_loader, ProjectFixture};
//!
//! #[test]
//! fn test_example() {
//!     let project = ProjectFixture::new();
//!     let source = project.file("src/doc.xml", "<doc/>");
//!     let loader = test_loader();
//!     // Build a set against project.root()...
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use tempfile::TempDir;

use crate::core::output::OutputRegistry;
use crate::loader::{
    AmbientLoader, ArtifactResolver, Coordinate, IsolatedBackendLoader, LibraryCatalog,
    LibraryVersions, LocalRepository,
};
use crate::util::log::Logger;

/// A project laid out in a temporary directory.
pub struct ProjectFixture {
    dir: TempDir,
}

impl ProjectFixture {
    pub fn new() -> Self {
        ProjectFixture {
            dir: TempDir::new().expect("failed to create temp dir"),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Absolute path of `relative` inside the project.
    pub fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    /// Write a file, creating parent directories. Returns its absolute path.
    pub fn file(&self, relative: &str, contents: &str) -> PathBuf {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("failed to create parent dir");
        }
        std::fs::write(&path, contents).expect("failed to write fixture file");
        path
    }

    /// Create a directory. Returns its absolute path.
    pub fn dir(&self, relative: &str) -> PathBuf {
        let path = self.path(relative);
        std::fs::create_dir_all(&path).expect("failed to create fixture dir");
        path
    }

    /// Read a file inside the project.
    pub fn read(&self, relative: &str) -> String {
        std::fs::read_to_string(self.path(relative))
            .unwrap_or_else(|e| panic!("failed to read {}: {}", relative, e))
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.path(relative).exists()
    }
}

impl Default for ProjectFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves coordinates into a repository layout without checking that the
/// artifacts exist, and records every call.
pub struct CountingResolver {
    repository: LocalRepository,
    calls: AtomicUsize,
    last: Mutex<Vec<Coordinate>>,
}

impl CountingResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        CountingResolver {
            repository: LocalRepository::new(root),
            calls: AtomicUsize::new(0),
            last: Mutex::new(Vec::new()),
        }
    }

    /// Directory a coordinate resolves to.
    pub fn root_for(&self, coordinate: &Coordinate) -> PathBuf {
        self.repository.artifact_dir(coordinate)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Vec<Coordinate> {
        self.last.lock().unwrap().clone()
    }
}

impl ArtifactResolver for CountingResolver {
    fn resolve(&self, coordinates: &[Coordinate]) -> Result<Vec<PathBuf>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap() = coordinates.to_vec();
        Ok(coordinates.iter().map(|c| self.root_for(c)).collect())
    }
}

/// A resolver that always fails.
pub struct FailingResolver {
    message: String,
}

impl FailingResolver {
    pub fn new(message: impl Into<String>) -> Self {
        FailingResolver {
            message: message.into(),
        }
    }
}

impl ArtifactResolver for FailingResolver {
    fn resolve(&self, _coordinates: &[Coordinate]) -> Result<Vec<PathBuf>> {
        bail!("{}", self.message)
    }
}

/// A loader with no libraries and no module path.
pub fn test_loader() -> Arc<IsolatedBackendLoader> {
    test_loader_with(Vec::new(), Vec::new())
}

/// A loader serving the given artifact roots and ambient module directories.
pub fn test_loader_with(
    artifact_roots: Vec<PathBuf>,
    module_path: Vec<PathBuf>,
) -> Arc<IsolatedBackendLoader> {
    Arc::new(IsolatedBackendLoader::new(
        LibraryCatalog::new(),
        LibraryVersions::new(),
        Arc::new(FixedRoots(artifact_roots)),
        Arc::new(AmbientLoader::new(module_path)),
        Logger::new("test"),
    ))
}

struct FixedRoots(Vec<PathBuf>);

impl ArtifactResolver for FixedRoots {
    fn resolve(&self, _coordinates: &[Coordinate]) -> Result<Vec<PathBuf>> {
        Ok(self.0.clone())
    }
}

/// Records declared outputs.
#[derive(Debug, Default)]
pub struct RecordingRegistry {
    pub files: Vec<PathBuf>,
    pub dirs: Vec<PathBuf>,
}

impl OutputRegistry for RecordingRegistry {
    fn output_file(&mut self, path: &Path) {
        self.files.push(path.to_path_buf());
    }

    fn output_dir(&mut self, path: &Path) {
        self.dirs.push(path.to_path_buf());
    }
}
