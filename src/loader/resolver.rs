//! Artifact resolution - coordinates to local directories.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

use crate::loader::coordinate::Coordinate;

/// Resolves artifact coordinates to local artifact roots.
///
/// Implemented by the host; called lazily, at most once per loader.
pub trait ArtifactResolver: Send + Sync {
    /// Resolve every coordinate, in order. An empty input yields an empty list.
    fn resolve(&self, coordinates: &[Coordinate]) -> Result<Vec<PathBuf>>;
}

/// A repository of unpacked artifacts on the local filesystem.
///
/// Artifact `org.example:macros:1.2` lives in `{root}/org/example/macros/1.2`.
#[derive(Debug, Clone)]
pub struct LocalRepository {
    root: PathBuf,
}

impl LocalRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalRepository { root: root.into() }
    }

    /// The repository under the user's home directory, `~/.munge/repository`.
    pub fn default_root() -> Option<PathBuf> {
        directories::BaseDirs::new().map(|b| b.home_dir().join(".munge").join("repository"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory an artifact is expected in, whether or not it exists.
    pub fn artifact_dir(&self, coordinate: &Coordinate) -> PathBuf {
        let mut dir = self.root.clone();
        for part in coordinate.group.split('.').filter(|p| !p.is_empty()) {
            dir.push(part);
        }
        dir.join(&coordinate.name).join(&coordinate.version)
    }
}

impl ArtifactResolver for LocalRepository {
    fn resolve(&self, coordinates: &[Coordinate]) -> Result<Vec<PathBuf>> {
        let mut roots = Vec::with_capacity(coordinates.len());

        for coordinate in coordinates {
            let dir = self.artifact_dir(coordinate);
            if !dir.is_dir() {
                bail!(
                    "artifact {} not found in repository {} (expected {})",
                    coordinate,
                    self.root.display(),
                    dir.display()
                );
            }
            roots.push(dir);
        }

        Ok(roots)
    }
}
