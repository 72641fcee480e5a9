//! File set specifications.
//!
//! A `FilesSpec` accumulates path tokens and filtered directory specs. No I/O
//! happens until `resolve`, which expands everything into a deduplicated
//! `FileCollection`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use glob::{MatchOptions, Pattern};
use walkdir::WalkDir;

use crate::util::fs::{normalize_path, resolve_against};

/// Ant-style include/exclude patterns for a directory tree.
///
/// Patterns match the `/`-separated path relative to the directory root.
/// `*` matches within one path segment, `**` matches any number of segments,
/// and a pattern ending in `/` matches everything below that directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatternSet {
    includes: Vec<String>,
    excludes: Vec<String>,
}

impl PatternSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add include patterns.
    pub fn include<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.includes.extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Add exclude patterns.
    pub fn exclude<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excludes.extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn includes(&self) -> &[String] {
        &self.includes
    }

    pub fn excludes(&self) -> &[String] {
        &self.excludes
    }

    fn compile(&self) -> Result<CompiledPatterns> {
        Ok(CompiledPatterns {
            includes: compile_patterns(&self.includes)?,
            excludes: compile_patterns(&self.excludes)?,
        })
    }
}

struct CompiledPatterns {
    includes: Vec<Pattern>,
    excludes: Vec<Pattern>,
}

impl CompiledPatterns {
    fn matches(&self, relative: &str) -> bool {
        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };

        let included = self.includes.is_empty()
            || self
                .includes
                .iter()
                .any(|p| p.matches_with(relative, options));

        included && !self.excludes.iter().any(|p| p.matches_with(relative, options))
    }
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|raw| {
            let normalized = raw.replace('\\', "/");
            let normalized = if normalized.ends_with('/') {
                format!("{}**", normalized)
            } else {
                normalized
            };
            Pattern::new(&normalized).with_context(|| format!("invalid file pattern: {}", raw))
        })
        .collect()
}

/// A directory plus include/exclude filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryFilesSpec {
    directory: PathBuf,
    patterns: PatternSet,
}

impl DirectoryFilesSpec {
    pub fn new(directory: impl Into<PathBuf>, patterns: PatternSet) -> Self {
        DirectoryFilesSpec {
            directory: directory.into(),
            patterns,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn patterns(&self) -> &PatternSet {
        &self.patterns
    }

    /// Resolve to the filtered files of the directory subtree.
    pub fn resolve(&self, base_dir: &Path) -> Result<FileCollection> {
        let root = resolve_against(base_dir, &self.directory);
        let patterns = self.patterns.compile()?;

        let mut files = FileCollection::new();
        for path in walk_files(&root)? {
            let relative = path
                .strip_prefix(&root)
                .unwrap_or(&path)
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            if patterns.matches(&relative) {
                files.insert(path);
            }
        }
        Ok(files)
    }
}

/// Every regular file below `root`, in sorted walk order.
///
/// A missing root yields no files.
fn walk_files(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry =
            entry.with_context(|| format!("failed to walk directory: {}", root.display()))?;
        if entry.path().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Accumulated path tokens and filtered directories.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilesSpec {
    paths: Vec<PathBuf>,
    directory_specs: Vec<DirectoryFilesSpec>,
}

impl FilesSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file or directory path. Duplicate tokens are ignored.
    pub fn add(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.paths.contains(&path) {
            self.paths.push(path);
        }
    }

    /// Add several file or directory paths.
    pub fn add_all<I, P>(&mut self, paths: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        for path in paths {
            self.add(path);
        }
    }

    /// Add a directory whose files are filtered by `patterns`.
    pub fn add_directory(&mut self, directory: impl Into<PathBuf>, patterns: PatternSet) {
        self.directory_specs
            .push(DirectoryFilesSpec::new(directory, patterns));
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty() && self.directory_specs.is_empty()
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn directory_specs(&self) -> &[DirectoryFilesSpec] {
        &self.directory_specs
    }

    /// Expand every token and directory spec into concrete files.
    ///
    /// Relative paths resolve against `base_dir`. Missing paths contribute
    /// nothing; an empty spec resolves to an empty collection.
    pub fn resolve(&self, base_dir: &Path) -> Result<FileCollection> {
        let mut files = FileCollection::new();

        for token in &self.paths {
            let path = resolve_against(base_dir, token);
            if path.is_dir() {
                files.extend(walk_files(&path)?);
            } else if path.is_file() {
                files.insert(path);
            }
        }

        for spec in &self.directory_specs {
            files.extend(spec.resolve(base_dir)?);
        }

        Ok(files)
    }
}

/// An ordered collection of distinct files.
///
/// Files are kept in first-insertion order; two paths naming the same file
/// on disk count as one. Equality ignores order.
#[derive(Debug, Clone, Default)]
pub struct FileCollection {
    files: Vec<PathBuf>,
    identities: HashSet<PathBuf>,
}

impl FileCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a file, returning false if it was already present.
    pub fn insert(&mut self, path: PathBuf) -> bool {
        if self.identities.insert(normalize_path(&path)) {
            self.files.push(path);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.identities.contains(&normalize_path(path))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PathBuf> {
        self.files.iter()
    }

    pub fn as_slice(&self) -> &[PathBuf] {
        &self.files
    }
}

impl PartialEq for FileCollection {
    fn eq(&self, other: &Self) -> bool {
        self.identities == other.identities
    }
}

impl Eq for FileCollection {}

impl Extend<PathBuf> for FileCollection {
    fn extend<T: IntoIterator<Item = PathBuf>>(&mut self, iter: T) {
        for path in iter {
            self.insert(path);
        }
    }
}

impl FromIterator<PathBuf> for FileCollection {
    fn from_iter<T: IntoIterator<Item = PathBuf>>(iter: T) -> Self {
        let mut files = FileCollection::new();
        files.extend(iter);
        files
    }
}

impl IntoIterator for FileCollection {
    type Item = PathBuf;
    type IntoIter = std::vec::IntoIter<PathBuf>;

    fn into_iter(self) -> Self::IntoIter {
        self.files.into_iter()
    }
}

impl<'a> IntoIterator for &'a FileCollection {
    type Item = &'a PathBuf;
    type IntoIter = std::slice::Iter<'a, PathBuf>;

    fn into_iter(self) -> Self::IntoIter {
        self.files.iter()
    }
}
