//! Transformation sets.
//!
//! A `TransformationSet` pairs a source file spec with a template file spec,
//! decides where every (source, template) pair writes its output and drives
//! one backend transformer through its lifecycle.
//!
//! Output resolution for a pair, first match wins:
//!
//! 1. the registered mapping functions, in registration order;
//! 2. `{output_dir}/{source file name}` when an output directory is set
//!    (the template name is ignored, so several templates applied to one
//!    source write the same file and the last template wins);
//! 3. the shared output file, which every pair appends to;
//! 4. no output; the backend may still write side files.

use std::cell::OnceCell;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use encoding_rs::{Encoding, UTF_8};

use crate::backend::trait_def::BackendKind;
use crate::core::files_spec::{FileCollection, FilesSpec, PatternSet};
use crate::core::output::{OutputFileSpec, OutputRegistry};
use crate::core::parameters::{ParamValue, Parameters};
use crate::loader::IsolatedBackendLoader;
use crate::util::fs::{file_name_str, resolve_against};
use crate::util::log::Logger;

/// A user-supplied mapping from (source, template) to an output path.
pub type OutputMappingFn = Box<dyn Fn(&Path, &Path) -> Option<PathBuf>>;

/// Sources, templates and the output policy of one backend run.
pub struct TransformationSet {
    kind: BackendKind,
    base_dir: PathBuf,
    sources: FilesSpec,
    templates: FilesSpec,
    output_file: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    mappings: Vec<OutputMappingFn>,
    parameters: Parameters,
    dynamic_output_dirs: Vec<PathBuf>,
    config_file: Option<PathBuf>,
    charset: &'static Encoding,
    resolved_sources: OnceCell<FileCollection>,
    resolved_templates: OnceCell<FileCollection>,
    logger: Logger,
}

impl fmt::Debug for TransformationSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformationSet")
            .field("kind", &self.kind)
            .field("base_dir", &self.base_dir)
            .field("sources", &self.sources)
            .field("templates", &self.templates)
            .field("output_file", &self.output_file)
            .field("output_dir", &self.output_dir)
            .field("mappings", &self.mappings.len())
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

impl TransformationSet {
    /// Create an empty set. Relative paths resolve against `base_dir`.
    pub fn new(kind: BackendKind, base_dir: impl Into<PathBuf>, logger: Logger) -> Self {
        TransformationSet {
            kind,
            base_dir: base_dir.into(),
            sources: FilesSpec::new(),
            templates: FilesSpec::new(),
            output_file: None,
            output_dir: None,
            mappings: Vec::new(),
            parameters: Parameters::new(),
            dynamic_output_dirs: Vec::new(),
            config_file: None,
            charset: UTF_8,
            resolved_sources: OnceCell::new(),
            resolved_templates: OnceCell::new(),
            logger,
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    // Sources and templates

    pub fn source(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.sources.add(path);
        self.resolved_sources = OnceCell::new();
        self
    }

    pub fn sources<I, P>(&mut self, paths: I) -> &mut Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.sources.add_all(paths);
        self.resolved_sources = OnceCell::new();
        self
    }

    pub fn source_dir(&mut self, dir: impl Into<PathBuf>, patterns: PatternSet) -> &mut Self {
        self.sources.add_directory(dir, patterns);
        self.resolved_sources = OnceCell::new();
        self
    }

    pub fn template(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.templates.add(path);
        self.resolved_templates = OnceCell::new();
        self
    }

    pub fn templates<I, P>(&mut self, paths: I) -> &mut Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.templates.add_all(paths);
        self.resolved_templates = OnceCell::new();
        self
    }

    pub fn template_dir(&mut self, dir: impl Into<PathBuf>, patterns: PatternSet) -> &mut Self {
        self.templates.add_directory(dir, patterns);
        self.resolved_templates = OnceCell::new();
        self
    }

    /// The resolved source files, cached until the source spec changes.
    pub fn source_files(&self) -> Result<&FileCollection> {
        resolve_cached(&self.resolved_sources, &self.sources, &self.base_dir)
    }

    /// The resolved template files, cached until the template spec changes.
    pub fn template_files(&self) -> Result<&FileCollection> {
        resolve_cached(&self.resolved_templates, &self.templates, &self.base_dir)
    }

    // Output policy

    pub fn set_output_file(&mut self, path: Option<&Path>) -> &mut Self {
        self.output_file = path.map(|p| resolve_against(&self.base_dir, p));
        self
    }

    pub fn set_output_dir(&mut self, path: Option<&Path>) -> &mut Self {
        self.output_dir = path.map(|p| resolve_against(&self.base_dir, p));
        self
    }

    pub fn output_file(&self) -> Option<&Path> {
        self.output_file.as_deref()
    }

    pub fn output_dir(&self) -> Option<&Path> {
        self.output_dir.as_deref()
    }

    /// Register a mapping function, consulted before the output directory
    /// and the output file.
    pub fn output_mapping<F>(&mut self, mapping: F) -> &mut Self
    where
        F: Fn(&Path, &Path) -> Option<PathBuf> + 'static,
    {
        self.mappings.push(Box::new(mapping));
        self
    }

    /// Declare a directory templates write into outside the mapped outputs.
    pub fn dynamic_output_dir(&mut self, path: impl AsRef<Path>) -> &mut Self {
        self.dynamic_output_dirs
            .push(resolve_against(&self.base_dir, path.as_ref()));
        self
    }

    pub fn dynamic_output_dirs(&self) -> &[PathBuf] {
        &self.dynamic_output_dirs
    }

    // Backend settings

    pub fn parameter(
        &mut self,
        name: impl Into<String>,
        value: impl Into<ParamValue>,
    ) -> &mut Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn parameters<I, K, V>(&mut self, parameters: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<ParamValue>,
    {
        for (name, value) in parameters {
            self.parameter(name, value);
        }
        self
    }

    pub fn parameter_map(&self) -> &Parameters {
        &self.parameters
    }

    pub fn set_config_file(&mut self, path: Option<&Path>) -> &mut Self {
        self.config_file = path.map(|p| resolve_against(&self.base_dir, p));
        self
    }

    pub fn config_file(&self) -> Option<&Path> {
        self.config_file.as_deref()
    }

    pub fn set_charset(&mut self, charset: &'static Encoding) -> &mut Self {
        self.charset = charset;
        self
    }

    pub fn charset(&self) -> &'static Encoding {
        self.charset
    }

    // Mapping

    /// The output path of one (source, template) pair.
    pub fn map_to_output_file(&self, source: &Path, template: &Path) -> Option<PathBuf> {
        if let Some(mapped) = self.mappings.iter().find_map(|m| m(source, template)) {
            return Some(resolve_against(&self.base_dir, &mapped));
        }
        if let Some(dir) = &self.output_dir {
            return Some(dir.join(file_name_str(source)));
        }
        self.output_file.clone()
    }

    /// The output spec of one pair; the shared output file opens for append.
    pub fn output_file_spec(&self, source: &Path, template: &Path) -> Option<OutputFileSpec> {
        self.map_to_output_file(source, template).map(|path| {
            if self.output_file.as_deref() == Some(path.as_path()) {
                OutputFileSpec::append(path)
            } else {
                OutputFileSpec::truncate(path)
            }
        })
    }

    /// Every mapped output across the source x template cross product.
    ///
    /// A path reached by several pairs is listed once, except the shared
    /// output file, which is listed once per pair that appends to it.
    pub fn mapped_output_files(&self) -> Result<Vec<PathBuf>> {
        let templates = self.template_files()?;
        let mut seen = HashSet::new();
        let mut outputs = Vec::new();
        for source in self.source_files()? {
            for template in templates {
                let Some(path) = self.map_to_output_file(source, template) else {
                    continue;
                };
                if self.output_file.as_ref() == Some(&path) || seen.insert(path.clone()) {
                    outputs.push(path);
                }
            }
        }
        Ok(outputs)
    }

    /// Feed every output location of this set to the host registry.
    pub fn declare_outputs(&self, registry: &mut dyn OutputRegistry) -> Result<()> {
        if let Some(file) = &self.output_file {
            registry.output_file(file);
        }
        if let Some(dir) = &self.output_dir {
            registry.output_dir(dir);
        }
        for file in self.mapped_output_files()? {
            registry.output_file(&file);
        }
        for dir in &self.dynamic_output_dirs {
            registry.output_dir(dir);
        }
        Ok(())
    }

    // Execution

    fn delete_output_file_if_exists(&self) {
        let Some(path) = &self.output_file else {
            return;
        };
        match fs::remove_file(path) {
            Ok(()) => self
                .logger
                .debug(format!("Deleted existing output file '{}'", path.display())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => self.logger.warn(format!(
                "Could not delete existing output file '{}': {}",
                path.display(),
                e
            )),
        }
    }

    /// Run every pair of this set and return the number of errors.
    pub fn transform(&self, loader: &Arc<IsolatedBackendLoader>) -> usize {
        let sources = match self.source_files() {
            Ok(files) => files,
            Err(e) => {
                self.logger.failure("Failed to resolve source files", &e);
                return 1;
            }
        };
        let templates = match self.template_files() {
            Ok(files) => files,
            Err(e) => {
                self.logger.failure("Failed to resolve template files", &e);
                return 1;
            }
        };

        let backend_logger = self.logger.child(self.kind.as_str());
        let mut transformer = match loader.instantiate(self.kind, &self.base_dir, backend_logger) {
            Ok(transformer) => transformer,
            Err(e) => {
                self.logger.failure(
                    format!("Failed to create the {} backend", self.kind),
                    &e.into(),
                );
                return 1;
            }
        };

        if !transformer.configure(self.config_file.as_deref()) {
            return 1;
        }
        transformer.set_parameters(&self.parameters);
        transformer.set_output_charset(self.charset);

        self.logger.debug(format!(
            "{} sources, {} templates",
            sources.len(),
            templates.len()
        ));
        let mut errors = transformer.load_sources(sources);
        errors += transformer.load_templates(templates);

        self.delete_output_file_if_exists();
        errors += transformer
            .execute_transformations(&|source, template| self.output_file_spec(source, template));
        errors
    }
}

fn resolve_cached<'a>(
    cell: &'a OnceCell<FileCollection>,
    spec: &FilesSpec,
    base_dir: &Path,
) -> Result<&'a FileCollection> {
    if let Some(files) = cell.get() {
        return Ok(files);
    }
    let files = spec.resolve(base_dir)?;
    Ok(cell.get_or_init(|| files))
}
