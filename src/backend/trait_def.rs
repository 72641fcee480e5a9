//! The transformer contract shared by every backend.
//!
//! A transformer moves through a fixed lifecycle:
//!
//! ```text
//! unconfigured -> configure -> load_sources / load_templates -> execute_transformations
//! ```
//!
//! The lifecycle is not reentrant. If `configure` fails the caller must not
//! call `load_*` or `execute_transformations` on that instance.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use encoding_rs::Encoding;
use thiserror::Error;

use crate::core::files_spec::FileCollection;
use crate::core::output::OutputFileSpec;
use crate::core::parameters::Parameters;
use crate::loader::ModuleLoader;
use crate::util::log::Logger;

/// Maps a (source, template) pair to its output destination.
pub type OutputMapping<'a> = dyn Fn(&Path, &Path) -> Option<OutputFileSpec> + 'a;

/// Uniform lifecycle implemented by every transformation backend.
pub trait Transformer {
    /// Apply backend settings from an optional settings file.
    ///
    /// Returns false if the file could not be read or parsed; the failure
    /// has already been logged.
    fn configure(&mut self, config_file: Option<&Path>) -> bool;

    /// Set the parameters passed to every transformation.
    fn set_parameters(&mut self, parameters: &Parameters);

    /// Set the charset of primary output files. Backends whose templates
    /// control their own encoding may ignore this.
    fn set_output_charset(&mut self, charset: &'static Encoding);

    /// Load and validate source files, skipping the ones that fail.
    ///
    /// Returns the number of files that failed to load.
    fn load_sources(&mut self, files: &FileCollection) -> usize;

    /// Load and compile template files, skipping the ones that fail.
    ///
    /// Returns the number of files that failed to load.
    fn load_templates(&mut self, files: &FileCollection) -> usize;

    /// Apply every loaded template to every loaded source.
    ///
    /// Sources are iterated in load order on the outside, templates on the
    /// inside. A `None` mapping discards the primary output. Returns the
    /// number of failed transformations.
    fn execute_transformations(&mut self, mapping: &OutputMapping<'_>) -> usize;

    /// The logger this transformer reports through.
    fn logger(&self) -> &Logger;

    /// Log a transformation about to be executed.
    fn log_transformation(&self, source: &Path, template: &Path, output: Option<&OutputFileSpec>) {
        match output {
            Some(output) => self.logger().info(format!(
                "Transforming '{}' into '{}' with template '{}'",
                source.display(),
                output.path().display(),
                template.display()
            )),
            None => self.logger().info(format!(
                "Applying template '{}' to '{}'",
                template.display(),
                source.display()
            )),
        }
    }
}

/// A file paired with its loaded representation.
#[derive(Debug, Clone)]
pub struct ParsedFile<T> {
    path: PathBuf,
    contents: T,
}

impl<T> ParsedFile<T> {
    pub fn new(path: impl Into<PathBuf>, contents: T) -> Self {
        ParsedFile {
            path: path.into(),
            contents,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contents(&self) -> &T {
        &self.contents
    }
}

/// The built-in backend kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BackendKind {
    /// XSLT-style stylesheets applied to XML sources.
    Xslt,
    /// Template-language files rendered with an XML data model.
    Template,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Xslt => "xslt",
            BackendKind::Template => "template",
        }
    }

    /// The module name the backend implementation is defined under.
    pub fn module_name(&self) -> &'static str {
        match self {
            BackendKind::Xslt => "munge::backend::xslt::XsltTransformer",
            BackendKind::Template => "munge::backend::template::TemplateTransformer",
        }
    }

    pub fn all() -> [BackendKind; 2] {
        [BackendKind::Xslt, BackendKind::Template]
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing a backend kind.
#[derive(Debug, Error)]
#[error("unknown backend `{0}`; expected `xslt` or `template`")]
pub struct BackendKindParseError(String);

impl FromStr for BackendKind {
    type Err = BackendKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "xslt" => Ok(BackendKind::Xslt),
            "template" => Ok(BackendKind::Template),
            _ => Err(BackendKindParseError(s.to_string())),
        }
    }
}

/// Identity of the transformer contract a factory was built against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContractId {
    pub name: &'static str,
    pub version: &'static str,
}

impl fmt::Display for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// The contract identity of this build of the crate.
pub const TRANSFORMER_CONTRACT: ContractId = ContractId {
    name: "munge::Transformer",
    version: env!("CARGO_PKG_VERSION"),
};

/// Pure-data description of the backend instance to construct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendDescriptor {
    pub kind: BackendKind,
    /// Resolved artifact roots the backend may load libraries from.
    pub search_path: Vec<PathBuf>,
    /// Directory relative output paths resolve against.
    pub base_dir: PathBuf,
}

/// Everything a factory needs to construct a transformer.
#[derive(Clone)]
pub struct BackendContext {
    pub descriptor: BackendDescriptor,
    /// Loader for the libraries the backend depends on.
    pub modules: Arc<dyn ModuleLoader>,
    pub logger: Logger,
}

impl fmt::Debug for BackendContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendContext")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// Constructs transformer instances of one backend kind.
pub trait BackendFactory: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// The contract identity the produced transformers implement.
    fn contract(&self) -> ContractId {
        TRANSFORMER_CONTRACT
    }

    fn create(&self, context: BackendContext) -> Box<dyn Transformer>;
}
