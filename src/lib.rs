//! Munge - batch XSLT and template transformations for build pipelines
//!
//! Transformation sets apply every template to every source file through a
//! backend obtained from an isolated module loader, and report how many
//! transformations failed.

pub mod backend;
pub mod core;
pub mod loader;
pub mod ops;
pub mod util;

/// Test fixtures shared by the unit tests.
///
/// Only compiled for tests. Provides temporary project trees, stub artifact
/// resolvers and a recording output registry.
#[cfg(test)]
pub mod test_support;

pub use backend::{BackendKind, Transformer};
pub use core::{FilesSpec, OutputFileSpec, TransformationSet};
pub use loader::IsolatedBackendLoader;
pub use ops::{TransformError, TransformReport, TransformTask};
pub use util::log::Logger;
