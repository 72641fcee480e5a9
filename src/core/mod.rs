//! Core data structures for Munge.
//!
//! - File set specifications and their resolved collections
//! - Output file specs and the host output registry
//! - Stylesheet/template parameters
//! - Transformation sets

pub mod files_spec;
pub mod output;
pub mod parameters;
pub mod transformation_set;

pub use files_spec::{DirectoryFilesSpec, FileCollection, FilesSpec, PatternSet};
pub use output::{
    encode_output, output_charset, write_output, OpenMode, OutputFileSpec, OutputRegistry,
};
pub use parameters::{ParamValue, Parameters};
pub use transformation_set::{OutputMappingFn, TransformationSet};
