//! High-level operations.

pub mod transform;

pub use transform::{TransformError, TransformReport, TransformTask};
