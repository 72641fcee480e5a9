//! Transformation backends and the contract they implement.

pub mod registry;
pub mod template;
pub mod trait_def;
pub mod xml;
pub mod xslt;

pub use registry::BackendRegistry;
pub use trait_def::{
    BackendContext, BackendDescriptor, BackendFactory, BackendKind, ContractId, OutputMapping,
    ParsedFile, Transformer, TRANSFORMER_CONTRACT,
};
