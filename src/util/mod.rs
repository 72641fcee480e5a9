//! Shared utilities

pub mod config;
pub mod fs;
pub mod hash;
pub mod log;
pub mod tracker;

pub use config::{ConfigError, Manifest, Project};
pub use log::Logger;
pub use tracker::StalenessTracker;
