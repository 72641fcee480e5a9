//! Command implementations

pub mod clean;
pub mod completions;
pub mod outputs;
pub mod transform;

use std::path::Path;

use anyhow::{Context, Result};
use munge::util::Project;

/// Load the project named by `--manifest`, or the nearest one.
pub fn load_project(manifest: Option<&Path>) -> Result<Project> {
    let cwd = std::env::current_dir().context("failed to get current directory")?;
    Ok(Project::discover(manifest, &cwd)?)
}
