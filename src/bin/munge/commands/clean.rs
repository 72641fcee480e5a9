//! `munge clean` command

use std::fs;

use anyhow::{Context, Result};

use crate::cli::CleanArgs;
use crate::commands::load_project;
use munge::util::{Logger, StalenessTracker};

pub fn execute(args: CleanArgs) -> Result<()> {
    let project = load_project(args.manifest.manifest.as_deref())?;
    let logger = Logger::new("clean");
    let task = project.task(project.loader(logger.child("loader")), logger)?;
    let tracker = StalenessTracker::for_task(project.state_dir(), &task)?;

    let mut removed = 0;
    for file in tracker.output_files() {
        if file.is_file() {
            fs::remove_file(file)
                .with_context(|| format!("failed to remove {}", file.display()))?;
            removed += 1;
        }
    }
    tracker.clear()?;

    eprintln!("     Removed {} output files", removed);
    Ok(())
}
