//! `munge outputs` command
//!
//! Prints one mapped output file per line, relative to the project root.

use anyhow::Result;

use crate::cli::OutputsArgs;
use crate::commands::load_project;
use munge::util::fs::relative_path;
use munge::util::Logger;

pub fn execute(args: OutputsArgs) -> Result<()> {
    let project = load_project(args.manifest.manifest.as_deref())?;
    let logger = Logger::new("outputs");
    let task = project.task(project.loader(logger.child("loader")), logger)?;

    for output in task.mapped_output_files()? {
        if args.absolute {
            println!("{}", output.display());
        } else {
            println!("{}", relative_path(project.root(), &output).display());
        }
    }

    Ok(())
}
