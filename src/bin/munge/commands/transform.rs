//! `munge transform` command

use anyhow::Result;

use crate::cli::TransformArgs;
use crate::commands::load_project;
use munge::util::{Logger, StalenessTracker};

pub fn execute(args: TransformArgs) -> Result<()> {
    let project = load_project(args.manifest.manifest.as_deref())?;
    let logger = Logger::new("transform");

    let loader = project.loader(logger.child("loader"));
    let mut task = project.task(loader, logger)?;
    if args.fail_on_error {
        task.set_fail_on_error(true);
    }

    let tracker = StalenessTracker::for_task(project.state_dir(), &task)?;
    if !args.force && tracker.is_up_to_date(project.manifest_path(), &task)? {
        eprintln!("       Fresh {} (up to date)", project.root().display());
        return Ok(());
    }

    let report = task.transform()?;
    if report.is_clean() {
        tracker.record(project.manifest_path(), &task)?;
        eprintln!("    Finished {} transformation sets", report.sets);
    } else {
        // A run with errors is never up to date.
        tracker.clear()?;
        eprintln!(
            "    Finished {} transformation sets with {} errors",
            report.sets, report.errors
        );
    }

    Ok(())
}
