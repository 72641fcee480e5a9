//! Munge CLI - batch XSLT and template transformations

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use munge::util::ConfigError;
use munge::TransformError;

mod cli;
mod commands;

use cli::{Cli, Commands};

fn main() {
    if let Err(e) = run() {
        report(e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("munge=debug")
    } else if cli.quiet {
        EnvFilter::new("munge=warn")
    } else {
        EnvFilter::new("munge=info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Transform(args) => commands::transform::execute(args),
        Commands::Outputs(args) => commands::outputs::execute(args),
        Commands::Clean(args) => commands::clean::execute(args),
        Commands::Completions(args) => commands::completions::execute(args),
    }
}

/// Print a fatal error. Manifest and strict-run failures get a full
/// diagnostic; everything else prints its context chain.
fn report(e: anyhow::Error) {
    let e = match e.downcast::<ConfigError>() {
        Ok(err) => {
            eprintln!("{:?}", miette::Report::new(err));
            return;
        }
        Err(e) => e,
    };
    match e.downcast::<TransformError>() {
        Ok(err) => eprintln!("{:?}", miette::Report::new(err)),
        Err(e) => eprintln!("error: {:#}", e),
    }
}
