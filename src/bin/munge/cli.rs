//! CLI definitions using clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;

/// Munge - batch XSLT and template transformations
#[derive(Parser)]
#[command(name = "munge")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only report warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the transformation sets of Munge.toml
    Transform(TransformArgs),

    /// List the mapped output files
    Outputs(OutputsArgs),

    /// Remove declared output files and the stored fingerprint
    Clean(CleanArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Args)]
pub struct ManifestArgs {
    /// Path to Munge.toml (defaults to the nearest one above the current directory)
    #[arg(long, env = "MUNGE_MANIFEST")]
    pub manifest: Option<PathBuf>,
}

#[derive(Args)]
pub struct TransformArgs {
    #[command(flatten)]
    pub manifest: ManifestArgs,

    /// Exit with an error if any transformation fails
    #[arg(long)]
    pub fail_on_error: bool,

    /// Run even if inputs and outputs are up to date
    #[arg(short, long)]
    pub force: bool,
}

#[derive(Args)]
pub struct OutputsArgs {
    #[command(flatten)]
    pub manifest: ManifestArgs,

    /// Print absolute paths
    #[arg(long)]
    pub absolute: bool,
}

#[derive(Args)]
pub struct CleanArgs {
    #[command(flatten)]
    pub manifest: ManifestArgs,
}

#[derive(Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}
