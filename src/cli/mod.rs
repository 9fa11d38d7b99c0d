//! Command-line interface definitions for the `buildfleet` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `buildfleet` binary.
#[derive(Debug, Parser)]
#[command(
    name = "buildfleet",
    about = "Build and test every target of a fleet of shared build machines",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Run the build and test jobs of the configured targets.
    #[command(name = "run", about = "Run the build and test jobs of the configured targets")]
    Run(RunCommand),
    /// List the targets of the machine directory.
    #[command(name = "targets", about = "List the targets of the machine directory")]
    Targets(TargetsCommand),
}

/// Arguments for the `buildfleet run` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct RunCommand {
    /// Restrict the run to this target; repeat for several. All targets run
    /// when omitted.
    #[arg(long = "target", value_name = "NAME")]
    pub(crate) targets: Vec<String>,
    /// Skip the test jobs.
    #[arg(long)]
    pub(crate) skip_test: bool,
    /// Skip the build jobs and only test previously fetched artifacts.
    #[arg(long)]
    pub(crate) skip_build: bool,
    /// Machine directory to load instead of the configured one.
    #[arg(long, value_name = "PATH")]
    pub(crate) fleet_file: Option<String>,
}

/// Arguments for the `buildfleet targets` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct TargetsCommand {
    /// Machine directory to load instead of the configured one.
    #[arg(long, value_name = "PATH")]
    pub(crate) fleet_file: Option<String>,
}
