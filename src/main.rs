//! Binary entry point for the `buildfleet` CLI.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::Parser;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use buildfleet::{
    ConfigError, DirectoryError, Fleet, FleetConfig, FleetContext, FleetError, FleetReport,
    JobOutcome, MachineDirectory, ProcessCommandRunner, RunOptions, SshConfig,
};

mod cli;

use cli::{Cli, RunCommand, TargetsCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Fleet(#[from] FleetError),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Run(command) => run_command(command).await,
        Cli::Targets(command) => list_targets(&command),
    }
}

async fn run_command(args: RunCommand) -> Result<i32, CliError> {
    let mut config = FleetConfig::load_without_cli_args()?;
    if let Some(path) = args.fleet_file {
        config.fleet_file = path;
    }
    config.validate()?;
    let ssh = SshConfig::load_without_cli_args()?;
    ssh.validate()?;

    let directory = MachineDirectory::load(&Utf8PathBuf::from(&config.fleet_file))?;
    let context = Arc::new(FleetContext::new(config, Arc::new(ProcessCommandRunner)));
    let fleet = Fleet::assemble(&directory, &context, &ssh)?;
    let options = RunOptions {
        targets: args.targets,
        skip_build: args.skip_build,
        skip_test: args.skip_test,
    };
    let report = fleet.run(&options).await?;

    write_summary(io::stdout(), &report)?;
    Ok(i32::from(!report.succeeded()))
}

fn list_targets(args: &TargetsCommand) -> Result<i32, CliError> {
    let path = args.fleet_file.clone().map_or_else(
        || FleetConfig::load_without_cli_args().map(|config| config.fleet_file),
        Ok,
    )?;
    let directory = MachineDirectory::load(&Utf8PathBuf::from(path))?;
    write_targets(io::stdout(), &directory)?;
    Ok(0)
}

fn write_targets(mut out: impl Write, directory: &MachineDirectory) -> io::Result<()> {
    for target in &directory.targets {
        let address = if target.address.is_empty() {
            "-"
        } else {
            target.address.as_str()
        };
        writeln!(
            out,
            "{}\t{}\t{}\t{}",
            target.name,
            target.kind.label(),
            address,
            target.machine_name()
        )?;
    }
    Ok(())
}

fn write_summary(mut out: impl Write, report: &FleetReport) -> io::Result<()> {
    for target in &report.targets {
        let status = if target.succeeded() { "ok" } else { "FAILED" };
        writeln!(out, "{}: {status} (log: {})", target.target, target.log)?;
        for job in &target.jobs {
            if let JobOutcome::Failed { message, .. } = &job.outcome {
                writeln!(out, "  {} job: {message}", job.kind)?;
            }
        }
    }
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
