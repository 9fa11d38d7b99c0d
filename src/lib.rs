//! Core library for the `buildfleet` build orchestrator.
//!
//! The crate drives multi-stage builds across a pool of shared, often
//! power-cycled, remote machines. Each build target owns a strictly ordered
//! job queue ([`worker`]); jobs lease the target's machine exclusively
//! ([`lease`]), run the five pipeline stages ([`pipeline`]) and talk to the
//! remote host through an interactive session with reliable completion
//! detection ([`shell`]).

pub mod config;
pub mod context;
pub mod directory;
pub mod fleet;
pub mod fs;
pub mod lease;
pub mod log;
pub mod pipeline;
pub mod process;
pub mod repository;
pub mod shell;
pub mod test_support;
pub mod transfer;
pub mod vcs;
pub mod worker;

pub use config::{ConfigError, FleetConfig, SshConfig};
pub use context::FleetContext;
pub use directory::{DirectoryError, MachineDirectory, TargetSpec};
pub use fleet::{Fleet, FleetError, FleetReport, RunOptions, TargetReport};
pub use lease::{LeaseError, Machine};
pub use log::{LogError, TargetLog};
pub use pipeline::{BuildTarget, JobKind, JobOutcome, JobReport, Pipeline, Stage, StageError};
pub use process::{CommandError, CommandOutput, CommandRunner, ProcessCommandRunner};
pub use shell::{RemoteShellSession, ShellError, ShellOutput};
pub use worker::{TargetWorker, WorkerError};
