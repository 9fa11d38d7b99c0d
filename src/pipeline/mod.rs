//! Five-stage build pipeline.
//!
//! Every target kind implements [`Pipeline`]: prepare a patched source
//! tree, push it, build, fetch the artifacts and, as a separate job, test
//! them. [`BuildTarget`] runs those stages on the target's own worker under
//! a machine lease and records a [`JobReport`] per job.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::fs::FsError;
use crate::lease::LeaseError;
use crate::process::CommandError;
use crate::repository::RepositoryError;
use crate::shell::ShellError;
use crate::transfer::TransferError;
use crate::vcs::VcsError;

pub mod profiles;
mod repository;
mod shell;
mod target;

pub use profiles::TargetProfile;
pub use repository::{RepositoryPipeline, RepositorySettings};
pub use shell::ShellPipeline;
pub use target::BuildTarget;

/// One step of a target's pipeline.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Stage {
    /// Produce the patched source tree.
    Patch,
    /// Transfer the patched tree to the build machine.
    Push,
    /// Run the remote build.
    Build,
    /// Bring the artifacts back to the controlling host.
    Fetch,
    /// Exercise the fetched artifacts.
    Test,
}

impl Stage {
    /// Stages run by a build job, in order.
    pub const BUILD: [Self; 4] = [Self::Patch, Self::Push, Self::Build, Self::Fetch];

    /// Stages run by a test job.
    pub const TEST: [Self; 1] = [Self::Test];

    /// Short label used in log lines.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Patch => "patch",
            Self::Push => "push",
            Self::Build => "build",
            Self::Fetch => "fetch",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Reasons a stage fails.
#[derive(Debug, Error)]
pub enum StageError {
    /// The version-control collaborator failed.
    #[error(transparent)]
    Vcs(#[from] VcsError),
    /// The package-repository collaborator failed.
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    /// The remote session failed.
    #[error(transparent)]
    Shell(#[from] ShellError),
    /// A file transfer failed.
    #[error(transparent)]
    Transfer(#[from] TransferError),
    /// A local filesystem operation failed.
    #[error(transparent)]
    Fs(#[from] FsError),
    /// A host command failed.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// The remote shell never confirmed that the commands finished.
    #[error("remote commands did not signal completion")]
    Incomplete,
    /// The captured output reports a failure.
    #[error("output contains failure marker {marker:?}")]
    FailureMarker {
        /// Marker found in the output.
        marker: String,
    },
    /// An expected file was not produced.
    #[error("expected artifact {path} is missing")]
    MissingArtifact {
        /// Local path that should exist.
        path: Utf8PathBuf,
    },
    /// The package repository reported failed builds.
    #[error("repository build failed: {results}")]
    BuildFailed {
        /// Failed result lines.
        results: String,
    },
}

/// Future returned by [`Pipeline`] stages.
pub type StageFuture<'a> = Pin<Box<dyn Future<Output = Result<(), StageError>> + Send + 'a>>;

/// The five capabilities every target kind provides.
pub trait Pipeline: Send {
    /// Produces the patched source tree.
    fn prepare_patched_source(&mut self) -> StageFuture<'_>;

    /// Replaces the remote copy of the source with the patched tree.
    fn push_source(&mut self) -> StageFuture<'_>;

    /// Runs the target's build procedure.
    fn build(&mut self) -> StageFuture<'_>;

    /// Copies the produced artifacts into the target's artifact directory.
    fn fetch_artifacts(&mut self) -> StageFuture<'_>;

    /// Exercises the fetched artifacts.
    fn test(&mut self) -> StageFuture<'_>;

    /// Drops connections held open between stages. Called once a job is
    /// over, before its lease is released.
    fn disconnect(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async {})
    }

    /// Dispatches `stage` to the matching capability.
    fn run_stage(&mut self, stage: Stage) -> StageFuture<'_> {
        match stage {
            Stage::Patch => self.prepare_patched_source(),
            Stage::Push => self.push_source(),
            Stage::Build => self.build(),
            Stage::Fetch => self.fetch_artifacts(),
            Stage::Test => self.test(),
        }
    }
}

/// Kind of job queued on a target.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobKind {
    /// Stages one to four under one lease.
    Build,
    /// The test stage under its own lease.
    Test,
}

impl JobKind {
    /// Stages the job runs, in order.
    #[must_use]
    pub const fn stages(self) -> &'static [Stage] {
        match self {
            Self::Build => &Stage::BUILD,
            Self::Test => &Stage::TEST,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Build => "build",
            Self::Test => "test",
        })
    }
}

/// Why a job stopped early.
#[derive(Debug, Error)]
pub enum JobError {
    /// The machine could not be leased or released.
    #[error(transparent)]
    Lease(#[from] LeaseError),
    /// A stage failed; the remaining stages were skipped.
    #[error("stage {stage} failed: {source}")]
    Stage {
        /// Failing stage.
        stage: Stage,
        /// Failure cause.
        #[source]
        source: StageError,
    },
}

impl JobError {
    /// Stage that failed, if the failure happened inside one.
    #[must_use]
    pub const fn stage(&self) -> Option<Stage> {
        match self {
            Self::Lease(_) => None,
            Self::Stage { stage, .. } => Some(*stage),
        }
    }
}

/// How a job ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum JobOutcome {
    /// Every stage succeeded.
    Succeeded,
    /// The job stopped early.
    Failed {
        /// Failing stage; `None` when the lease itself failed.
        stage: Option<Stage>,
        /// Rendered failure.
        message: String,
    },
}

/// Record of one finished job.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JobReport {
    /// Which job ran.
    pub kind: JobKind,
    /// How it ended.
    pub outcome: JobOutcome,
}

impl JobReport {
    /// Whether the job succeeded.
    #[must_use]
    pub const fn succeeded(&self) -> bool {
        matches!(self.outcome, JobOutcome::Succeeded)
    }
}
