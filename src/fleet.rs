//! Orchestration of a whole fleet.
//!
//! [`Fleet::assemble`] turns a [`MachineDirectory`] into one shared
//! [`Machine`] per directory entry and one [`BuildTarget`] per target.
//! [`Fleet::run`] queues the build jobs of the selected targets, then their
//! test jobs, and collects the reports once every worker has drained.

use std::collections::BTreeMap;
use std::sync::Arc;

use camino::Utf8PathBuf;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::SshConfig;
use crate::context::FleetContext;
use crate::directory::{
    DirectoryError, MachineDirectory, MachineProfile, PowerSpec, ProbeSpec, TargetPlan, TargetSpec,
};
use crate::lease::{Machine, PingProbe, ProxmoxControl, Reachability, TcpProbe};
use crate::log::{LogError, TargetLog};
use crate::pipeline::{BuildTarget, JobReport, Pipeline, RepositoryPipeline, ShellPipeline};
use crate::shell::{Connector, Credentials, RemoteShellSession, SessionOptions, SshConnector};
use crate::transfer::Rsync;
use crate::worker::WorkerError;

/// Errors raised while assembling or running a fleet.
#[derive(Debug, Error)]
pub enum FleetError {
    /// The machine directory is invalid.
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    /// A target log could not be opened.
    #[error(transparent)]
    Log(#[from] LogError),
    /// A selected target does not exist.
    #[error("unknown target {name}")]
    UnknownTarget {
        /// Requested name.
        name: String,
    },
    /// A target worker refused a job or failed.
    #[error("worker of target {target} failed: {source}")]
    Worker {
        /// Target name.
        target: String,
        /// Worker failure.
        #[source]
        source: WorkerError,
    },
}

/// Which targets and jobs [`Fleet::run`] schedules.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RunOptions {
    /// Targets to run; empty selects every target.
    pub targets: Vec<String>,
    /// Skip the build jobs.
    pub skip_build: bool,
    /// Skip the test jobs.
    pub skip_test: bool,
}

/// Reports of one target.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TargetReport {
    /// Target name.
    pub target: String,
    /// Target log file.
    pub log: Utf8PathBuf,
    /// Finished jobs in completion order.
    pub jobs: Vec<JobReport>,
}

impl TargetReport {
    /// Whether every job of the target succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.jobs.iter().all(JobReport::succeeded)
    }
}

/// Reports of a whole run, in directory order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FleetReport {
    /// Per-target reports.
    pub targets: Vec<TargetReport>,
}

impl FleetReport {
    /// Whether every job of every target succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.targets.iter().all(TargetReport::succeeded)
    }

    /// Targets with at least one failed job.
    pub fn failures(&self) -> impl Iterator<Item = &TargetReport> {
        self.targets.iter().filter(|report| !report.succeeded())
    }
}

/// Assembled targets ready to run.
#[derive(Debug)]
pub struct Fleet {
    targets: Vec<BuildTarget>,
}

impl Fleet {
    /// Assembles the fleet, reaching shell targets with the system `ssh`.
    ///
    /// # Errors
    ///
    /// See [`Self::assemble_with`].
    pub fn assemble(
        directory: &MachineDirectory,
        context: &Arc<FleetContext>,
        ssh: &SshConfig,
    ) -> Result<Self, FleetError> {
        Self::assemble_with(directory, context, ssh, &SshConnector::new(ssh.clone()))
    }

    /// Assembles the fleet, reaching shell targets through `connector`.
    ///
    /// Targets naming the same machine share one [`Machine`]; a target
    /// without a machine gets an always-on machine of its own. Every target
    /// starts its worker and truncates its log immediately.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::Directory`] for an invalid directory and
    /// [`FleetError::Log`] when a log file cannot be created.
    pub fn assemble_with<C>(
        directory: &MachineDirectory,
        context: &Arc<FleetContext>,
        ssh: &SshConfig,
        connector: &C,
    ) -> Result<Self, FleetError>
    where
        C: Connector + Clone + 'static,
    {
        directory.validate()?;
        let logs = context.config().logs_dir();
        let mut machines: BTreeMap<String, Arc<Machine>> = BTreeMap::new();
        let mut targets = Vec::with_capacity(directory.targets.len());

        for spec in &directory.targets {
            let name = spec.machine_name();
            let machine = match machines.get(name) {
                Some(machine) => Arc::clone(machine),
                None => {
                    let profile = directory.machine(name);
                    let built = Arc::new(build_machine(name, &profile, spec, context, ssh));
                    machines.insert(name.to_owned(), Arc::clone(&built));
                    built
                }
            };
            let pipeline = build_pipeline(spec, context, ssh, connector);
            let log = TargetLog::create(&logs, &spec.name)?;
            info!(target_name = %spec.name, machine = %name, log = %log.path(), "target assembled");
            targets.push(BuildTarget::new(
                spec.name.clone(),
                spec.address.clone(),
                machine,
                pipeline,
                log,
            ));
        }
        Ok(Self { targets })
    }

    /// Names of the assembled targets, in directory order.
    pub fn target_names(&self) -> impl Iterator<Item = &str> {
        self.targets.iter().map(BuildTarget::name)
    }

    /// Runs the selected jobs and returns the per-target reports.
    ///
    /// Every build job is queued before any test job. Targets progress
    /// independently; jobs of one target run in order. Job failures are
    /// reported, not raised.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::UnknownTarget`] before queuing anything when a
    /// selected name does not exist, and [`FleetError::Worker`] when a
    /// worker refuses a job or terminates abnormally.
    pub async fn run(self, options: &RunOptions) -> Result<FleetReport, FleetError> {
        if let Some(missing) = options
            .targets
            .iter()
            .find(|name| !self.targets.iter().any(|target| target.name() == name.as_str()))
        {
            return Err(FleetError::UnknownTarget {
                name: missing.clone(),
            });
        }
        let selected = |target: &BuildTarget| {
            options.targets.is_empty() || options.targets.iter().any(|name| name == target.name())
        };

        if options.skip_build {
            info!("build jobs skipped");
        } else {
            for target in self.targets.iter().filter(|target| selected(target)) {
                target.build().map_err(|source| worker_error(target, source))?;
            }
        }
        if options.skip_test {
            info!("test jobs skipped");
        } else {
            for target in self.targets.iter().filter(|target| selected(target)) {
                target.test().map_err(|source| worker_error(target, source))?;
            }
        }
        for target in &self.targets {
            target.wait().await;
        }

        let mut report = FleetReport::default();
        for target in self.targets {
            let keep = selected(&target);
            let name = target.name().to_owned();
            let log = target.log().path().to_path_buf();
            let jobs = target.join().await.map_err(|source| FleetError::Worker {
                target: name.clone(),
                source,
            })?;
            if keep {
                report.targets.push(TargetReport {
                    target: name,
                    log,
                    jobs,
                });
            }
        }
        for failed in report.failures() {
            warn!(target_name = %failed.target, log = %failed.log, "target had failed jobs");
        }
        Ok(report)
    }
}

fn worker_error(target: &BuildTarget, source: WorkerError) -> FleetError {
    FleetError::Worker {
        target: target.name().to_owned(),
        source,
    }
}

fn build_machine(
    name: &str,
    profile: &MachineProfile,
    spec: &TargetSpec,
    context: &FleetContext,
    ssh: &SshConfig,
) -> Machine {
    let config = context.config();
    let probe: Arc<dyn Reachability> = match profile.probe {
        ProbeSpec::Tcp { port } => Arc::new(TcpProbe::new(port)),
        ProbeSpec::Ping => Arc::new(PingProbe::new(context.runner())),
    };
    let machine = Machine::new(name, probe)
        .with_poll_interval(config.reachability_poll_interval())
        .with_reachability_timeout(config.reachability_timeout());
    match &profile.power {
        PowerSpec::None => {
            if spec.machine.is_none() {
                info!(target_name = %spec.name, "target runs on an always-on machine of its own");
            }
            machine
        }
        PowerSpec::Proxmox { host, user } => machine.with_power(Arc::new(ProxmoxControl::new(
            host.as_str(),
            user.as_str(),
            ssh.ssh_bin.as_str(),
            context.runner(),
        ))),
    }
}

fn build_pipeline<C>(
    spec: &TargetSpec,
    context: &Arc<FleetContext>,
    ssh: &SshConfig,
    connector: &C,
) -> Box<dyn Pipeline>
where
    C: Connector + Clone + 'static,
{
    let fallback_package = context
        .config()
        .repository_package
        .clone()
        .unwrap_or_else(|| spec.name.clone());
    match spec.kind.plan(&spec.user, &fallback_package) {
        TargetPlan::Repository(settings) => Box::new(RepositoryPipeline::new(
            spec.name.clone(),
            settings,
            Arc::clone(context),
        )),
        TargetPlan::Shell(profile) => {
            let credentials =
                Credentials::new(spec.address.as_str(), spec.user.as_str()).with_port(spec.port);
            let options =
                SessionOptions::from_config(ssh).with_default_shell(profile.default_shell.clone());
            let transfer = Rsync::new(ssh.clone(), context.runner())
                .with_remote_rsync(profile.remote_rsync.clone());
            let session = RemoteShellSession::new(connector.clone(), credentials, options, transfer);
            Box::new(ShellPipeline::new(
                spec.name.clone(),
                profile,
                session,
                Arc::clone(context),
            ))
        }
    }
}
