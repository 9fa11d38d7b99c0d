//! A build target: pipeline, machine, worker and log bound together.

use std::sync::{Arc, PoisonError};

use tokio::sync::Mutex;
use tracing::{Instrument, error, info, info_span};

use super::{JobError, JobKind, JobOutcome, JobReport, Pipeline, Stage};
use crate::lease::Machine;
use crate::log::TargetLog;
use crate::worker::{TargetWorker, WorkerError};

type SharedPipeline = Arc<Mutex<Box<dyn Pipeline>>>;
type Reports = Arc<std::sync::Mutex<Vec<JobReport>>>;

/// One build target with its own job queue.
///
/// Jobs run on the target's [`TargetWorker`], one at a time. Each job holds
/// a lease on the target's machine for its whole duration and writes to the
/// target's [`TargetLog`].
pub struct BuildTarget {
    name: String,
    address: String,
    machine: Arc<Machine>,
    pipeline: SharedPipeline,
    worker: TargetWorker,
    log: TargetLog,
    reports: Reports,
}

impl std::fmt::Debug for BuildTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildTarget")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("machine", &self.machine)
            .field("worker", &self.worker)
            .field("log", &self.log)
            .finish_non_exhaustive()
    }
}

impl BuildTarget {
    /// Creates the target and starts its worker.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        machine: Arc<Machine>,
        pipeline: Box<dyn Pipeline>,
        log: TargetLog,
    ) -> Self {
        let target_name = name.into();
        Self {
            worker: TargetWorker::new(target_name.clone()),
            name: target_name,
            address: address.into(),
            machine,
            pipeline: Arc::new(Mutex::new(pipeline)),
            log,
            reports: Arc::default(),
        }
    }

    /// Target name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address of the build machine.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The target's log file.
    #[must_use]
    pub const fn log(&self) -> &TargetLog {
        &self.log
    }

    /// Queues the build job (patch, push, build, fetch).
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Stopped`] once the target has been joined.
    pub fn build(&self) -> Result<(), WorkerError> {
        self.enqueue(JobKind::Build)
    }

    /// Queues the test job.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Stopped`] once the target has been joined.
    pub fn test(&self) -> Result<(), WorkerError> {
        self.enqueue(JobKind::Test)
    }

    /// Waits until every queued job has finished.
    pub async fn wait(&self) {
        self.worker.wait().await;
    }

    /// Stops the worker and returns the reports of the jobs that ran.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Panicked`] when the worker loop failed.
    pub async fn join(self) -> Result<Vec<JobReport>, WorkerError> {
        self.worker.join().await?;
        Ok(std::mem::take(&mut *lock_reports(&self.reports)))
    }

    /// Reports of the jobs finished so far, in completion order.
    #[must_use]
    pub fn reports(&self) -> Vec<JobReport> {
        lock_reports(&self.reports).clone()
    }

    fn enqueue(&self, kind: JobKind) -> Result<(), WorkerError> {
        let job = Job {
            kind,
            target: self.name.clone(),
            address: self.address.clone(),
            machine: Arc::clone(&self.machine),
            pipeline: Arc::clone(&self.pipeline),
        };
        let reports = Arc::clone(&self.reports);
        let log = self.log.clone();
        self.worker.enqueue(move || async move {
            let report = log.attach(job.run()).await;
            lock_reports(&reports).push(report);
        })
    }
}

fn lock_reports(reports: &Reports) -> std::sync::MutexGuard<'_, Vec<JobReport>> {
    reports.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Job {
    kind: JobKind,
    target: String,
    address: String,
    machine: Arc<Machine>,
    pipeline: SharedPipeline,
}

impl Job {
    async fn run(self) -> JobReport {
        info!(target_name = %self.target, job = %self.kind, machine = %self.machine.name(),
            "waiting for machine");
        let mut guard = self.pipeline.lock().await;
        let pipeline: &mut dyn Pipeline = &mut **guard;
        let stages = self.kind.stages();

        let result: Result<(), JobError> = self
            .machine
            .with_lease(&self.address, move || async move {
                info!("machine leased");
                let outcome = run_stages(&mut *pipeline, stages).await;
                pipeline.disconnect().await;
                outcome
            })
            .await;

        let outcome = match result {
            Ok(()) => {
                info!(job = %self.kind, "job finished");
                JobOutcome::Succeeded
            }
            Err(err) => {
                error!(job = %self.kind, error = %err, "job failed");
                JobOutcome::Failed {
                    stage: err.stage(),
                    message: err.to_string(),
                }
            }
        };
        JobReport {
            kind: self.kind,
            outcome,
        }
    }
}

async fn run_stages(pipeline: &mut dyn Pipeline, stages: &[Stage]) -> Result<(), JobError> {
    for &stage in stages {
        async {
            info!("stage started");
            match pipeline.run_stage(stage).await {
                Ok(()) => {
                    info!("stage finished");
                    Ok(())
                }
                Err(source) => {
                    error!(error = %source, "stage failed");
                    Err(JobError::Stage { stage, source })
                }
            }
        }
        .instrument(info_span!("stage", stage = %stage))
        .await?;
    }
    Ok(())
}
