//! Per-target job queue.
//!
//! A [`TargetWorker`] owns one background task that pulls jobs off an
//! unbounded channel and runs them one at a time, in submission order.
//! Submission never blocks. [`TargetWorker::wait`] is a drain barrier and
//! [`TargetWorker::join`] stops the loop once the running job finishes,
//! dropping whatever is still queued.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Future produced by a [`Job`].
pub type JobFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Zero-argument unit of work.
pub type Job = Box<dyn FnOnce() -> JobFuture + Send + 'static>;

/// Lifecycle of a worker.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkerState {
    /// Accepting and executing jobs.
    Running,
    /// Stop requested; the running job (if any) is finishing.
    Stopping,
    /// The background loop has exited.
    Stopped,
}

/// Errors raised by [`TargetWorker`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum WorkerError {
    /// The worker no longer accepts jobs.
    #[error("worker {name} is stopped")]
    Stopped {
        /// Worker name.
        name: String,
    },
    /// The background loop itself terminated abnormally.
    #[error("worker {name} terminated abnormally: {message}")]
    Panicked {
        /// Worker name.
        name: String,
        /// Join failure detail.
        message: String,
    },
}

/// Strictly ordered, single-consumer job queue.
#[derive(Debug)]
pub struct TargetWorker {
    name: String,
    sender: mpsc::UnboundedSender<Job>,
    outstanding: Arc<watch::Sender<usize>>,
    stop: watch::Sender<bool>,
    state: Arc<watch::Sender<WorkerState>>,
    handle: Option<JoinHandle<()>>,
}

impl TargetWorker {
    /// Spawns the background loop on the current tokio runtime.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let worker_name = name.into();
        let (sender, receiver) = mpsc::unbounded_channel();
        let (stop, stop_rx) = watch::channel(false);
        let outstanding = Arc::new(watch::Sender::new(0_usize));
        let state = Arc::new(watch::Sender::new(WorkerState::Running));

        let handle = tokio::spawn(drive(
            worker_name.clone(),
            receiver,
            stop_rx,
            Arc::clone(&outstanding),
            Arc::clone(&state),
        ));

        Self {
            name: worker_name,
            sender,
            outstanding,
            stop,
            state,
            handle: Some(handle),
        }
    }

    /// Worker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Number of jobs queued or running.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        *self.outstanding.borrow()
    }

    /// Appends `job` to the queue and returns immediately.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Stopped`] once a stop has been requested.
    pub fn enqueue<F, Fut>(&self, job: F) -> Result<(), WorkerError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if *self.stop.borrow() {
            return Err(self.stopped());
        }

        self.outstanding.send_modify(|count| *count += 1);
        let boxed: Job = Box::new(move || -> JobFuture { Box::pin(job()) });
        if self.sender.send(boxed).is_err() {
            self.outstanding
                .send_modify(|count| *count = count.saturating_sub(1));
            return Err(self.stopped());
        }
        Ok(())
    }

    /// Waits until no job is queued or running.
    ///
    /// Jobs enqueued after this returns are not covered.
    pub async fn wait(&self) {
        let mut outstanding = self.outstanding.subscribe();
        if outstanding.wait_for(|count| *count == 0).await.is_err() {
            debug!(worker = %self.name, "worker loop gone while waiting");
        }
    }

    /// Requests a stop without waiting for it.
    pub fn stop(&self) {
        self.stop.send_replace(true);
        self.state.send_if_modified(|state| {
            if *state == WorkerState::Running {
                *state = WorkerState::Stopping;
                true
            } else {
                false
            }
        });
    }

    /// Stops the loop after the running job and waits for it to exit.
    /// Queued jobs that have not started are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Panicked`] when the loop task failed.
    pub async fn join(mut self) -> Result<(), WorkerError> {
        self.stop();
        if let Some(handle) = self.handle.take() {
            handle.await.map_err(|err| WorkerError::Panicked {
                name: self.name.clone(),
                message: err.to_string(),
            })?;
        }
        Ok(())
    }

    fn stopped(&self) -> WorkerError {
        WorkerError::Stopped {
            name: self.name.clone(),
        }
    }
}

impl Drop for TargetWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop.send_replace(true);
        }
    }
}

async fn drive(
    name: String,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    mut stop: watch::Receiver<bool>,
    outstanding: Arc<watch::Sender<usize>>,
    state: Arc<watch::Sender<WorkerState>>,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = stop.changed() => break,
            next = jobs.recv() => match next {
                Some(job) => job,
                None => break,
            },
        };

        if let Err(err) = tokio::spawn(job()).await {
            error!(worker = %name, error = %err, "job terminated abnormally");
        }
        outstanding.send_modify(|count| *count = count.saturating_sub(1));
    }

    jobs.close();
    let mut abandoned = 0_usize;
    while jobs.try_recv().is_ok() {
        abandoned += 1;
    }
    if abandoned > 0 {
        warn!(worker = %name, abandoned, "worker stopped with unstarted jobs");
    }
    outstanding.send_replace(0);
    state.send_replace(WorkerState::Stopped);
    debug!(worker = %name, "worker stopped");
}
