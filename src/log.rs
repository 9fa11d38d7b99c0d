//! Per-target log files.
//!
//! Each build target writes to its own `build_<target>.log`. Jobs run under
//! a dedicated `tracing` dispatcher bound to that file, so every event a job
//! emits (remote output lines, stage transitions, failures) lands in the
//! target's log, tagged with the enclosing `stage` span.

use std::future::Future;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::Dispatch;
use tracing::instrument::{WithDispatch, WithSubscriber};
use tracing_subscriber::fmt;

use crate::fs::{self, FsError};

/// Raised when a target's log file cannot be opened.
#[derive(Debug, Error)]
#[error("cannot open the log of target {target}: {source}")]
pub struct LogError {
    /// Target whose log was requested.
    pub target: String,
    /// Filesystem failure.
    #[source]
    pub source: FsError,
}

/// Log file of one build target.
#[derive(Clone, Debug)]
pub struct TargetLog {
    path: Utf8PathBuf,
    dispatch: Dispatch,
}

impl TargetLog {
    /// Creates (truncating) `<dir>/build_<target>.log`.
    ///
    /// # Errors
    ///
    /// Returns [`LogError`] when the directory or file cannot be created.
    pub fn create(dir: &Utf8Path, target: &str) -> Result<Self, LogError> {
        let path = dir.join(format!("build_{target}.log"));
        let file = fs::create_file(&path).map_err(|source| LogError {
            target: target.to_owned(),
            source,
        })?;
        let subscriber = fmt()
            .with_writer(Arc::new(file))
            .with_ansi(false)
            .with_target(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        Ok(Self {
            path,
            dispatch: Dispatch::new(subscriber),
        })
    }

    /// Location of the log file.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Dispatcher writing to the log file.
    #[must_use]
    pub const fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    /// Runs `future` with this log as its default subscriber.
    pub fn attach<F: Future>(&self, future: F) -> WithDispatch<F> {
        future.with_subscriber(self.dispatch.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Stage;
    use tempfile::TempDir;
    use tracing::{info, info_span};

    #[tokio::test]
    async fn events_are_written_with_stage_label() {
        let tmp = TempDir::new().expect("tempdir");
        let dir = Utf8PathBuf::from_path_buf(tmp.path().join("logs")).expect("utf8 path");
        let log = TargetLog::create(&dir, "linux").expect("create log");

        log.attach(async {
            let span = info_span!("stage", stage = %Stage::Build);
            let _entered = span.enter();
            info!("running make");
        })
        .await;

        let contents = fs::read_to_string(log.path()).expect("read log");
        assert!(log.path().ends_with("build_linux.log"));
        assert!(contents.contains("stage=build"), "log: {contents}");
        assert!(contents.contains("running make"), "log: {contents}");
        assert!(!contents.contains('\u{1b}'), "log must be free of colour codes");
    }

    #[test]
    fn create_truncates_previous_log() {
        let tmp = TempDir::new().expect("tempdir");
        let dir = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 path");
        fs::write(&dir.join("build_macos.log"), "old run").expect("seed log");

        let log = TargetLog::create(&dir, "macos").expect("create log");

        assert_eq!(fs::read_to_string(log.path()).expect("read"), "");
    }
}
