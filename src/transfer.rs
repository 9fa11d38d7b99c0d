//! Bulk file transfer with `rsync` over SSH.
//!
//! The same argument list serves two execution routes: a direct local
//! subprocess through a [`CommandRunner`], or a rendered command line typed
//! into a live interactive session.

use std::ffi::OsString;
use std::sync::Arc;

use camino::Utf8Path;
use shell_escape::unix::escape;
use thiserror::Error;

use crate::config::SshConfig;
use crate::process::{CommandError, CommandRunner};
use crate::shell::{Credentials, common_ssh_options};

/// Errors raised by file transfers.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransferError {
    /// `rsync` could not be started.
    #[error(transparent)]
    Spawn(#[from] CommandError),
    /// `rsync` exited unsuccessfully.
    #[error("rsync from {from} to {to} failed with status {status_text}: {stderr}")]
    Failed {
        /// Source of the copy.
        from: String,
        /// Destination of the copy.
        to: String,
        /// Human readable exit status.
        status_text: String,
        /// Stderr captured from `rsync`.
        stderr: String,
    },
}

/// Direction of a copy relative to the controlling host.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    /// Local path to remote path.
    Upload,
    /// Remote path to local path.
    Download,
}

/// Builds and runs `rsync` invocations.
#[derive(Clone)]
pub struct Rsync {
    config: SshConfig,
    remote_rsync: Option<String>,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for Rsync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rsync")
            .field("rsync_bin", &self.config.rsync_bin)
            .field("remote_rsync", &self.remote_rsync)
            .finish_non_exhaustive()
    }
}

impl Rsync {
    /// Creates a transfer helper using `runner` for local execution.
    #[must_use]
    pub fn new(config: SshConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            remote_rsync: None,
            runner,
        }
    }

    /// Uses a non-default `rsync` executable on the remote side.
    #[must_use]
    pub fn with_remote_rsync(mut self, path: Option<String>) -> Self {
        self.remote_rsync = path;
        self
    }

    /// Local `rsync` executable.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.config.rsync_bin
    }

    /// Builds the argument list for a copy.
    #[must_use]
    pub fn args(
        &self,
        credentials: &Credentials,
        direction: Direction,
        local: &Utf8Path,
        remote: &str,
    ) -> Vec<OsString> {
        let mut args = vec![OsString::from("-avz")];
        if let Some(path) = self.remote_rsync.as_deref() {
            args.push(OsString::from(format!("--rsync-path={path}")));
        }
        args.push(OsString::from("-e"));
        args.push(OsString::from(self.remote_shell(credentials.port)));

        let remote_spec = format!("{}:{remote}", credentials.destination());
        match direction {
            Direction::Upload => {
                args.push(OsString::from(local.as_str()));
                args.push(OsString::from(remote_spec));
            }
            Direction::Download => {
                args.push(OsString::from(remote_spec));
                args.push(OsString::from(local.as_str()));
            }
        }
        args
    }

    /// Renders a copy as a single shell-escaped command line.
    #[must_use]
    pub fn command_line(
        &self,
        credentials: &Credentials,
        direction: Direction,
        local: &Utf8Path,
        remote: &str,
    ) -> String {
        std::iter::once(OsString::from(self.program()))
            .chain(self.args(credentials, direction, local, remote))
            .map(|arg| escape(arg.to_string_lossy()).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Runs a copy as a local subprocess.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Spawn`] when `rsync` cannot start and
    /// [`TransferError::Failed`] when it exits unsuccessfully.
    pub async fn copy(
        &self,
        credentials: &Credentials,
        direction: Direction,
        local: &Utf8Path,
        remote: &str,
    ) -> Result<(), TransferError> {
        let args = self.args(credentials, direction, local, remote);
        let output = self.runner.run(self.program(), &args).await?;
        if output.is_success() {
            return Ok(());
        }

        let remote_spec = format!("{}:{remote}", credentials.destination());
        let (from, to) = match direction {
            Direction::Upload => (local.to_string(), remote_spec),
            Direction::Download => (remote_spec, local.to_string()),
        };
        Err(TransferError::Failed {
            from,
            to,
            status_text: output.status_text(),
            stderr: output.stderr.trim().to_owned(),
        })
    }

    fn remote_shell(&self, port: u16) -> String {
        let opts = common_ssh_options(&self.config, port)
            .into_iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        format!("{} {}", self.config.ssh_bin, opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;
    use rstest::rstest;

    fn rsync(runner: &ScriptedRunner) -> Rsync {
        Rsync::new(SshConfig::with_defaults(), Arc::new(runner.clone()))
    }

    fn rendered(args: &[OsString]) -> Vec<String> {
        args.iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[rstest]
    #[case(Direction::Upload, "patched/linux", "builder@10.0.0.5:/home/builder/src")]
    #[case(Direction::Download, "builder@10.0.0.5:/home/builder/src", "patched/linux")]
    fn args_order_source_before_destination(
        #[case] direction: Direction,
        #[case] source: &str,
        #[case] destination: &str,
    ) {
        let runner = ScriptedRunner::new();
        let credentials = Credentials::new("10.0.0.5", "builder");

        let args = rendered(&rsync(&runner).args(
            &credentials,
            direction,
            Utf8Path::new("patched/linux"),
            "/home/builder/src",
        ));

        assert_eq!(args.first().map(String::as_str), Some("-avz"));
        let tail: Vec<&str> = args.iter().rev().take(2).rev().map(String::as_str).collect();
        assert_eq!(tail, vec![source, destination]);
        assert!(args.windows(2).any(|pair| {
            pair.first().map(String::as_str) == Some("-e")
                && pair.get(1).is_some_and(|shell| shell.starts_with("ssh -p 22"))
        }));
    }

    #[test]
    fn remote_rsync_path_is_forwarded() {
        let runner = ScriptedRunner::new();
        let transfer = rsync(&runner).with_remote_rsync(Some(String::from(
            r"C:\msys64\usr\bin\rsync.exe",
        )));

        let args = rendered(&transfer.args(
            &Credentials::new("10.0.0.7", "builder"),
            Direction::Upload,
            Utf8Path::new("src"),
            "/c/build",
        ));

        assert!(args.contains(&String::from(r"--rsync-path=C:\msys64\usr\bin\rsync.exe")));
    }

    #[test]
    fn command_line_quotes_the_remote_shell() {
        let runner = ScriptedRunner::new();
        let line = rsync(&runner).command_line(
            &Credentials::new("10.0.0.5", "builder"),
            Direction::Download,
            Utf8Path::new("distr/linux"),
            "/tmp/out",
        );

        assert!(line.starts_with("rsync -avz -e 'ssh -p 22"), "line: {line}");
        assert!(
            line.ends_with("'builder@10.0.0.5:/tmp/out' distr/linux"),
            "line: {line}"
        );
    }

    #[tokio::test]
    async fn copy_reports_rsync_failures() {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(23), "", "some files vanished\n");

        let err = rsync(&runner)
            .copy(
                &Credentials::new("10.0.0.5", "builder"),
                Direction::Upload,
                Utf8Path::new("patched/linux"),
                "/home/builder/src",
            )
            .await
            .expect_err("non-zero rsync exit should fail");

        assert_eq!(
            err,
            TransferError::Failed {
                from: String::from("patched/linux"),
                to: String::from("builder@10.0.0.5:/home/builder/src"),
                status_text: String::from("23"),
                stderr: String::from("some files vanished"),
            }
        );
        let invocations = runner.invocations();
        assert_eq!(invocations.len(), 1);
        assert_eq!(
            invocations.first().map(|call| call.program.as_str()),
            Some("rsync")
        );
    }
}
