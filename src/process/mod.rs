//! Local process execution on the controlling host.
//!
//! Pipeline stages, power control and the collaborators all shell out to
//! host tools (`rsync`, `ssh`, `svn`, `osc`, `tar`). They do so through the
//! [`CommandRunner`] abstraction so tests can substitute scripted outcomes.

use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;

use camino::Utf8Path;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::debug;

/// Result of running an external command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Returns a human readable rendering of the exit status.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.code
            .map_or_else(|| String::from("unknown"), |code| code.to_string())
    }
}

/// Errors raised while launching host commands.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CommandError {
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a command completes with a non-zero exit code.
    #[error("{program} exited with status {status_text}: {stderr}")]
    Failed {
        /// Command name used for the attempted operation.
        program: String,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the process.
        stderr: String,
    },
}

impl CommandError {
    /// Builds a [`CommandError::Failed`] from a captured output.
    #[must_use]
    pub fn failed(program: &str, output: &CommandOutput) -> Self {
        Self::Failed {
            program: program.to_owned(),
            status_text: output.status_text(),
            stderr: output.stderr.trim().to_owned(),
        }
    }
}

/// Future returned by [`CommandRunner`] implementations.
pub type RunnerFuture<'a> =
    Pin<Box<dyn Future<Output = Result<CommandOutput, CommandError>> + Send + 'a>>;

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args` inside `dir` (or the current directory when
    /// `None`), capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Spawn`] if the command cannot be started.
    fn run_in<'a>(
        &'a self,
        dir: Option<&'a Utf8Path>,
        program: &'a str,
        args: &'a [OsString],
    ) -> RunnerFuture<'a>;

    /// Runs `program` with `args` in the current directory.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Spawn`] if the command cannot be started.
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString]) -> RunnerFuture<'a> {
        self.run_in(None, program, args)
    }
}

/// Runs a command and converts a non-zero exit status into an error.
///
/// # Errors
///
/// Returns [`CommandError::Spawn`] when the command cannot start and
/// [`CommandError::Failed`] when it exits unsuccessfully.
pub async fn run_checked<R: CommandRunner + ?Sized>(
    runner: &R,
    dir: Option<&Utf8Path>,
    program: &str,
    args: &[OsString],
) -> Result<CommandOutput, CommandError> {
    let output = runner.run_in(dir, program, args).await?;
    if output.is_success() {
        Ok(output)
    } else {
        Err(CommandError::failed(program, &output))
    }
}

/// Converts string slices into an owned argument vector.
#[must_use]
pub fn args<const N: usize>(values: [&str; N]) -> Vec<OsString> {
    values.into_iter().map(OsString::from).collect()
}

/// Real command runner that shells out to the host operating system.
///
/// Every line the child prints is forwarded to the `debug` log level as it
/// arrives, so long-running host commands show up in the target log.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run_in<'a>(
        &'a self,
        dir: Option<&'a Utf8Path>,
        program: &'a str,
        args: &'a [OsString],
    ) -> RunnerFuture<'a> {
        Box::pin(async move {
            let spawn_error = |err: std::io::Error| CommandError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            };

            let mut command = Command::new(program);
            command
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            if let Some(path) = dir {
                command.current_dir(path);
            }
            debug!(program, ?args, dir = ?dir, "launching host command");

            let mut child = command.spawn().map_err(spawn_error)?;
            let stdout = child.stdout.take();
            let stderr = child.stderr.take();

            let (stdout_text, stderr_text) =
                tokio::join!(collect_lines(stdout), collect_lines(stderr));
            let status = child.wait().await.map_err(spawn_error)?;

            Ok(CommandOutput {
                code: status.code(),
                stdout: stdout_text,
                stderr: stderr_text,
            })
        })
    }
}

async fn collect_lines<R>(stream: Option<R>) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = stream else {
        return String::new();
    };

    let mut lines = BufReader::new(reader).lines();
    let mut captured = Vec::new();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!("{line}");
                captured.push(line);
            }
            Ok(None) => break,
            Err(err) => {
                debug!(error = %err, "stopped reading command output");
                break;
            }
        }
    }

    captured.join("\n")
}
