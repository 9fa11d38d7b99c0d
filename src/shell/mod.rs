//! Interactive remote shell sessions with sentinel-based completion
//! detection.
//!
//! A [`RemoteShellSession`] keeps one interactive shell open per target.
//! Each command is followed by an `echo` of a per-session sentinel; the
//! command is finished once the rendered sentinel value shows up in the
//! assembled line stream. The echoed sentinel command itself is rewritten to
//! [`END_MARKER`] first so the terminal echo is never mistaken for output.

use std::io;
use std::time::Duration;

use camino::Utf8Path;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::config::SshConfig;
use crate::transfer::{Direction, Rsync, TransferError};

mod error;
mod stream;
mod transport;

pub use error::ShellError;
pub use stream::{END_MARKER, LineAssembler, Sentinel, strip_control_sequences};
pub(crate) use transport::common_ssh_options;
pub use transport::{
    AlgorithmPolicy, Connector, Credentials, ShellTransport, SshConnector, SshTransport,
    TransportFuture, expand_tilde,
};

const READ_CHUNK: usize = 4096;

/// Lifecycle state of a session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    /// No transport is open.
    Disconnected,
    /// A transport is being opened and the handshake is running.
    Connecting,
    /// The session is idle and accepts commands.
    Ready,
    /// A command is running.
    Executing,
}

/// Timing and dialect settings for a session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionOptions {
    /// Idle time that ends the startup banner drain.
    pub banner_idle: Duration,
    /// Idle time that ends a command wait; `None` waits indefinitely.
    pub command_idle: Option<Duration>,
    /// Interpreter launched after login, for hosts whose login shell is not
    /// the one commands are written for.
    pub default_shell: Option<String>,
}

impl SessionOptions {
    /// Derives options from the SSH configuration.
    #[must_use]
    pub const fn from_config(config: &SshConfig) -> Self {
        Self {
            banner_idle: config.banner_idle(),
            command_idle: config.command_idle(),
            default_shell: None,
        }
    }

    /// Sets the interpreter launched after login.
    #[must_use]
    pub fn with_default_shell(mut self, shell: Option<String>) -> Self {
        self.default_shell = shell;
        self
    }
}

/// Captured output of one command (or one batch).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ShellOutput {
    /// Output lines joined by `\n`, without the echoed command, the
    /// end-of-command marker or the sentinel line.
    pub text: String,
    /// `false` when the sentinel never arrived (idle timeout or end of
    /// stream); the text is then a partial result.
    pub complete: bool,
}

#[derive(Debug, Default)]
struct ReadOutcome {
    lines: Vec<String>,
    complete: bool,
    closed: bool,
}

/// Persistent interactive session to one remote host.
pub struct RemoteShellSession<C: Connector> {
    connector: C,
    credentials: Credentials,
    options: SessionOptions,
    transfer: Rsync,
    sentinel: Sentinel,
    assembler: LineAssembler,
    transport: Option<C::Transport>,
    state: SessionState,
}

impl<C: Connector> RemoteShellSession<C> {
    /// Creates a disconnected session. Nothing is opened until the first
    /// command or an explicit [`Self::connect`].
    #[must_use]
    pub fn new(
        connector: C,
        credentials: Credentials,
        options: SessionOptions,
        transfer: Rsync,
    ) -> Self {
        let assembler = LineAssembler::new(credentials.address.clone());
        Self {
            connector,
            credentials,
            options,
            transfer,
            sentinel: Sentinel::generate(),
            assembler,
            transport: None,
            state: SessionState::Disconnected,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Remote host credentials.
    #[must_use]
    pub const fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Opens (or reopens) the transport and runs the startup handshake.
    ///
    /// The first attempt uses [`AlgorithmPolicy::Restricted`]; any failure is
    /// retried once with [`AlgorithmPolicy::Relaxed`].
    ///
    /// # Errors
    ///
    /// Returns [`ShellError::Connection`] when both attempts fail.
    pub async fn connect(&mut self) -> Result<(), ShellError> {
        self.close().await;
        self.state = SessionState::Connecting;
        debug!(address = %self.credentials.address, "connecting");

        let transport = match self.attempt(AlgorithmPolicy::Restricted).await {
            Ok(transport) => transport,
            Err(err) => {
                warn!(
                    address = %self.credentials.address,
                    error = %err,
                    "connection failed, retrying with relaxed algorithm negotiation"
                );
                match self.attempt(AlgorithmPolicy::Relaxed).await {
                    Ok(transport) => transport,
                    Err(retry_err) => {
                        self.state = SessionState::Disconnected;
                        return Err(retry_err);
                    }
                }
            }
        };

        self.transport = Some(transport);
        self.state = SessionState::Ready;
        Ok(())
    }

    /// Runs one command and returns its captured output.
    ///
    /// With `reset_connection` the session reconnects first; otherwise the
    /// live session is reused (and opened if none exists yet). A missing
    /// sentinel is logged at error level and reported through
    /// [`ShellOutput::complete`] rather than as an error; the transport is
    /// then dropped so a late sentinel cannot end the next command early.
    ///
    /// # Errors
    ///
    /// Returns [`ShellError::Connection`] when a required connect fails and
    /// [`ShellError::Io`] when the transport breaks mid-command.
    pub async fn run(
        &mut self,
        command: &str,
        reset_connection: bool,
    ) -> Result<ShellOutput, ShellError> {
        if reset_connection || self.transport.is_none() {
            self.connect().await?;
        }
        let Some(mut transport) = self.transport.take() else {
            return Err(ShellError::Closed {
                address: self.credentials.address.clone(),
            });
        };

        self.state = SessionState::Executing;
        debug!(address = %self.credentials.address, command, "launching command");
        let sent = command.replace('\\', "\\\\");
        let outcome = match self.execute(&mut transport, &sent).await {
            Ok(outcome) => outcome,
            Err(err) => {
                close_quietly(&mut transport, &self.credentials.address).await;
                self.state = SessionState::Disconnected;
                return Err(ShellError::Io {
                    address: self.credentials.address.clone(),
                    message: err.to_string(),
                });
            }
        };

        if outcome.closed || !outcome.complete {
            close_quietly(&mut transport, &self.credentials.address).await;
            self.state = SessionState::Disconnected;
        } else {
            self.transport = Some(transport);
            self.state = SessionState::Ready;
        }

        if !outcome.complete {
            error!(
                address = %self.credentials.address,
                command,
                "no completion marker received; returning partial output"
            );
        }
        debug!(address = %self.credentials.address, "done launching command");

        Ok(ShellOutput {
            text: command_text(&outcome.lines, &sent),
            complete: outcome.complete,
        })
    }

    /// Runs `commands` in order over one live session, reconnecting only
    /// before the first, and concatenates their outputs.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first [`ShellError`].
    pub async fn run_batch<S: AsRef<str>>(
        &mut self,
        commands: &[S],
    ) -> Result<ShellOutput, ShellError> {
        let mut texts = Vec::with_capacity(commands.len());
        let mut complete = true;
        for (index, command) in commands.iter().enumerate() {
            let output = self.run(command.as_ref(), index == 0).await?;
            complete &= output.complete;
            texts.push(output.text);
        }
        Ok(ShellOutput {
            text: texts.join("\n"),
            complete,
        })
    }

    /// Copies a local path to the remote host with a local `rsync`.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError`] when `rsync` fails.
    pub async fn copy_to_remote(
        &mut self,
        local: &Utf8Path,
        remote: &str,
    ) -> Result<(), TransferError> {
        self.transfer
            .copy(&self.credentials, Direction::Upload, local, remote)
            .await
    }

    /// Copies a remote path to the controlling host with a local `rsync`.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError`] when `rsync` fails.
    pub async fn copy_from_remote(
        &mut self,
        remote: &str,
        local: &Utf8Path,
    ) -> Result<(), TransferError> {
        self.transfer
            .copy(&self.credentials, Direction::Download, local, remote)
            .await
    }

    /// Runs an `rsync` between the session host and `peer` by typing the
    /// invocation into this session. `local` is a path on the session host.
    ///
    /// # Errors
    ///
    /// Returns [`ShellError`] when the command cannot be run; the caller
    /// inspects the returned output for `rsync` failures.
    pub async fn copy_over_session(
        &mut self,
        peer: &Credentials,
        direction: Direction,
        local: &Utf8Path,
        remote: &str,
    ) -> Result<ShellOutput, ShellError> {
        let line = self.transfer.command_line(peer, direction, local, remote);
        self.run(&line, false).await
    }

    /// Closes the live transport, if any.
    pub async fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            close_quietly(&mut transport, &self.credentials.address).await;
        }
        self.state = SessionState::Disconnected;
    }

    async fn attempt(&mut self, policy: AlgorithmPolicy) -> Result<C::Transport, ShellError> {
        let mut transport = self
            .connector
            .connect(&self.credentials, policy)
            .await
            .map_err(|err| self.connection_error(err.to_string()))?;

        match self.handshake(&mut transport).await {
            Ok(()) => Ok(transport),
            Err(err) => {
                close_quietly(&mut transport, &self.credentials.address).await;
                Err(err)
            }
        }
    }

    async fn handshake(&mut self, transport: &mut C::Transport) -> Result<(), ShellError> {
        let banner = read_lines(
            transport,
            &mut self.assembler,
            None,
            Some(self.options.banner_idle),
        )
        .await
        .map_err(|err| self.connection_error(err.to_string()))?;
        if banner.closed {
            return Err(self.connection_error(String::from(
                "session closed while draining the startup banner",
            )));
        }

        self.await_sentinel(transport).await?;

        if let Some(shell) = self.options.default_shell.clone() {
            debug!(address = %self.credentials.address, shell, "launching default shell");
            send_line(transport, &shell.replace('\\', "\\\\"))
                .await
                .map_err(|err| self.connection_error(err.to_string()))?;
            self.await_sentinel(transport).await?;
        }
        Ok(())
    }

    async fn await_sentinel(&mut self, transport: &mut C::Transport) -> Result<(), ShellError> {
        send_line(transport, self.sentinel.command())
            .await
            .map_err(|err| self.connection_error(err.to_string()))?;
        let outcome = read_lines(
            transport,
            &mut self.assembler,
            Some(&self.sentinel),
            self.options.command_idle,
        )
        .await
        .map_err(|err| self.connection_error(err.to_string()))?;

        if outcome.complete {
            Ok(())
        } else if outcome.closed {
            Err(self.connection_error(String::from("session closed during handshake")))
        } else {
            Err(self.connection_error(String::from(
                "no completion marker received during handshake",
            )))
        }
    }

    async fn execute(
        &mut self,
        transport: &mut C::Transport,
        sent: &str,
    ) -> io::Result<ReadOutcome> {
        send_line(transport, sent).await?;
        send_line(transport, self.sentinel.command()).await?;
        read_lines(
            transport,
            &mut self.assembler,
            Some(&self.sentinel),
            self.options.command_idle,
        )
        .await
    }

    fn connection_error(&self, message: String) -> ShellError {
        ShellError::Connection {
            address: self.credentials.address.clone(),
            message,
        }
    }
}

async fn send_line<T: ShellTransport + ?Sized>(transport: &mut T, line: &str) -> io::Result<()> {
    let mut payload = Vec::with_capacity(line.len() + 2);
    payload.extend_from_slice(line.as_bytes());
    payload.extend_from_slice(b"\r\n");
    transport.send(&payload).await
}

/// Reads until the sentinel is seen, the stream ends, or `idle` elapses
/// without data.
async fn read_lines<T: ShellTransport + ?Sized>(
    transport: &mut T,
    assembler: &mut LineAssembler,
    sentinel: Option<&Sentinel>,
    idle: Option<Duration>,
) -> io::Result<ReadOutcome> {
    assembler.reset();
    let mut buf = [0_u8; READ_CHUNK];
    let mut closed = false;

    loop {
        let received = match idle {
            Some(limit) => match timeout(limit, transport.recv(&mut buf)).await {
                Ok(result) => result?,
                Err(_elapsed) => break,
            },
            None => transport.recv(&mut buf).await?,
        };
        if received == 0 {
            closed = true;
            break;
        }
        if assembler.push(buf.get(..received).unwrap_or_default(), sentinel) {
            break;
        }
    }

    let assembled = assembler.finish();
    Ok(ReadOutcome {
        lines: assembled.lines,
        complete: assembled.complete,
        closed,
    })
}

async fn close_quietly<T: ShellTransport + ?Sized>(transport: &mut T, address: &str) {
    if let Err(err) = transport.close().await {
        debug!(address, error = %err, "error while closing session");
    }
}

/// Drops the terminal echo of the sent command and end-of-command marker
/// lines from the captured lines.
fn command_text(lines: &[String], sent: &str) -> String {
    let echoed = sent.trim_end();
    let mut echo_seen = false;
    lines
        .iter()
        .filter(|line| {
            if !echo_seen && !echoed.is_empty() && line.trim_end().ends_with(echoed) {
                echo_seen = true;
                return false;
            }
            !line.contains(END_MARKER)
        })
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests;
