//! Byte transports underneath [`super::RemoteShellSession`].
//!
//! The session only needs an ordered duplex byte stream. [`SshConnector`]
//! provides one by driving the system `ssh` client with a forced TTY;
//! tests substitute an in-memory shell through the same [`Connector`] seam.

use std::ffi::OsString;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::instrument::WithSubscriber;
use tracing::{debug, warn};

use crate::config::SshConfig;

/// Future returned by transport operations.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = io::Result<T>> + Send + 'a>>;

/// Public-key algorithm negotiation policy for a connection attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AlgorithmPolicy {
    /// Disables the `rsa-sha2-256` and `rsa-sha2-512` signature algorithms,
    /// which some older lab servers advertise but reject.
    Restricted,
    /// Leaves algorithm negotiation to the client defaults.
    Relaxed,
}

/// Where and as whom to open a session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Credentials {
    /// Host name or IP address of the remote machine.
    pub address: String,
    /// Login user.
    pub user: String,
    /// SSH port.
    pub port: u16,
}

impl Credentials {
    /// Builds credentials for the default SSH port.
    #[must_use]
    pub fn new(address: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            user: user.into(),
            port: 22,
        }
    }

    /// Overrides the SSH port.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Renders `user@address`.
    #[must_use]
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.address)
    }
}

/// Ordered duplex byte stream to an interactive remote shell.
pub trait ShellTransport: Send {
    /// Writes all of `data`.
    fn send<'a>(&'a mut self, data: &'a [u8]) -> TransportFuture<'a, ()>;

    /// Reads the next chunk into `buf`, returning `0` at end of stream.
    fn recv<'a>(&'a mut self, buf: &'a mut [u8]) -> TransportFuture<'a, usize>;

    /// Tears the stream down.
    fn close(&mut self) -> TransportFuture<'_, ()>;
}

/// Opens transports to remote machines.
pub trait Connector: Send + Sync {
    /// Transport produced by a successful connection.
    type Transport: ShellTransport + 'static;

    /// Opens a transport using the requested algorithm policy.
    fn connect<'a>(
        &'a self,
        credentials: &'a Credentials,
        policy: AlgorithmPolicy,
    ) -> TransportFuture<'a, Self::Transport>;
}

/// Expands a leading `~/` prefix to the user's home directory.
///
/// Without a `HOME` variable the input is returned unchanged.
///
/// # Examples
///
/// ```
/// # use buildfleet::shell::expand_tilde;
/// let home = std::env::var("HOME").expect("HOME should be set");
/// assert_eq!(expand_tilde("~/.ssh/id_ed25519"), format!("{home}/.ssh/id_ed25519"));
/// assert_eq!(expand_tilde("/absolute/path"), "/absolute/path");
/// ```
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

/// SSH options shared by interactive sessions and rsync's remote shell.
pub(crate) fn common_ssh_options(config: &SshConfig, port: u16) -> Vec<OsString> {
    let mut args = vec![OsString::from("-p"), OsString::from(port.to_string())];

    if let Some(ref identity_file) = config.ssh_identity_file {
        args.push(OsString::from("-i"));
        args.push(OsString::from(expand_tilde(identity_file)));
    }

    if config.ssh_batch_mode {
        args.push(OsString::from("-o"));
        args.push(OsString::from("BatchMode=yes"));
    }

    if !config.ssh_strict_host_key_checking {
        args.push(OsString::from("-o"));
        args.push(OsString::from("StrictHostKeyChecking=no"));
    }

    if !config.ssh_known_hosts_file.trim().is_empty() {
        args.push(OsString::from("-o"));
        args.push(OsString::from(format!(
            "UserKnownHostsFile={}",
            config.ssh_known_hosts_file
        )));
    }

    args
}

/// Connector spawning the system `ssh` client.
#[derive(Clone, Debug)]
pub struct SshConnector {
    config: SshConfig,
}

impl SshConnector {
    /// Creates a connector using the given SSH settings.
    #[must_use]
    pub const fn new(config: SshConfig) -> Self {
        Self { config }
    }

    /// Builds the `ssh` argument list for an interactive session.
    #[must_use]
    pub fn session_args(&self, credentials: &Credentials, policy: AlgorithmPolicy) -> Vec<OsString> {
        let mut args = vec![OsString::from("-tt")];
        args.extend(common_ssh_options(&self.config, credentials.port));
        if policy == AlgorithmPolicy::Restricted {
            args.push(OsString::from("-o"));
            args.push(OsString::from(
                "PubkeyAcceptedAlgorithms=-rsa-sha2-256,rsa-sha2-512",
            ));
        }
        args.push(OsString::from(credentials.destination()));
        args
    }
}

impl Connector for SshConnector {
    type Transport = SshTransport;

    fn connect<'a>(
        &'a self,
        credentials: &'a Credentials,
        policy: AlgorithmPolicy,
    ) -> TransportFuture<'a, Self::Transport> {
        Box::pin(async move {
            let args = self.session_args(credentials, policy);
            debug!(address = %credentials.address, ?policy, "opening ssh session");

            let mut child = Command::new(&self.config.ssh_bin)
                .args(&args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()?;

            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| io::Error::other("ssh stdin was not captured"))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| io::Error::other("ssh stdout was not captured"))?;
            if let Some(stderr) = child.stderr.take() {
                let address = credentials.address.clone();
                tokio::spawn(
                    async move {
                        let mut lines = BufReader::new(stderr).lines();
                        while let Ok(Some(line)) = lines.next_line().await {
                            warn!(%address, "ssh: {line}");
                        }
                    }
                    .with_current_subscriber(),
                );
            }

            Ok(SshTransport {
                child,
                stdin,
                stdout,
            })
        })
    }
}

/// Interactive `ssh` child process.
#[derive(Debug)]
pub struct SshTransport {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl ShellTransport for SshTransport {
    fn send<'a>(&'a mut self, data: &'a [u8]) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            self.stdin.write_all(data).await?;
            self.stdin.flush().await
        })
    }

    fn recv<'a>(&'a mut self, buf: &'a mut [u8]) -> TransportFuture<'a, usize> {
        Box::pin(self.stdout.read(buf))
    }

    fn close(&mut self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.child.start_kill()?;
            self.child.wait().await.map(|_| ())
        })
    }
}
