//! Power control for lifecycle-managed machines.

use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::process::{CommandOutput, CommandRunner};

/// Observed power state of a guest.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PowerState {
    /// The guest is up.
    Running,
    /// The guest is down (or its state is unknown).
    Stopped,
}

/// Errors raised by [`PowerControl`] implementations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PowerError {
    /// The guest id could not be derived from the target address.
    #[error("cannot derive a guest id from address {address}")]
    GuestId {
        /// Offending address.
        address: String,
    },
    /// The hypervisor rejected (or never received) a power command.
    #[error("failed to {action} guest for {address}: {message}")]
    Command {
        /// Power action attempted.
        action: String,
        /// Target address.
        address: String,
        /// Captured failure detail.
        message: String,
    },
}

/// Future returned by [`PowerControl`] operations.
pub type PowerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, PowerError>> + Send + 'a>>;

/// Starts, stops and inspects the guest serving a target address.
pub trait PowerControl: Send + Sync {
    /// Reports whether the guest is running.
    fn status<'a>(&'a self, address: &'a str) -> PowerFuture<'a, PowerState>;

    /// Boots the guest.
    fn start<'a>(&'a self, address: &'a str) -> PowerFuture<'a, ()>;

    /// Shuts the guest down.
    fn stop<'a>(&'a self, address: &'a str) -> PowerFuture<'a, ()>;
}

/// Proxmox hypervisor reached over SSH.
///
/// The guest id is the last octet of the target address. Proxmox manages
/// virtual machines (`qm`) and containers (`pct`) separately, and the id
/// belongs to exactly one of them, so every action is issued through both
/// tools and succeeds when either does.
#[derive(Clone)]
pub struct ProxmoxControl {
    host: String,
    user: String,
    ssh_bin: String,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for ProxmoxControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxmoxControl")
            .field("host", &self.host)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl ProxmoxControl {
    /// Creates a controller for the hypervisor at `host`.
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        user: impl Into<String>,
        ssh_bin: impl Into<String>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            ssh_bin: ssh_bin.into(),
            runner,
        }
    }

    /// Derives the guest id from the last octet of `address`.
    ///
    /// # Errors
    ///
    /// Returns [`PowerError::GuestId`] when the last dot-separated component
    /// is not numeric.
    pub fn guest_id(address: &str) -> Result<u32, PowerError> {
        address
            .rsplit('.')
            .next()
            .and_then(|octet| octet.parse().ok())
            .ok_or_else(|| PowerError::GuestId {
                address: address.to_owned(),
            })
    }

    async fn remote(&self, command: String) -> Result<CommandOutput, String> {
        let args = vec![
            OsString::from(format!("{}@{}", self.user, self.host)),
            OsString::from(command),
        ];
        self.runner
            .run(&self.ssh_bin, &args)
            .await
            .map_err(|err| err.to_string())
    }

    /// Issues `<tool> <verb> <id>` through both `qm` and `pct`.
    async fn both(&self, verb: &str, address: &str) -> Result<(), PowerError> {
        let id = Self::guest_id(address)?;
        let mut failures = Vec::new();
        let mut succeeded = false;
        for tool in ["qm", "pct"] {
            match self.remote(format!("{tool} {verb} {id}")).await {
                Ok(output) if output.is_success() => succeeded = true,
                Ok(output) => failures.push(format!(
                    "{tool} exited with status {}: {}",
                    output.status_text(),
                    output.stderr.trim()
                )),
                Err(message) => failures.push(message),
            }
        }

        if succeeded {
            Ok(())
        } else {
            Err(PowerError::Command {
                action: verb.to_owned(),
                address: address.to_owned(),
                message: failures.join("; "),
            })
        }
    }
}

impl PowerControl for ProxmoxControl {
    fn status<'a>(&'a self, address: &'a str) -> PowerFuture<'a, PowerState> {
        Box::pin(async move {
            let id = Self::guest_id(address)?;
            let mut report = String::new();
            for tool in ["qm", "pct"] {
                match self.remote(format!("{tool} status {id}")).await {
                    Ok(output) => {
                        report.push_str(&output.stdout);
                        report.push('\n');
                    }
                    Err(message) => {
                        return Err(PowerError::Command {
                            action: String::from("query"),
                            address: address.to_owned(),
                            message,
                        });
                    }
                }
            }
            debug!(address, status = report.trim(), "guest status");
            if report.contains("running") {
                Ok(PowerState::Running)
            } else {
                Ok(PowerState::Stopped)
            }
        })
    }

    fn start<'a>(&'a self, address: &'a str) -> PowerFuture<'a, ()> {
        Box::pin(async move {
            info!(address, host = %self.host, "starting guest");
            self.both("start", address).await
        })
    }

    fn stop<'a>(&'a self, address: &'a str) -> PowerFuture<'a, ()> {
        Box::pin(async move {
            info!(address, host = %self.host, "shutting guest down");
            self.both("shutdown", address).await
        })
    }
}
