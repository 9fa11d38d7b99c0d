//! Exclusive leases on shared build machines.
//!
//! Several build targets may share one physical or virtual machine. A
//! [`Machine`] serialises them behind an async mutex and, when it carries a
//! [`PowerControl`], boots the guest on acquisition and shuts it down on
//! release. Only the lease that actually booted the guest stops it again, so
//! a machine somebody else left running stays running.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

mod power;
mod probe;

pub use power::{PowerControl, PowerError, PowerFuture, PowerState, ProxmoxControl};
pub use probe::{PingProbe, ProbeFuture, Reachability, TcpProbe};

/// Default interval between reachability probes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Errors raised while acquiring or releasing a lease.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LeaseError {
    /// A power command failed.
    #[error("power control for machine {machine} failed: {source}")]
    Power {
        /// Machine name.
        machine: String,
        /// Underlying failure.
        #[source]
        source: PowerError,
    },
    /// The address did not reach the wanted state within the configured
    /// reachability timeout.
    #[error("{address} on machine {machine} did not become {wanted} within {waited:?}")]
    Unavailable {
        /// Machine name.
        machine: String,
        /// Target address.
        address: String,
        /// `reachable` or `unreachable`.
        wanted: String,
        /// Time spent polling.
        waited: Duration,
    },
}

/// A shared machine and its power lifecycle policy.
pub struct Machine {
    name: String,
    lock: Mutex<()>,
    power: Option<Arc<dyn PowerControl>>,
    probe: Arc<dyn Reachability>,
    poll_interval: Duration,
    reach_timeout: Option<Duration>,
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("name", &self.name)
            .field("managed", &self.is_managed())
            .field("poll_interval", &self.poll_interval)
            .field("reach_timeout", &self.reach_timeout)
            .finish_non_exhaustive()
    }
}

impl Machine {
    /// Creates an always-on machine.
    #[must_use]
    pub fn new(name: impl Into<String>, probe: Arc<dyn Reachability>) -> Self {
        Self {
            name: name.into(),
            lock: Mutex::new(()),
            power: None,
            probe,
            poll_interval: DEFAULT_POLL_INTERVAL,
            reach_timeout: None,
        }
    }

    /// Makes the machine lifecycle-managed: started on acquire, stopped on
    /// release.
    #[must_use]
    pub fn with_power(mut self, power: Arc<dyn PowerControl>) -> Self {
        self.power = Some(power);
        self
    }

    /// Overrides the interval between reachability probes.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Bounds reachability polling; `None` polls indefinitely.
    #[must_use]
    pub const fn with_reachability_timeout(mut self, limit: Option<Duration>) -> Self {
        self.reach_timeout = limit;
        self
    }

    /// Machine name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the machine has a power lifecycle.
    #[must_use]
    pub const fn is_managed(&self) -> bool {
        self.power.is_some()
    }

    /// Whether a lease currently holds the machine.
    #[must_use]
    pub fn is_leased(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    /// Waits for exclusive use of the machine on behalf of `address`.
    ///
    /// For a managed machine the guest is started unless it already runs,
    /// and the call returns only once `address` answers the reachability
    /// probe.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Power`] when a power command fails and
    /// [`LeaseError::Unavailable`] when a configured reachability timeout
    /// expires. The lock is released in both cases.
    pub async fn acquire(&self, address: &str) -> Result<Lease<'_>, LeaseError> {
        let guard = self.lock.lock().await;
        debug!(machine = %self.name, address, "machine locked");

        let Some(power) = self.power.as_ref() else {
            return Ok(Lease {
                machine: self,
                address: address.to_owned(),
                owning: false,
                _guard: guard,
            });
        };

        let owning = match power.status(address).await.map_err(|err| self.power_error(err))? {
            PowerState::Running => {
                info!(machine = %self.name, address, "guest already running; lease will leave it up");
                false
            }
            PowerState::Stopped => {
                power
                    .start(address)
                    .await
                    .map_err(|err| self.power_error(err))?;
                true
            }
        };

        if let Err(err) = self.wait_for(address, true).await {
            if owning && let Err(stop_err) = power.stop(address).await {
                warn!(machine = %self.name, address, error = %stop_err, "failed to stop unreachable guest");
            }
            return Err(err);
        }

        info!(machine = %self.name, address, "machine ready");
        Ok(Lease {
            machine: self,
            address: address.to_owned(),
            owning,
            _guard: guard,
        })
    }

    /// Runs `body` while holding a lease, releasing it on every exit path.
    ///
    /// When `body` fails, a release failure is logged and the body's error
    /// is returned; otherwise a release failure is the result.
    ///
    /// # Errors
    ///
    /// Returns the acquisition error, the body's error, or the release
    /// error, converted into `E`.
    pub async fn with_lease<T, E, F, Fut>(&self, address: &str, body: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LeaseError> + Display,
    {
        let lease = self.acquire(address).await?;
        let outcome = body().await;
        let released = lease.release().await;

        match (outcome, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(release_err)) => Err(E::from(release_err)),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(release_err)) => {
                error!(
                    machine = %self.name,
                    address,
                    error = %release_err,
                    "failed to release machine after error: {err}"
                );
                Err(err)
            }
        }
    }

    async fn wait_for(&self, address: &str, reachable: bool) -> Result<(), LeaseError> {
        let started = Instant::now();
        loop {
            if self.probe.is_reachable(address).await == reachable {
                return Ok(());
            }
            if let Some(limit) = self.reach_timeout
                && started.elapsed() >= limit
            {
                return Err(LeaseError::Unavailable {
                    machine: self.name.clone(),
                    address: address.to_owned(),
                    wanted: String::from(if reachable { "reachable" } else { "unreachable" }),
                    waited: started.elapsed(),
                });
            }
            debug!(machine = %self.name, address, reachable, "waiting for {address}");
            sleep(self.poll_interval).await;
        }
    }

    fn power_error(&self, source: PowerError) -> LeaseError {
        LeaseError::Power {
            machine: self.name.clone(),
            source,
        }
    }
}

/// Exclusive hold on a [`Machine`] for one target address.
///
/// Dropping a lease without [`Lease::release`] frees the lock but leaves the
/// guest running.
#[derive(Debug)]
pub struct Lease<'m> {
    machine: &'m Machine,
    address: String,
    owning: bool,
    _guard: MutexGuard<'m, ()>,
}

impl Lease<'_> {
    /// Whether this lease booted the guest and will stop it on release.
    #[must_use]
    pub const fn is_owning(&self) -> bool {
        self.owning
    }

    /// Address the lease was taken for.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Stops the guest (for an owning lease), waits until the address stops
    /// answering, then frees the lock.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Power`] when the stop command fails and
    /// [`LeaseError::Unavailable`] when a configured timeout expires while
    /// waiting for the guest to go down. The lock is freed either way.
    pub async fn release(self) -> Result<(), LeaseError> {
        let machine = self.machine;
        if self.owning
            && let Some(power) = machine.power.as_ref()
        {
            power
                .stop(&self.address)
                .await
                .map_err(|err| machine.power_error(err))?;
            machine.wait_for(&self.address, false).await?;
        }
        debug!(machine = %machine.name, address = %self.address, "machine released");
        Ok(())
    }
}

#[cfg(test)]
mod tests;
