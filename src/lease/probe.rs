//! Network reachability probes.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::process::{CommandRunner, args};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Future returned by [`Reachability::is_reachable`].
pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// Answers whether an address currently responds.
pub trait Reachability: Send + Sync {
    /// Probes `address` once.
    fn is_reachable<'a>(&'a self, address: &'a str) -> ProbeFuture<'a>;
}

/// Treats an address as reachable once a TCP connection to `port` opens.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TcpProbe {
    port: u16,
}

impl TcpProbe {
    /// Probes the given port.
    #[must_use]
    pub const fn new(port: u16) -> Self {
        Self { port }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(22)
    }
}

impl Reachability for TcpProbe {
    fn is_reachable<'a>(&'a self, address: &'a str) -> ProbeFuture<'a> {
        Box::pin(async move {
            let connect = timeout(CONNECT_TIMEOUT, TcpStream::connect((address, self.port))).await;
            matches!(connect, Ok(Ok(_)))
        })
    }
}

/// Sends a single ICMP echo with the system `ping`.
#[derive(Clone)]
pub struct PingProbe {
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for PingProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PingProbe").finish_non_exhaustive()
    }
}

impl PingProbe {
    /// Creates a probe running `ping` through `runner`.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl Reachability for PingProbe {
    fn is_reachable<'a>(&'a self, address: &'a str) -> ProbeFuture<'a> {
        Box::pin(async move {
            self.runner
                .run("ping", &args(["-c", "1", address]))
                .await
                .is_ok_and(|output| output.is_success())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_probe_detects_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();

        assert!(TcpProbe::new(port).is_reachable("127.0.0.1").await);
    }

    #[tokio::test]
    async fn tcp_probe_reports_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        drop(listener);

        assert!(!TcpProbe::new(port).is_reachable("127.0.0.1").await);
    }

    #[tokio::test]
    async fn ping_probe_follows_exit_status() {
        let runner = ScriptedRunner::new();
        runner.push_success();
        runner.push_failure(1);
        let probe = PingProbe::new(Arc::new(runner.clone()));

        assert!(probe.is_reachable("10.0.0.9").await);
        assert!(!probe.is_reachable("10.0.0.9").await);
        assert_eq!(
            runner
                .invocations()
                .first()
                .map(crate::test_support::CommandInvocation::command_string),
            Some(String::from("ping -c 1 10.0.0.9"))
        );
    }
}
