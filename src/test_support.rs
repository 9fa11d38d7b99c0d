//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::env;
use std::ffi::OsString;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use tokio::sync::{Mutex, MutexGuard};

use crate::config::FleetConfig;
use crate::fs;
use crate::lease::{PowerControl, PowerError, PowerFuture, PowerState, ProbeFuture, Reachability};
use crate::process::{CommandError, CommandOutput, CommandRunner, RunnerFuture};
use crate::repository::{PackageRepository, RepositoryFuture};
use crate::shell::{AlgorithmPolicy, Connector, Credentials, ShellTransport, TransportFuture};
use crate::vcs::{Snapshot, Update, VcsError, VcsFuture, VersionControl};

type Shared<T> = Arc<std::sync::Mutex<T>>;

fn locked<T>(shared: &Shared<T>) -> std::sync::MutexGuard<'_, T> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
/// Once the queue is empty the runner reports a spawn failure, unless it was
/// created with [`ScriptedRunner::succeeding`].
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Shared<VecDeque<CommandOutput>>,
    invocations: Shared<Vec<CommandInvocation>>,
    succeed_when_empty: bool,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Working directory, when one was requested.
    pub dir: Option<Utf8PathBuf>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a runner that answers unscripted invocations with success.
    #[must_use]
    pub fn succeeding() -> Self {
        Self {
            succeed_when_empty: true,
            ..Self::default()
        }
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        locked(&self.invocations).clone()
    }

    /// Returns the recorded invocations rendered as command strings.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.invocations()
            .iter()
            .map(CommandInvocation::command_string)
            .collect()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        locked(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run_in<'a>(
        &'a self,
        dir: Option<&'a Utf8Path>,
        program: &'a str,
        args: &'a [OsString],
    ) -> RunnerFuture<'a> {
        locked(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
            dir: dir.map(Utf8Path::to_path_buf),
        });
        let next = locked(&self.responses).pop_front();
        let result = match next {
            Some(output) => Ok(output),
            None if self.succeed_when_empty => Ok(CommandOutput {
                code: Some(0),
                ..CommandOutput::default()
            }),
            None => Err(CommandError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            }),
        };
        Box::pin(async move { result })
    }
}

#[derive(Debug, Default)]
struct ShellScript {
    banner: String,
    chunk_size: Option<usize>,
    failing_connects: usize,
    hanging_up: usize,
    stall_on: Option<String>,
    responses: HashMap<String, String>,
    policies: Vec<AlgorithmPolicy>,
    received: Vec<String>,
    connects: usize,
}

/// In-memory interactive shell used as a [`Connector`].
///
/// Every received line is echoed back like a terminal would, followed by
/// the scripted response for that exact line (or, for `echo <text>`, the
/// text itself) and a `$ ` prompt.
#[derive(Clone, Debug)]
pub struct ScriptedShell {
    script: Shared<ShellScript>,
}

impl Default for ScriptedShell {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedShell {
    /// Creates a shell with a short login banner.
    #[must_use]
    pub fn new() -> Self {
        Self {
            script: Arc::new(std::sync::Mutex::new(ShellScript {
                banner: String::from("Welcome to the build host\r\nLast login: never\r\n$ "),
                ..ShellScript::default()
            })),
        }
    }

    /// Replaces the login banner.
    #[must_use]
    pub fn with_banner(self, banner: impl Into<String>) -> Self {
        locked(&self.script).banner = banner.into();
        self
    }

    /// Delivers output in reads of at most `size` bytes.
    #[must_use]
    pub fn with_chunk_size(self, size: usize) -> Self {
        locked(&self.script).chunk_size = Some(size.max(1));
        self
    }

    /// Answers `command` with `output`.
    #[must_use]
    pub fn with_response(self, command: impl Into<String>, output: impl Into<String>) -> Self {
        locked(&self.script)
            .responses
            .insert(command.into(), output.into());
        self
    }

    /// Fails the first `count` connection attempts.
    #[must_use]
    pub fn failing_connects(self, count: usize) -> Self {
        locked(&self.script).failing_connects = count;
        self
    }

    /// Closes the first `count` opened transports before the banner.
    #[must_use]
    pub fn hanging_up_handshakes(self, count: usize) -> Self {
        locked(&self.script).hanging_up = count;
        self
    }

    /// Stops answering once `command` has produced its response.
    #[must_use]
    pub fn stalling_on(self, command: impl Into<String>) -> Self {
        locked(&self.script).stall_on = Some(command.into());
        self
    }

    /// Algorithm policies requested so far, including failed attempts.
    #[must_use]
    pub fn policies(&self) -> Vec<AlgorithmPolicy> {
        locked(&self.script).policies.clone()
    }

    /// Lines received across all transports.
    #[must_use]
    pub fn received(&self) -> Vec<String> {
        locked(&self.script).received.clone()
    }

    /// Number of transports opened successfully.
    #[must_use]
    pub fn connects(&self) -> usize {
        locked(&self.script).connects
    }
}

impl Connector for ScriptedShell {
    type Transport = ScriptedTransport;

    fn connect<'a>(
        &'a self,
        _credentials: &'a Credentials,
        policy: AlgorithmPolicy,
    ) -> TransportFuture<'a, Self::Transport> {
        let result = {
            let mut script = locked(&self.script);
            script.policies.push(policy);
            if script.failing_connects > 0 {
                script.failing_connects -= 1;
                Err(io::Error::other("scripted connection failure"))
            } else {
                script.connects += 1;
                let hang_up = script.hanging_up > 0;
                if hang_up {
                    script.hanging_up -= 1;
                }
                let output = if hang_up {
                    VecDeque::new()
                } else {
                    script.banner.bytes().collect()
                };
                Ok(ScriptedTransport {
                    script: Arc::clone(&self.script),
                    output,
                    input: Vec::new(),
                    closed: hang_up,
                    stalled: false,
                })
            }
        };
        Box::pin(async move { result })
    }
}

/// Transport produced by [`ScriptedShell`].
#[derive(Debug)]
pub struct ScriptedTransport {
    script: Shared<ShellScript>,
    output: VecDeque<u8>,
    input: Vec<u8>,
    closed: bool,
    stalled: bool,
}

impl ScriptedTransport {
    fn process(&mut self, line: &str) {
        let mut script = locked(&self.script);
        script.received.push(line.to_owned());
        if self.stalled {
            return;
        }

        let mut reply = format!("{line}\r\n");
        if let Some(response) = script.responses.get(line) {
            reply.push_str(response);
            reply.push_str("\r\n");
        } else if let Some(text) = line.strip_prefix("echo ") {
            let rendered = text
                .strip_prefix('\'')
                .and_then(|rest| rest.strip_suffix('\''))
                .unwrap_or(text);
            reply.push_str(rendered);
            reply.push_str("\r\n");
        }

        if script.stall_on.as_deref() == Some(line) {
            self.stalled = true;
        } else {
            reply.push_str("$ ");
        }
        self.output.extend(reply.bytes());
    }
}

impl ShellTransport for ScriptedTransport {
    fn send<'a>(&'a mut self, data: &'a [u8]) -> TransportFuture<'a, ()> {
        self.input.extend_from_slice(data);
        while let Some(position) = self.input.iter().position(|byte| *byte == b'\n') {
            let raw: Vec<u8> = self.input.drain(..=position).collect();
            let text = String::from_utf8_lossy(&raw);
            let line = text.trim_end_matches(['\r', '\n']).to_owned();
            self.process(&line);
        }
        Box::pin(async { Ok(()) })
    }

    fn recv<'a>(&'a mut self, buf: &'a mut [u8]) -> TransportFuture<'a, usize> {
        Box::pin(async move {
            if self.output.is_empty() {
                if self.closed {
                    return Ok(0);
                }
                std::future::pending::<()>().await;
            }
            let limit = locked(&self.script).chunk_size.unwrap_or(buf.len());
            let count = limit.min(buf.len()).min(self.output.len());
            for (slot, byte) in buf.iter_mut().zip(self.output.drain(..count)) {
                *slot = byte;
            }
            Ok(count)
        })
    }

    fn close(&mut self) -> TransportFuture<'_, ()> {
        self.closed = true;
        self.output.clear();
        Box::pin(async { Ok(()) })
    }
}

/// Power control double tracking the guest state and issued commands.
#[derive(Clone, Debug)]
pub struct FakePower {
    state: Shared<PowerState>,
    starts: Arc<AtomicUsize>,
    stops: Arc<AtomicUsize>,
    fail_start: bool,
}

impl FakePower {
    /// Creates a guest in the given state.
    #[must_use]
    pub fn new(state: PowerState) -> Self {
        Self {
            state: Arc::new(std::sync::Mutex::new(state)),
            starts: Arc::new(AtomicUsize::new(0)),
            stops: Arc::new(AtomicUsize::new(0)),
            fail_start: false,
        }
    }

    /// Makes every start command fail.
    #[must_use]
    pub const fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    /// Current guest state.
    #[must_use]
    pub fn state(&self) -> PowerState {
        *locked(&self.state)
    }

    /// Number of start commands issued.
    #[must_use]
    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Number of stop commands issued.
    #[must_use]
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl PowerControl for FakePower {
    fn status<'a>(&'a self, _address: &'a str) -> PowerFuture<'a, PowerState> {
        let state = self.state();
        Box::pin(async move { Ok(state) })
    }

    fn start<'a>(&'a self, address: &'a str) -> PowerFuture<'a, ()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let result = if self.fail_start {
            Err(PowerError::Command {
                action: String::from("start"),
                address: address.to_owned(),
                message: String::from("simulated failure"),
            })
        } else {
            *locked(&self.state) = PowerState::Running;
            Ok(())
        };
        Box::pin(async move { result })
    }

    fn stop<'a>(&'a self, _address: &'a str) -> PowerFuture<'a, ()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        *locked(&self.state) = PowerState::Stopped;
        Box::pin(async { Ok(()) })
    }
}

#[derive(Clone, Debug)]
enum ProbeFallback {
    Fixed(bool),
    Power(FakePower),
}

/// Reachability double answering from a script, then from a fallback.
#[derive(Clone, Debug)]
pub struct FakeProbe {
    script: Shared<VecDeque<bool>>,
    fallback: ProbeFallback,
    probes: Arc<AtomicUsize>,
}

impl FakeProbe {
    /// Always answers `reachable`.
    #[must_use]
    pub fn fixed(reachable: bool) -> Self {
        Self::with_fallback(ProbeFallback::Fixed(reachable))
    }

    /// Reports the address reachable exactly while `power` is running.
    #[must_use]
    pub fn following(power: &FakePower) -> Self {
        Self::with_fallback(ProbeFallback::Power(power.clone()))
    }

    fn with_fallback(fallback: ProbeFallback) -> Self {
        Self {
            script: Arc::new(std::sync::Mutex::new(VecDeque::new())),
            fallback,
            probes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Answers the next probes with `answers` before using the fallback.
    #[must_use]
    pub fn scripted(self, answers: impl IntoIterator<Item = bool>) -> Self {
        locked(&self.script).extend(answers);
        self
    }

    /// Number of probes answered.
    #[must_use]
    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

impl Reachability for FakeProbe {
    fn is_reachable<'a>(&'a self, _address: &'a str) -> ProbeFuture<'a> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let scripted = locked(&self.script).pop_front();
        let answer = scripted.unwrap_or_else(|| match &self.fallback {
            ProbeFallback::Fixed(reachable) => *reachable,
            ProbeFallback::Power(power) => power.state() == PowerState::Running,
        });
        Box::pin(async move { answer })
    }
}

/// Version-control double that creates real snapshot directories and
/// tarballs without any external tool.
#[derive(Clone, Debug)]
pub struct FakeVcs {
    version: String,
    calls: Shared<Vec<String>>,
}

impl FakeVcs {
    /// Creates a mirror reporting `version`.
    #[must_use]
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            calls: Arc::default(),
        }
    }

    /// Operations performed so far.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        locked(&self.calls).clone()
    }

    fn record(&self, call: String) {
        locked(&self.calls).push(call);
    }
}

impl VersionControl for FakeVcs {
    fn checkout(&self) -> VcsFuture<'_, ()> {
        self.record(String::from("checkout"));
        Box::pin(async { Ok(()) })
    }

    fn update(&self) -> VcsFuture<'_, Update> {
        self.record(String::from("update"));
        Box::pin(async {
            Ok(Update {
                changed: false,
                revision: Some(String::from("1")),
            })
        })
    }

    fn snapshot_with_overlay<'a>(
        &'a self,
        destination: &'a Utf8Path,
        patches: &'a Utf8Path,
    ) -> VcsFuture<'a, Snapshot> {
        self.record(format!("snapshot {destination} {patches}"));
        let result: Result<Snapshot, VcsError> = fs::create_dir_all(destination)
            .map(|()| Snapshot::new(destination))
            .map_err(Into::into);
        Box::pin(async move { result })
    }

    fn archive<'a>(&'a self, snapshot: &'a Snapshot, name: &'a str) -> VcsFuture<'a, Utf8PathBuf> {
        self.record(format!("archive {name}"));
        let parent = snapshot
            .path()
            .parent()
            .map_or_else(Utf8PathBuf::new, Utf8Path::to_path_buf);
        let path = parent.join(format!("{name}.tar.gz"));
        let result: Result<Utf8PathBuf, VcsError> =
            fs::write(&path, "tarball").map(|()| path).map_err(Into::into);
        Box::pin(async move { result })
    }

    fn version(&self) -> VcsFuture<'_, String> {
        let version = self.version.clone();
        Box::pin(async move { Ok(version) })
    }
}

/// Package-repository double recording the operations it receives.
#[derive(Clone, Debug)]
pub struct FakeRepository {
    checkout: Utf8PathBuf,
    results: String,
    calls: Shared<Vec<String>>,
}

impl FakeRepository {
    /// Creates a repository checked out at `checkout` whose builds succeed.
    #[must_use]
    pub fn new(checkout: impl Into<Utf8PathBuf>) -> Self {
        Self {
            checkout: checkout.into(),
            results: String::from("Debian_12 x86_64 succeeded\n"),
            calls: Arc::default(),
        }
    }

    /// Reports `results` once polling completes.
    #[must_use]
    pub fn with_results(mut self, results: impl Into<String>) -> Self {
        self.results = results.into();
        self
    }

    /// Operations performed so far.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        locked(&self.calls).clone()
    }

    fn record(&self, call: String) {
        locked(&self.calls).push(call);
    }
}

impl PackageRepository for FakeRepository {
    fn checkout_path(&self) -> &Utf8Path {
        &self.checkout
    }

    fn checkout(&self) -> RepositoryFuture<'_, ()> {
        self.record(String::from("checkout"));
        Box::pin(async { Ok(()) })
    }

    fn publish_sources(&self) -> RepositoryFuture<'_, ()> {
        self.record(String::from("publish"));
        Box::pin(async { Ok(()) })
    }

    fn trigger_build(&self) -> RepositoryFuture<'_, ()> {
        self.record(String::from("trigger"));
        Box::pin(async { Ok(()) })
    }

    fn poll_until_complete(&self) -> RepositoryFuture<'_, String> {
        self.record(String::from("poll"));
        let results = self.results.clone();
        Box::pin(async move { Ok(results) })
    }

    fn download_artifacts<'a>(
        &'a self,
        package: &'a str,
        destination: &'a Utf8Path,
    ) -> RepositoryFuture<'a, Vec<Utf8PathBuf>> {
        self.record(format!("download {package} {destination}"));
        Box::pin(async { Ok(Vec::new()) })
    }
}

/// Configuration whose working directories all live under `root`, with
/// repository polling delays disabled.
#[must_use]
pub fn fleet_config_in(root: &Utf8Path) -> FleetConfig {
    let mut config = FleetConfig::with_defaults("svn://example.org/project/trunk/src");
    config.fleet_file = root.join("fleet.json").into_string();
    config.artifacts_root = root.join("distr").into_string();
    config.logs_dir = root.join("logs").into_string();
    config.patched_root = root.join("patched").into_string();
    config.patches_root = root.join("patchs").into_string();
    config.mirror_path = root.join("repos/source").into_string();
    config.repository_checkout = root.join("repos/packaging").into_string();
    config.build_settle_secs = 0;
    config.build_poll_secs = 0;
    config
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
