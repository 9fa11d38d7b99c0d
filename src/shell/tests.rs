//! Tests for interactive shell sessions.

use std::sync::Arc;

use rstest::{fixture, rstest};

use super::*;
use crate::test_support::{ScriptedRunner, ScriptedShell};

#[fixture]
fn options() -> SessionOptions {
    SessionOptions {
        banner_idle: Duration::from_millis(20),
        command_idle: None,
        default_shell: None,
    }
}

fn session_with(
    shell: &ScriptedShell,
    runner: &ScriptedRunner,
    options: SessionOptions,
) -> RemoteShellSession<ScriptedShell> {
    RemoteShellSession::new(
        shell.clone(),
        Credentials::new("10.0.0.5", "builder"),
        options,
        Rsync::new(SshConfig::with_defaults(), Arc::new(runner.clone())),
    )
}

fn session(shell: &ScriptedShell, options: SessionOptions) -> RemoteShellSession<ScriptedShell> {
    session_with(shell, &ScriptedRunner::new(), options)
}

#[rstest]
#[tokio::test]
async fn run_returns_only_command_output(options: SessionOptions) {
    let shell = ScriptedShell::new();
    let mut session = session(&shell, options);

    let output = session.run("echo hello", true).await.expect("run");

    assert_eq!(
        output,
        ShellOutput {
            text: String::from("hello"),
            complete: true,
        }
    );
    assert_eq!(session.state(), SessionState::Ready);
}

#[rstest]
#[case(1)]
#[case(2)]
#[case(3)]
#[case(7)]
#[tokio::test]
async fn run_reassembles_chunked_output(options: SessionOptions, #[case] chunk: usize) {
    let shell = ScriptedShell::new().with_chunk_size(chunk);
    let mut session = session(&shell, options);

    let output = session.run("echo hello", true).await.expect("run");

    assert_eq!(output.text, "hello");
    assert!(output.complete);
}

#[rstest]
#[tokio::test]
async fn run_strips_control_sequences_and_carriage_returns(options: SessionOptions) {
    let shell = ScriptedShell::new().with_response("ls", "\u{1b}[01;34mdir\u{1b}[0m\r\nfile");
    let mut session = session(&shell, options);

    let output = session.run("ls", true).await.expect("run");

    assert_eq!(output.text, "dir\nfile");
}

#[rstest]
#[tokio::test]
async fn run_batch_reuses_one_connection(options: SessionOptions) {
    let shell = ScriptedShell::new();
    let mut session = session(&shell, options);

    let output = session
        .run_batch(&["echo one", "echo two", "echo three"])
        .await
        .expect("batch");

    assert_eq!(output.text, "one\ntwo\nthree");
    assert!(output.complete);
    assert_eq!(shell.connects(), 1);
}

#[rstest]
#[tokio::test]
async fn reset_connection_reconnects(options: SessionOptions) {
    let shell = ScriptedShell::new();
    let mut session = session(&shell, options);

    session.run("echo first", true).await.expect("first run");
    session.run("echo second", false).await.expect("second run");
    session.run("echo third", true).await.expect("third run");

    assert_eq!(shell.connects(), 2);
}

#[rstest]
#[tokio::test]
async fn connect_retries_once_with_relaxed_policy(options: SessionOptions) {
    let shell = ScriptedShell::new().failing_connects(1);
    let mut session = session(&shell, options);

    let output = session.run("echo hello", true).await.expect("run");

    assert_eq!(output.text, "hello");
    assert_eq!(
        shell.policies(),
        vec![AlgorithmPolicy::Restricted, AlgorithmPolicy::Relaxed]
    );
}

#[rstest]
#[tokio::test]
async fn connect_gives_up_after_relaxed_retry(options: SessionOptions) {
    let shell = ScriptedShell::new().failing_connects(2);
    let mut session = session(&shell, options);

    let err = session
        .run("echo hello", true)
        .await
        .expect_err("both attempts fail");

    assert!(matches!(err, ShellError::Connection { ref address, .. } if address == "10.0.0.5"));
    assert_eq!(session.state(), SessionState::Disconnected);
    assert_eq!(shell.policies().len(), 2);
}

#[rstest]
#[tokio::test]
async fn handshake_end_of_stream_triggers_relaxed_retry(options: SessionOptions) {
    let shell = ScriptedShell::new().hanging_up_handshakes(1);
    let mut session = session(&shell, options);

    session.connect().await.expect("relaxed attempt succeeds");

    assert_eq!(
        shell.policies(),
        vec![AlgorithmPolicy::Restricted, AlgorithmPolicy::Relaxed]
    );
    assert_eq!(session.state(), SessionState::Ready);
}

#[rstest]
#[tokio::test]
async fn default_shell_is_launched_before_commands(options: SessionOptions) {
    let shell = ScriptedShell::new();
    let mut session = session(
        &shell,
        options.with_default_shell(Some(String::from(
            r"C:\msys64\msys2_shell.cmd -defterm -no-start -mingw32",
        ))),
    );

    let output = session.run("echo ready", true).await.expect("run");

    assert_eq!(output.text, "ready");
    let received = shell.received();
    let shell_index = received
        .iter()
        .position(|line| line == r"C:\\msys64\\msys2_shell.cmd -defterm -no-start -mingw32");
    let command_index = received.iter().position(|line| line == "echo ready");
    assert!(shell_index.is_some());
    assert!(shell_index < command_index, "received: {received:?}");
}

#[rstest]
#[tokio::test]
async fn missing_sentinel_returns_partial_output(mut options: SessionOptions) {
    options.command_idle = Some(Duration::from_millis(50));
    let shell = ScriptedShell::new()
        .with_response("make", "compiling\r\nlinking")
        .stalling_on("make");
    let mut session = session(&shell, options);

    let output = session.run("make", true).await.expect("run");

    assert_eq!(
        output,
        ShellOutput {
            text: String::from("compiling\nlinking"),
            complete: false,
        }
    );
}

#[rstest]
#[tokio::test]
async fn partial_output_drops_the_session_before_the_next_command(
    mut options: SessionOptions,
) {
    options.command_idle = Some(Duration::from_millis(50));
    let shell = ScriptedShell::new()
        .with_response("make", "compiling")
        .stalling_on("make");
    let mut session = session(&shell, options);

    let output = session
        .run_batch(&["make", "echo next"])
        .await
        .expect("batch");

    assert!(!output.complete);
    assert_eq!(output.text, "compiling\nnext");
    assert_eq!(shell.connects(), 2);
    assert_eq!(session.state(), SessionState::Ready);
}

#[rstest]
#[tokio::test]
async fn backslashes_are_doubled_before_sending(options: SessionOptions) {
    let shell = ScriptedShell::new();
    let mut session = session(&shell, options);

    session.run(r"cd C:\build", true).await.expect("run");

    assert!(shell.received().contains(&String::from(r"cd C:\\build")));
}

#[rstest]
#[tokio::test]
async fn copy_to_remote_runs_local_rsync(options: SessionOptions) {
    let shell = ScriptedShell::new();
    let runner = ScriptedRunner::new();
    runner.push_success();
    let mut session = session_with(&shell, &runner, options);

    session
        .copy_to_remote(Utf8Path::new("patched/linux"), "/home/builder/src")
        .await
        .expect("copy");

    let invocations = runner.invocations();
    let command = invocations
        .first()
        .map(crate::test_support::CommandInvocation::command_string)
        .unwrap_or_default();
    assert!(command.starts_with("rsync -avz -e"), "command: {command}");
    assert!(command.ends_with("patched/linux builder@10.0.0.5:/home/builder/src"));
    assert_eq!(shell.connects(), 0);
}

#[rstest]
#[tokio::test]
async fn copy_over_session_types_the_rsync_invocation(options: SessionOptions) {
    let shell = ScriptedShell::new();
    let mut session = session(&shell, options);
    let peer = Credentials::new("10.0.0.1", "controller");

    let output = session
        .copy_over_session(&peer, Direction::Download, Utf8Path::new("/tmp/in"), "/srv/out")
        .await
        .expect("copy");

    assert!(output.complete);
    assert!(
        shell
            .received()
            .iter()
            .any(|line| line.starts_with("rsync -avz") && line.ends_with("/tmp/in")),
        "received: {:?}",
        shell.received()
    );
}

#[test]
fn command_text_drops_echo_and_marker_lines() {
    let lines = vec![
        String::from("$ make all"),
        String::from("make all"),
        String::from("done"),
        format!("$ {END_MARKER}"),
    ];

    assert_eq!(command_text(&lines, "make all"), "make all\ndone");
}

#[test]
fn command_text_keeps_output_of_a_blank_command() {
    let lines = vec![String::from("first"), String::from("second")];

    assert_eq!(command_text(&lines, "  "), "first\nsecond");
}
