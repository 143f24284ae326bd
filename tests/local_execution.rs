//! End-to-end tests for local command execution.

use std::time::Duration;

use cmdbridge::{
    AsyncTool, Daemon, ExecError, ExecutionContext, FailureVerbosity, LocalExecutor, OutputSink,
    ProcessState, Tool,
};

#[test]
fn test_tool_captures_stdout_and_merges_stderr() {
    let result = Tool::new("printf out; printf err >&2").run().unwrap();
    assert!(result.success());
    assert_eq!(result.output.stdout, "outerr");
    assert_eq!(result.output.stderr, "");
}

#[test]
fn test_tool_separate_stderr() {
    let result = Tool::new("printf out; printf err >&2")
        .outputs(OutputSink::Capture, Some(OutputSink::Capture))
        .run()
        .unwrap();
    assert_eq!(result.output.stdout, "out");
    assert_eq!(result.output.stderr, "err");
}

#[test]
fn test_tool_failure_policy_default_raises() {
    let err = Tool::new("exit 5").run().unwrap_err();
    match err {
        ExecError::ExecutionFailed { command, code } => {
            assert_eq!(code, 5);
            assert!(command.contains("exit 5"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_tool_silent_policy_returns_code() {
    let result = Tool::new("exit 5")
        .failure_verbosity(FailureVerbosity::Silent)
        .run()
        .unwrap();
    assert_eq!(result.exit_code, 5);
}

#[test]
fn test_tool_argv_form_bypasses_shell() {
    // A shell metacharacter handed as a plain argument stays literal.
    let result = Tool::new(["printf", "%s", "a;b"]).run().unwrap();
    assert_eq!(result.output.stdout, "a;b");
}

#[test]
fn test_tool_cwd_and_env() {
    let dir = tempfile::tempdir().unwrap();
    let result = Tool::new("pwd; printf \"$MARKER\"")
        .cwd(dir.path())
        .env_var("PATH", std::env::var("PATH").unwrap_or_default())
        .env_var("MARKER", "present")
        .run()
        .unwrap();
    assert!(result.output.stdout.contains("present"));
    let first_line = result.output.stdout.lines().next().unwrap();
    assert_eq!(
        std::fs::canonicalize(first_line).unwrap(),
        std::fs::canonicalize(dir.path()).unwrap()
    );
}

#[test]
fn test_tool_file_sink() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("tool.log");
    let result = Tool::new("printf to-file; printf also-err >&2")
        .outputs(OutputSink::File(log.clone()), None)
        .run()
        .unwrap();
    // Nothing captured in memory when routed to a file.
    assert_eq!(result.output.stdout, "");
    let content = std::fs::read_to_string(&log).unwrap();
    assert!(content.contains("to-file"));
    assert!(content.contains("also-err"));
}

#[test]
fn test_tool_timeout_kill_reports_signal_code() {
    let result = Tool::new("sleep 30")
        .timeout(Duration::from_millis(200))
        .failure_verbosity(FailureVerbosity::NoException)
        .run()
        .unwrap();
    assert!(result.exit_code < 0);
}

#[test]
fn test_daemon_start_stop() {
    let mut daemon = Daemon::new("while true; do printf tick; sleep 0.1; done");
    daemon.start().unwrap();
    assert!(daemon.is_running());
    std::thread::sleep(Duration::from_millis(400));

    let result = daemon.stop().unwrap();
    assert!(!daemon.is_running());
    assert!(result.output.stdout.contains("tick"));
}

#[test]
fn test_daemon_returncode_while_running() {
    let mut daemon = Daemon::new(["sleep", "30"]);
    daemon.start().unwrap();
    assert!(matches!(
        daemon.returncode(),
        Err(ExecError::NotFinished)
    ));
    daemon.stop().unwrap();
    assert!(daemon.returncode().unwrap() < 0);
}

#[test]
fn test_async_tool_line_streaming() {
    let mut tool = AsyncTool::new("for i in 1 2 3; do printf \"line $i\\n\"; done");
    tool.run().unwrap();

    let lines: Vec<String> = tool.stdout_lines().unwrap().collect();
    assert_eq!(lines, vec!["line 1", "line 2", "line 3"]);

    let result = tool.wait_or_kill().unwrap();
    assert!(result.success());
    assert_eq!(result.output.stdout, "line 1\nline 2\nline 3\n");
}

#[test]
fn test_async_tool_wait_returns_despite_stalled_consumer() {
    // Far more lines than the streaming queue holds.
    let mut tool = AsyncTool::new("seq 1 100000");
    tool.run().unwrap();

    // Consume one line, then keep the iterator alive without reading
    // further. The producer backs up on the full queue; the wait must
    // still complete and return the full output.
    let mut lines = tool.stdout_lines().unwrap();
    assert_eq!(lines.next().as_deref(), Some("1"));

    let result = tool.wait_or_kill().unwrap();
    assert!(result.success());
    assert!(result.output.stdout.contains("100000"));
    drop(lines);
}

#[test]
fn test_async_tool_lines_claimable_once() {
    let mut tool = AsyncTool::new("printf 'x\\n'");
    tool.run().unwrap();
    assert!(tool.stdout_lines().is_some());
    assert!(tool.stdout_lines().is_none());
    tool.wait_or_kill().unwrap();
}

#[test]
fn test_process_handle_lifecycle_via_executor() {
    use cmdbridge::Executor;

    let ctx = ExecutionContext::new(["sleep", "30"]);
    let mut handle = LocalExecutor::new().spawn(&ctx).unwrap();
    assert_eq!(handle.poll().unwrap(), ProcessState::Running);

    handle.kill().unwrap();
    assert_eq!(handle.poll().unwrap(), ProcessState::Killed);
    assert!(handle.returncode().unwrap() < 0);

    // A terminal state is final; a second kill changes nothing.
    handle.kill().unwrap();
    assert_eq!(handle.poll().unwrap(), ProcessState::Killed);
}

#[test]
fn test_wait_timeout_leaves_process_running() {
    use cmdbridge::Executor;

    let ctx = ExecutionContext::new(["sleep", "30"]);
    let mut handle = LocalExecutor::new().spawn(&ctx).unwrap();

    let err = handle.wait(Some(Duration::from_millis(150))).unwrap_err();
    assert!(matches!(err, ExecError::Timeout));
    assert!(handle.is_running());

    handle.kill().unwrap();
}

// Requires passwordless sudo.
#[test]
#[ignore]
fn test_tool_sudo() {
    let result = Tool::new(["id", "-u"]).sudo(true).run().unwrap();
    assert_eq!(result.output.stdout_trimmed(), "0");
}

// Requires strace to be installed.
#[test]
#[ignore]
fn test_tool_strace_writes_trace() {
    use cmdbridge::Strace;

    let dir = tempfile::tempdir().unwrap();
    let trace = dir.path().join("trace.out");
    Tool::new(["true"])
        .strace(Strace::new().output_file(&trace))
        .run()
        .unwrap();
    assert!(trace.is_file());
    assert!(std::fs::read_to_string(&trace).unwrap().contains("execve"));
}

// Requires a kernel core_pattern that drops core.<pid> files in cwd.
#[test]
#[ignore]
fn test_tool_coredump_collected() {
    use cmdbridge::Coredump;

    let dir = tempfile::tempdir().unwrap();
    let dump = dir.path().join("app.core");
    let result = Tool::new("kill -SEGV $$")
        .cwd(dir.path())
        .coredump(Coredump::new().output_file(&dump))
        .failure_verbosity(FailureVerbosity::NoException)
        .run()
        .unwrap();
    assert_eq!(result.exit_code, -libc::SIGSEGV);
    assert!(dump.is_file());
}
