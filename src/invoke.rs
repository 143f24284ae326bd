//! High-level invocation modes on top of executors.
//!
//! [`Tool`] runs a command to completion, [`Daemon`] runs it in the
//! background until stopped, [`AsyncTool`] runs it while its output is
//! consumed line by line. All three evaluate the context's
//! [`FailureVerbosity`] policy against the final exit code.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::context::{CommandLine, ExecutionContext, FailureVerbosity, OutputSink};
use crate::coredump::Coredump;
use crate::error::{ExecError, Result};
use crate::executor::{self, SharedExecutor};
use crate::output::{CapturedOutput, OutputLines};
use crate::process::{ProcessHandle, ProcessState};
use crate::strace::Strace;

/// Default grace period between a termination request and the
/// escalation to a kill.
const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Outcome of a completed invocation.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Captured output of the command.
    pub output: CapturedOutput,
    /// Final exit code; negative for death by signal.
    pub exit_code: i32,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Apply the failure policy to a final exit code.
fn evaluate_exit(
    command: &str,
    output: &CapturedOutput,
    verbosity: FailureVerbosity,
    code: i32,
) -> Result<()> {
    if code == 0 {
        return Ok(());
    }

    if verbosity.logs() {
        if verbosity == FailureVerbosity::Normal {
            tracing::error!(
                command,
                code,
                stdout = %output.stdout,
                stderr = %output.stderr,
                "command failed"
            );
        } else {
            tracing::debug!(
                command,
                code,
                stdout = %output.stdout,
                stderr = %output.stderr,
                "command failed"
            );
        }
    }

    if verbosity.raises() {
        return Err(ExecError::ExecutionFailed {
            command: command.to_string(),
            code,
        });
    }
    Ok(())
}

fn spawn_on(executor: &SharedExecutor, ctx: &ExecutionContext) -> Result<ProcessHandle> {
    let mut guard = executor.lock().unwrap_or_else(|e| e.into_inner());
    guard.spawn(ctx)
}

macro_rules! context_builders {
    () => {
        /// Set the working directory.
        pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
            self.ctx = self.ctx.cwd(dir);
            self
        }

        /// Set the environment mapping (entire environment locally,
        /// additive overlay remotely).
        pub fn env(mut self, env: HashMap<String, String>) -> Self {
            self.ctx = self.ctx.env(env);
            self
        }

        /// Set a single environment variable.
        pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
            self.ctx = self.ctx.env_var(key, value);
            self
        }

        /// Run with privilege escalation.
        pub fn sudo(mut self, sudo: bool) -> Self {
            self.ctx = self.ctx.sudo(sudo);
            self
        }

        /// Run inside a network namespace.
        pub fn netns(mut self, netns: impl Into<String>) -> Self {
            self.ctx = self.ctx.netns(netns);
            self
        }

        /// Route the output streams.
        pub fn outputs(mut self, stdout: OutputSink, stderr: Option<OutputSink>) -> Self {
            self.ctx = self.ctx.outputs(stdout, stderr);
            self
        }

        /// Set the failure-verbosity policy.
        pub fn failure_verbosity(mut self, verbosity: FailureVerbosity) -> Self {
            self.ctx = self.ctx.failure_verbosity(verbosity);
            self
        }

        /// Wrap the command with strace (local executors only).
        pub fn strace(mut self, strace: Strace) -> Self {
            self.ctx = self.ctx.strace(strace);
            self
        }

        /// Collect a core dump on crash (local executors only).
        pub fn coredump(mut self, coredump: Coredump) -> Self {
            self.ctx = self.ctx.coredump(coredump);
            self
        }

        /// Run on the given executor instead of the local machine.
        pub fn executor(mut self, executor: SharedExecutor) -> Self {
            self.executor = executor;
            self
        }

        /// The underlying execution context.
        pub fn context(&self) -> &ExecutionContext {
            &self.ctx
        }

        /// Mutable access to the underlying execution context.
        pub fn context_mut(&mut self) -> &mut ExecutionContext {
            &mut self.ctx
        }
    };
}

/// A command run synchronously to completion.
pub struct Tool {
    ctx: ExecutionContext,
    executor: SharedExecutor,
    timeout: Option<Duration>,
}

impl Tool {
    /// A tool running `command` on the local machine.
    pub fn new(command: impl Into<CommandLine>) -> Self {
        Self {
            ctx: ExecutionContext::new(command),
            executor: executor::local(),
            timeout: None,
        }
    }

    /// A tool over an existing context.
    pub fn from_context(ctx: ExecutionContext, executor: SharedExecutor) -> Self {
        Self {
            ctx,
            executor,
            timeout: None,
        }
    }

    context_builders!();

    /// Kill the command if it has not finished within `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Spawn the command and block until it finishes (or the timeout
    /// kills it), then apply the failure policy.
    ///
    /// The context is only borrowed, so the tool can be run repeatedly.
    pub fn run(&self) -> Result<RunResult> {
        let mut handle = spawn_on(&self.executor, &self.ctx)?;
        let output = handle.wait_or_kill(self.timeout)?;
        let exit_code = handle.returncode()?;
        evaluate_exit(
            &self.ctx.command_display(),
            &output,
            self.ctx.verbosity(),
            exit_code,
        )?;
        Ok(RunResult { output, exit_code })
    }
}

/// A long-running command started in the background and stopped on
/// request.
pub struct Daemon {
    ctx: ExecutionContext,
    executor: SharedExecutor,
    handle: Option<ProcessHandle>,
    stop_grace: Duration,
}

impl Daemon {
    /// A daemon running `command` on the local machine.
    pub fn new(command: impl Into<CommandLine>) -> Self {
        Self {
            ctx: ExecutionContext::new(command),
            executor: executor::local(),
            handle: None,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    /// A daemon over an existing context.
    pub fn from_context(ctx: ExecutionContext, executor: SharedExecutor) -> Self {
        Self {
            ctx,
            executor,
            handle: None,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    context_builders!();

    /// Grace period given to a stopping daemon before it is killed.
    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Spawn the command and return immediately.
    pub fn start(&mut self) -> Result<()> {
        if let Some(handle) = &mut self.handle {
            if handle.is_running() {
                return Err(ExecError::Spawn("daemon is already running".into()));
            }
        }
        self.handle = Some(spawn_on(&self.executor, &self.ctx)?);
        Ok(())
    }

    /// Whether the daemon process is alive.
    pub fn is_running(&mut self) -> bool {
        self.handle.as_mut().is_some_and(|h| h.is_running())
    }

    /// Exit code, once the daemon has stopped.
    pub fn returncode(&mut self) -> Result<i32> {
        self.handle
            .as_mut()
            .ok_or(ExecError::NotFinished)?
            .returncode()
    }

    /// Output collected so far.
    pub fn output(&self) -> CapturedOutput {
        self.handle
            .as_ref()
            .map(ProcessHandle::output)
            .unwrap_or_default()
    }

    /// Stop the daemon: terminate gracefully, escalate to a kill after
    /// the grace period.
    ///
    /// The failure policy is applied only when the process turns out to
    /// have exited on its own before the stop; a termination requested
    /// here is not a failure.
    pub fn stop(&mut self) -> Result<RunResult> {
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| ExecError::Spawn("daemon was not started".into()))?;
        let output = handle.stop(self.stop_grace)?;
        let exit_code = handle.returncode()?;
        if handle.poll()? == ProcessState::Finished {
            evaluate_exit(
                &self.ctx.command_display(),
                &output,
                self.ctx.verbosity(),
                exit_code,
            )?;
        }
        Ok(RunResult { output, exit_code })
    }
}

/// A command consumed while it runs: output is streamed line by line,
/// and a final wait collects the rest.
pub struct AsyncTool {
    ctx: ExecutionContext,
    executor: SharedExecutor,
    handle: Option<ProcessHandle>,
    timeout: Option<Duration>,
}

impl AsyncTool {
    /// An async tool running `command` on the local machine.
    pub fn new(command: impl Into<CommandLine>) -> Self {
        Self {
            ctx: ExecutionContext::new(command).stream_lines(true),
            executor: executor::local(),
            handle: None,
            timeout: None,
        }
    }

    context_builders!();

    /// Kill the command if a later [`AsyncTool::wait_or_kill`] does not
    /// see it finish within `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Spawn the command and return immediately; lines become available
    /// through [`AsyncTool::stdout_lines`].
    pub fn run(&mut self) -> Result<()> {
        if let Some(handle) = &mut self.handle {
            if handle.is_running() {
                return Err(ExecError::Spawn("command is already running".into()));
            }
        }
        self.handle = Some(spawn_on(&self.executor, &self.ctx)?);
        Ok(())
    }

    /// Whether the command is still running.
    pub fn is_running(&mut self) -> bool {
        self.handle.as_mut().is_some_and(|h| h.is_running())
    }

    /// Claim the stdout line iterator. Available once per run.
    ///
    /// Consume it or drop it; the lines it yields also stay in the
    /// output returned by [`AsyncTool::wait_or_kill`].
    pub fn stdout_lines(&mut self) -> Option<OutputLines> {
        self.handle.as_mut().and_then(ProcessHandle::take_stdout_lines)
    }

    /// Claim the stderr line iterator, when stderr is captured
    /// separately.
    pub fn stderr_lines(&mut self) -> Option<OutputLines> {
        self.handle.as_mut().and_then(ProcessHandle::take_stderr_lines)
    }

    /// Wait for the command, killing it when the timeout elapses, then
    /// apply the failure policy. The returned output is complete,
    /// including every line already streamed.
    pub fn wait_or_kill(&mut self) -> Result<RunResult> {
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| ExecError::Spawn("command was not started".into()))?;
        let output = handle.wait_or_kill(self.timeout)?;
        let exit_code = handle.returncode()?;
        evaluate_exit(
            &self.ctx.command_display(),
            &output,
            self.ctx.verbosity(),
            exit_code,
        )?;
        Ok(RunResult { output, exit_code })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluate_exit_policy_matrix() {
        let out = CapturedOutput::default();

        assert!(evaluate_exit("cmd", &out, FailureVerbosity::Normal, 0).is_ok());

        let err = evaluate_exit("cmd", &out, FailureVerbosity::Normal, 1).unwrap_err();
        assert!(matches!(
            err,
            ExecError::ExecutionFailed { code: 1, .. }
        ));

        assert!(evaluate_exit("cmd", &out, FailureVerbosity::NoError, 1).is_err());
        assert!(evaluate_exit("cmd", &out, FailureVerbosity::NoException, 1).is_ok());
        assert!(evaluate_exit("cmd", &out, FailureVerbosity::Silent, 1).is_ok());
    }

    #[test]
    fn test_tool_success() {
        let result = Tool::new(["printf", "ok"]).run().unwrap();
        assert!(result.success());
        assert_eq!(result.output.stdout, "ok");
    }

    #[test]
    fn test_tool_failure_raises_by_default() {
        let err = Tool::new("exit 3").run().unwrap_err();
        match err {
            ExecError::ExecutionFailed { code, .. } => assert_eq!(code, 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_tool_no_exception_exposes_code() {
        let result = Tool::new("exit 3")
            .failure_verbosity(FailureVerbosity::NoException)
            .run()
            .unwrap();
        assert_eq!(result.exit_code, 3);
        assert!(!result.success());
    }

    #[test]
    fn test_tool_is_reusable() {
        let tool = Tool::new(["printf", "again"]);
        assert_eq!(tool.run().unwrap().output.stdout, "again");
        assert_eq!(tool.run().unwrap().output.stdout, "again");
    }

    #[test]
    fn test_tool_timeout_kills() {
        let result = Tool::new("sleep 30")
            .timeout(Duration::from_millis(200))
            .failure_verbosity(FailureVerbosity::Silent)
            .run()
            .unwrap();
        assert!(result.exit_code < 0);
    }

    #[test]
    fn test_daemon_lifecycle() {
        let mut daemon = Daemon::new("sleep 30");
        assert!(!daemon.is_running());
        daemon.start().unwrap();
        assert!(daemon.is_running());
        assert!(matches!(daemon.start(), Err(ExecError::Spawn(_))));

        let result = daemon.stop().unwrap();
        // Stopped on request, not a failure: no policy error despite the
        // signal exit code.
        assert!(result.exit_code < 0);
        assert!(!daemon.is_running());
    }

    #[test]
    fn test_daemon_natural_exit_applies_policy() {
        let mut daemon = Daemon::new("exit 7");
        daemon.start().unwrap();
        // Give it time to exit on its own.
        std::thread::sleep(Duration::from_millis(300));
        assert!(!daemon.is_running());
        let err = daemon.stop().unwrap_err();
        assert!(matches!(err, ExecError::ExecutionFailed { code: 7, .. }));
    }

    #[test]
    fn test_async_tool_streams_then_waits() {
        let mut tool = AsyncTool::new("printf 'one\\ntwo\\n'");
        tool.run().unwrap();

        let lines: Vec<String> = tool.stdout_lines().unwrap().collect();
        assert_eq!(lines, vec!["one", "two"]);

        let result = tool.wait_or_kill().unwrap();
        assert!(result.success());
        assert_eq!(result.output.stdout, "one\ntwo\n");
    }

    #[test]
    fn test_async_tool_partial_consumption() {
        let mut tool = AsyncTool::new("printf 'first\\n'; sleep 30")
            .timeout(Duration::from_millis(200));
        tool.run().unwrap();

        let mut lines = tool.stdout_lines().unwrap();
        assert_eq!(lines.next().as_deref(), Some("first"));
        drop(lines);

        let result = tool.wait_or_kill().unwrap_err();
        assert!(matches!(result, ExecError::ExecutionFailed { .. }));
    }
}
