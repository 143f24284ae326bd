//! Command execution on the local machine via `std::process`.

use std::fs::File;
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};

use crate::context::{ExecutionContext, OutputSink};
use crate::coredump::Coredump;
use crate::error::{ExecError, Result};
use crate::executor::Executor;
use crate::output::{DrainTarget, OutputCollector};
use crate::process::{ProcessControl, ProcessHandle};

/// Spawns commands as direct child processes.
///
/// Stateless; one executor can run any number of commands, concurrently
/// or in sequence.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalExecutor;

impl LocalExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Executor for LocalExecutor {
    fn spawn(&mut self, ctx: &ExecutionContext) -> Result<ProcessHandle> {
        let argv = ctx.local_argv();
        if argv.is_empty() {
            return Err(ExecError::Spawn("empty command".into()));
        }

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);

        if let Some(dir) = ctx.working_dir() {
            cmd.current_dir(dir);
        }

        // The mapping, when present, is the child's entire environment.
        if let Some(env) = ctx.environment() {
            cmd.env_clear();
            cmd.envs(env);
        }

        let mut collector = OutputCollector::new(false);

        // Sinks that need a drain thread get a pipe; the rest are
        // handed to the child directly.
        let stdout_file = match ctx.stdout_sink() {
            OutputSink::Capture => {
                cmd.stdout(Stdio::piped());
                None
            }
            OutputSink::ToStdout => {
                cmd.stdout(Stdio::inherit());
                None
            }
            OutputSink::File(path) => {
                let file = open_sink_file(path)?;
                cmd.stdout(Stdio::from(file.try_clone()?));
                Some(file)
            }
            OutputSink::Discard => {
                cmd.stdout(Stdio::null());
                None
            }
        };

        let stderr_captured = match ctx.stderr_sink() {
            // Merge into the stdout routing.
            OutputSink::ToStdout => match ctx.stdout_sink() {
                OutputSink::Capture => {
                    cmd.stderr(Stdio::piped());
                    true
                }
                OutputSink::ToStdout => {
                    cmd.stderr(Stdio::inherit());
                    false
                }
                OutputSink::File(_) => {
                    let file = stdout_file
                        .as_ref()
                        .ok_or_else(|| ExecError::Spawn("stdout file sink missing".into()))?;
                    cmd.stderr(Stdio::from(file.try_clone()?));
                    false
                }
                OutputSink::Discard => {
                    cmd.stderr(Stdio::null());
                    false
                }
            },
            OutputSink::Capture => {
                cmd.stderr(Stdio::piped());
                true
            }
            OutputSink::File(path) => {
                cmd.stderr(Stdio::from(open_sink_file(path)?));
                false
            }
            OutputSink::Discard => {
                cmd.stderr(Stdio::null());
                false
            }
        };

        // Children get their own process group so that terminate/kill
        // reaches shell-spawned descendants too, not just the leader;
        // otherwise an orphan keeps the output pipe open and the drain
        // never sees end-of-stream.
        #[cfg(unix)]
        cmd.process_group(0);

        #[cfg(unix)]
        if let Some(coredump) = ctx.coredump_wrapper() {
            let limit = coredump.rlimit();
            unsafe {
                cmd.pre_exec(move || {
                    let rlim = libc::rlimit {
                        rlim_cur: limit,
                        rlim_max: limit,
                    };
                    if libc::setrlimit(libc::RLIMIT_CORE, &rlim) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        tracing::debug!(command = %ctx.command_display(), "spawning local command");
        let mut child = cmd
            .spawn()
            .map_err(|e| ExecError::Spawn(format!("{}: {}", ctx.command_display(), e)))?;

        if let Some(stdout) = child.stdout.take() {
            let lines = if ctx.streams_lines() {
                Some(collector.make_stdout_lines())
            } else {
                None
            };
            let target = DrainTarget::Buffer(collector.stdout_buffer());
            collector.spawn_drain(stdout, target, lines);
        }

        if let Some(stderr) = child.stderr.take() {
            // A piped stderr is either captured separately or merged
            // into the stdout buffer.
            if stderr_captured && *ctx.stderr_sink() == OutputSink::Capture {
                let lines = if ctx.streams_lines() {
                    Some(collector.make_stderr_lines())
                } else {
                    None
                };
                let target = DrainTarget::Buffer(collector.stderr_buffer());
                collector.spawn_drain(stderr, target, lines);
            } else {
                let target = DrainTarget::Buffer(collector.stdout_buffer());
                collector.spawn_drain(stderr, target, None);
            }
        }

        let control = LocalControl {
            child,
            sudo: ctx.uses_sudo(),
            coredump: ctx.coredump_wrapper().cloned(),
            exit: None,
        };
        ProcessHandle::new(Box::new(control), collector, ctx.command_display())
    }

    fn target(&self) -> String {
        "localhost".to_string()
    }
}

fn open_sink_file(path: &std::path::Path) -> Result<File> {
    crate::output::open_sink_file(path)
        .map_err(|e| ExecError::Spawn(format!("cannot open output file {}: {}", path.display(), e)))
}

struct LocalControl {
    child: Child,
    sudo: bool,
    coredump: Option<Coredump>,
    exit: Option<i32>,
}

impl LocalControl {
    /// Signal the child's whole process group.
    fn signal(&mut self, signal: i32, name: &str) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        let pid = self.child.id();
        if self.sudo {
            // The child runs with elevated privileges, a plain kill(2)
            // from an unprivileged parent would be refused.
            let status = Command::new("sudo")
                .args(["kill", "-s", name, "--", &format!("-{pid}")])
                .status()?;
            if !status.success() {
                tracing::debug!(pid, signal = name, "sudo kill failed, process likely gone");
            }
        } else {
            let rc = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                // ESRCH means the process beat us to the exit.
                if err.raw_os_error() != Some(libc::ESRCH) {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }
}

impl ProcessControl for LocalControl {
    fn try_wait(&mut self) -> Result<Option<i32>> {
        if let Some(code) = self.exit {
            return Ok(Some(code));
        }
        match self.child.try_wait()? {
            Some(status) => {
                let code = exit_code(status);
                self.exit = Some(code);
                Ok(Some(code))
            }
            None => Ok(None),
        }
    }

    fn terminate(&mut self) -> Result<()> {
        self.signal(libc::SIGTERM, "TERM")
    }

    fn kill(&mut self) -> Result<()> {
        self.signal(libc::SIGKILL, "KILL")
    }

    fn post_exit(&mut self, code: i32) {
        if let Some(coredump) = &self.coredump {
            #[cfg(unix)]
            coredump.collect(self.child.id(), code);
            #[cfg(not(unix))]
            let _ = code;
        }
    }
}

/// Exit code of a finished child; death by signal maps to the negated
/// signal number.
#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| -sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::FailureVerbosity;
    use crate::process::ProcessState;
    use std::time::Duration;

    fn spawn(ctx: &ExecutionContext) -> ProcessHandle {
        LocalExecutor::new().spawn(ctx).unwrap()
    }

    #[test]
    fn test_spawn_captures_stdout() {
        let ctx = ExecutionContext::new(["printf", "hello"]);
        let mut handle = spawn(&ctx);
        let out = handle.wait(None).unwrap();
        assert_eq!(out.stdout, "hello");
        assert_eq!(handle.returncode().unwrap(), 0);
    }

    #[test]
    fn test_stderr_merged_by_default() {
        let ctx = ExecutionContext::new("printf err >&2");
        let mut handle = spawn(&ctx);
        let out = handle.wait(None).unwrap();
        assert_eq!(out.stdout, "err");
        assert_eq!(out.stderr, "");
    }

    #[test]
    fn test_stderr_captured_separately() {
        let ctx = ExecutionContext::new("printf out; printf err >&2")
            .outputs(OutputSink::Capture, Some(OutputSink::Capture));
        let mut handle = spawn(&ctx);
        let out = handle.wait(None).unwrap();
        assert_eq!(out.stdout, "out");
        assert_eq!(out.stderr, "err");
    }

    #[test]
    fn test_nonzero_exit_code() {
        let ctx = ExecutionContext::new("exit 42").failure_verbosity(FailureVerbosity::Silent);
        let mut handle = spawn(&ctx);
        handle.wait(None).unwrap();
        assert_eq!(handle.returncode().unwrap(), 42);
    }

    #[test]
    fn test_signal_death_negative_code() {
        let ctx = ExecutionContext::new("kill -KILL $$").failure_verbosity(FailureVerbosity::Silent);
        let mut handle = spawn(&ctx);
        handle.wait(None).unwrap();
        assert_eq!(handle.returncode().unwrap(), -libc::SIGKILL);
    }

    #[test]
    fn test_env_is_entire_environment() {
        // Absolute path: with a cleared environment the child has no
        // PATH to resolve a bare program name against.
        let ctx = ExecutionContext::new(["/usr/bin/env"]).env_var("ONLY_VAR", "1");
        let mut handle = spawn(&ctx);
        let out = handle.wait(None).unwrap();
        assert_eq!(out.stdout.trim(), "ONLY_VAR=1");
    }

    #[test]
    fn test_missing_binary_is_spawn_error() {
        let ctx = ExecutionContext::new(["definitely-not-a-real-binary-1b2c"]);
        let err = LocalExecutor::new().spawn(&ctx).unwrap_err();
        assert!(matches!(err, ExecError::Spawn(_)));
    }

    #[test]
    fn test_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ExecutionContext::new(["pwd"]).cwd(dir.path());
        let mut handle = spawn(&ctx);
        let out = handle.wait(None).unwrap();
        let reported = std::fs::canonicalize(out.stdout.trim()).unwrap();
        assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[test]
    fn test_file_sink_flushed_after_kill() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let ctx = ExecutionContext::new("printf ready; sleep 30")
            .outputs(OutputSink::File(path.clone()), None);
        let mut handle = spawn(&ctx);

        // Give the child a moment to produce the first write.
        std::thread::sleep(Duration::from_millis(300));
        handle.kill().unwrap();

        assert_eq!(handle.poll().unwrap(), ProcessState::Killed);
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "ready");
    }

    #[test]
    fn test_terminate_reports_killed() {
        let ctx = ExecutionContext::new(["sleep", "30"]);
        let mut handle = spawn(&ctx);
        let _ = handle.stop(Duration::from_secs(5)).unwrap();
        assert_eq!(handle.poll().unwrap(), ProcessState::Killed);
        assert_eq!(handle.returncode().unwrap(), -libc::SIGTERM);
    }

    #[test]
    fn test_streamed_lines_also_in_output() {
        let ctx = ExecutionContext::new("printf 'a\\nb\\n'").stream_lines(true);
        let mut handle = spawn(&ctx);
        let lines: Vec<String> = handle.take_stdout_lines().unwrap().collect();
        assert_eq!(lines, vec!["a", "b"]);

        let out = handle.wait(None).unwrap();
        assert_eq!(out.stdout, "a\nb\n");
    }
}
