//! Handle and lifecycle management for a spawned command.

mod state;

pub use state::ProcessState;

use std::time::{Duration, Instant};

use crate::error::{ExecError, Result};
use crate::output::{CapturedOutput, OutputCollector, OutputLines};

/// Interval between liveness polls while waiting.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long a killed process is given to actually disappear.
const KILL_GRACE: Duration = Duration::from_secs(10);

/// Backend-specific control over one spawned process.
///
/// Implemented by the local and remote executors. All methods are
/// idempotent with respect to an already-exited process.
pub(crate) trait ProcessControl: Send {
    /// Non-blocking liveness check. Returns the exit code once the
    /// process has exited, `None` while it is still running.
    fn try_wait(&mut self) -> Result<Option<i32>>;

    /// Ask the process to stop gracefully (SIGTERM locally, an
    /// interrupt over the control channel remotely).
    fn terminate(&mut self) -> Result<()>;

    /// Stop the process forcefully.
    fn kill(&mut self) -> Result<()>;

    /// Invoked once, after the exit code has first been observed and
    /// the output streams have been fully drained.
    fn post_exit(&mut self, _code: i32) {}
}

/// A spawned command.
///
/// Tracks the lifecycle (`Running` until terminal, then `Finished` or
/// `Killed`), owns the output drain machinery and exposes waiting,
/// termination and output retrieval. Exit code and final output become
/// available exactly when the state turns terminal.
pub struct ProcessHandle {
    control: Box<dyn ProcessControl>,
    collector: OutputCollector,
    state: ProcessState,
    exit_code: Option<i32>,
    kill_requested: bool,
    command: String,
    started_at: Instant,
}

impl ProcessHandle {
    pub(crate) fn new(
        control: Box<dyn ProcessControl>,
        collector: OutputCollector,
        command: String,
    ) -> Result<Self> {
        let mut state = ProcessState::Created;
        state.transition_to(ProcessState::Running)?;
        Ok(Self {
            control,
            collector,
            state,
            exit_code: None,
            kill_requested: false,
            command,
            started_at: Instant::now(),
        })
    }

    /// The command this handle was spawned with, in display form.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Time elapsed since the process was spawned.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Current lifecycle state, refreshed by a non-blocking poll.
    pub fn poll(&mut self) -> Result<ProcessState> {
        if self.state.is_terminal() {
            return Ok(self.state);
        }
        if let Some(code) = self.control.try_wait()? {
            let target = if self.kill_requested {
                ProcessState::Killed
            } else {
                ProcessState::Finished
            };
            self.state.transition_to(target)?;
            self.exit_code = Some(code);
            self.control.post_exit(code);
            tracing::debug!(
                command = %self.command,
                code,
                state = ?self.state,
                "process exited"
            );
        }
        Ok(self.state)
    }

    /// Whether the process is still alive.
    pub fn is_running(&mut self) -> bool {
        matches!(self.poll(), Ok(ProcessState::Running))
    }

    /// Exit code of the finished process.
    ///
    /// Fails with [`ExecError::NotFinished`] while the process is still
    /// running. A negative value reports death by signal.
    pub fn returncode(&mut self) -> Result<i32> {
        if !self.poll()?.is_terminal() {
            return Err(ExecError::NotFinished);
        }
        self.exit_code.ok_or(ExecError::NotFinished)
    }

    /// Wait for the process to reach a terminal state.
    ///
    /// With a timeout, returns [`ExecError::Timeout`] when the deadline
    /// elapses; the process keeps running and the handle stays valid.
    /// Without one, blocks until exit.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<CapturedOutput> {
        // No more lines will be consumed past this point; close the
        // channels so a producer blocked on a full queue wakes up even
        // when an iterator is claimed but idle.
        self.collector.close_line_streams();

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.poll()?.is_terminal() {
                // Join the drain threads so the buffers are complete
                // before the output is handed out.
                self.collector.finalize();
                return Ok(self.collector.output());
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(ExecError::Timeout);
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Wait for the process, killing it when the deadline elapses.
    ///
    /// This always ends in a terminal state and always returns the
    /// output collected so far, including anything already streamed
    /// through a line iterator. `timeout: None` waits indefinitely.
    pub fn wait_or_kill(&mut self, timeout: Option<Duration>) -> Result<CapturedOutput> {
        match self.wait(timeout) {
            Ok(output) => Ok(output),
            Err(ExecError::Timeout) => {
                tracing::debug!(command = %self.command, "wait deadline elapsed, killing");
                self.kill()?;
                Ok(self.collector.output())
            }
            Err(e) => Err(e),
        }
    }

    /// Graceful stop: request termination, then escalate to a kill if
    /// the process is still alive after `grace`.
    pub fn stop(&mut self, grace: Duration) -> Result<CapturedOutput> {
        if self.poll()?.is_terminal() {
            self.collector.close_line_streams();
            self.collector.finalize();
            return Ok(self.collector.output());
        }
        self.kill_requested = true;
        tracing::debug!(command = %self.command, "terminating process");
        self.control.terminate()?;
        match self.wait(Some(grace)) {
            Ok(output) => Ok(output),
            Err(ExecError::Timeout) => {
                tracing::warn!(
                    command = %self.command,
                    "process ignored termination request, killing"
                );
                self.control.kill()?;
                self.wait(Some(KILL_GRACE))
            }
            Err(e) => Err(e),
        }
    }

    /// Forceful stop. No-op on an already terminal process.
    pub fn kill(&mut self) -> Result<()> {
        if self.poll()?.is_terminal() {
            return Ok(());
        }
        self.kill_requested = true;
        tracing::debug!(command = %self.command, "killing process");
        self.control.kill()?;
        self.wait(Some(KILL_GRACE))?;
        Ok(())
    }

    /// Output collected so far (complete once the state is terminal).
    pub fn output(&self) -> CapturedOutput {
        self.collector.output()
    }

    /// Claim the lazy stdout line iterator.
    ///
    /// Available once, and only when the command was spawned with line
    /// streaming enabled. The iterator ends when the stream closes;
    /// dropping it early never stalls the process, and any wait call
    /// on this handle finishes the stream.
    pub fn take_stdout_lines(&mut self) -> Option<OutputLines> {
        self.collector.take_stdout_lines()
    }

    /// Claim the lazy stderr line iterator, when stderr is captured
    /// separately.
    pub fn take_stderr_lines(&mut self) -> Option<OutputLines> {
        self.collector.take_stderr_lines()
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("command", &self.command)
            .field("state", &self.state)
            .field("exit_code", &self.exit_code)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Control stub that exits after a fixed number of polls.
    struct FakeControl {
        polls_left: u32,
        code: i32,
        terminated: bool,
        killed: bool,
    }

    impl FakeControl {
        fn new(polls_left: u32, code: i32) -> Self {
            Self {
                polls_left,
                code,
                terminated: false,
                killed: false,
            }
        }
    }

    impl ProcessControl for FakeControl {
        fn try_wait(&mut self) -> Result<Option<i32>> {
            if self.killed || self.terminated || self.polls_left == 0 {
                Ok(Some(self.code))
            } else {
                self.polls_left -= 1;
                Ok(None)
            }
        }

        fn terminate(&mut self) -> Result<()> {
            self.terminated = true;
            Ok(())
        }

        fn kill(&mut self) -> Result<()> {
            self.killed = true;
            Ok(())
        }
    }

    fn handle(control: FakeControl) -> ProcessHandle {
        ProcessHandle::new(
            Box::new(control),
            OutputCollector::new(false),
            "fake".into(),
        )
        .unwrap()
    }

    #[test]
    fn test_starts_running() {
        let mut h = handle(FakeControl::new(5, 0));
        assert!(h.is_running());
        assert!(matches!(h.returncode(), Err(ExecError::NotFinished)));
    }

    #[test]
    fn test_wait_reaches_finished() {
        let mut h = handle(FakeControl::new(2, 0));
        h.wait(None).unwrap();
        assert_eq!(h.poll().unwrap(), ProcessState::Finished);
        assert_eq!(h.returncode().unwrap(), 0);
    }

    #[test]
    fn test_wait_timeout_keeps_handle_valid() {
        let mut h = handle(FakeControl::new(u32::MAX, 0));
        let err = h.wait(Some(Duration::from_millis(120))).unwrap_err();
        assert!(matches!(err, ExecError::Timeout));
        assert!(h.is_running());
    }

    #[test]
    fn test_kill_yields_killed_state() {
        let mut h = handle(FakeControl::new(u32::MAX, -9));
        h.kill().unwrap();
        assert_eq!(h.poll().unwrap(), ProcessState::Killed);
        assert_eq!(h.returncode().unwrap(), -9);
    }

    #[test]
    fn test_kill_after_exit_is_noop() {
        let mut h = handle(FakeControl::new(0, 0));
        h.wait(None).unwrap();
        h.kill().unwrap();
        // Natural exit observed first wins; state stays Finished.
        assert_eq!(h.poll().unwrap(), ProcessState::Finished);
    }

    #[test]
    fn test_stop_uses_graceful_path() {
        let mut h = handle(FakeControl::new(u32::MAX, -15));
        h.stop(Duration::from_secs(1)).unwrap();
        assert_eq!(h.poll().unwrap(), ProcessState::Killed);
        assert_eq!(h.returncode().unwrap(), -15);
    }

    #[test]
    fn test_wait_or_kill_timeout_returns_output() {
        let mut h = handle(FakeControl::new(u32::MAX, -9));
        let out = h.wait_or_kill(Some(Duration::from_millis(50))).unwrap();
        assert_eq!(out.stdout, "");
        assert_eq!(h.poll().unwrap(), ProcessState::Killed);
    }
}
