//! Management of systemd services through `systemctl`.

use std::time::{Duration, Instant};

use crate::context::FailureVerbosity;
use crate::error::{ExecError, Result};
use crate::executor::{self, SharedExecutor};
use crate::invoke::Tool;

const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);
const CONDITION_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A systemd service on an execution target.
///
/// Allows the service to be started and stopped, and exposes its
/// activity status and exit code. On a failed start the recent journal
/// entries are logged.
pub struct Service {
    name: String,
    executor: SharedExecutor,
    start_timeout: Duration,
    stop_timeout: Duration,
    started_at: Option<String>,
}

impl Service {
    /// A service by unit name, managed on the local machine.
    pub fn new(name: impl Into<String>) -> Self {
        Self::on(name, executor::local())
    }

    /// A service managed through the given executor.
    pub fn on(name: impl Into<String>, executor: SharedExecutor) -> Self {
        Self {
            name: name.into(),
            executor,
            start_timeout: DEFAULT_START_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            started_at: None,
        }
    }

    /// How long a blocking start waits for the service to come up.
    pub fn start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    /// How long a blocking stop waits for the service to go down.
    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn systemctl(&self, args: &[&str], verbosity: FailureVerbosity) -> Result<String> {
        let mut argv = vec!["systemctl".to_string()];
        argv.extend(args.iter().map(|a| a.to_string()));
        let result = Tool::new(argv)
            .executor(std::sync::Arc::clone(&self.executor))
            .failure_verbosity(verbosity)
            .run()?;
        Ok(result.output.stdout)
    }

    /// Whether the service is currently active.
    pub fn is_active(&self) -> Result<bool> {
        // `is-active` exits non-zero for every state but active.
        let stdout = self.systemctl(
            &["is-active", &self.name],
            FailureVerbosity::NoException,
        )?;
        Ok(stdout.trim() == "active")
    }

    /// Exit code of the service's main process.
    ///
    /// Only meaningful after a start and once the service is no longer
    /// active; fails with [`ExecError::NotFinished`] otherwise.
    pub fn returncode(&self) -> Result<i32> {
        if self.started_at.is_none() {
            return Err(ExecError::NotFinished);
        }
        if self.is_active()? {
            return Err(ExecError::NotFinished);
        }

        let stdout = self.systemctl(
            &["show", &self.name, "--property", "ExecMainStatus"],
            FailureVerbosity::Normal,
        )?;
        let code = stdout
            .trim()
            .split('=')
            .nth(1)
            .and_then(|v| v.parse::<i32>().ok())
            .ok_or_else(|| {
                ExecError::Spawn(format!(
                    "unexpected systemctl show output for {}: {stdout}",
                    self.name
                ))
            })?;
        Ok(code)
    }

    /// Start the service. A blocking start waits until the unit reports
    /// active, up to the start timeout.
    pub fn start(&mut self, blocking: bool) -> Result<()> {
        self.started_at = Some(journal_timestamp());
        if let Err(e) = self.systemctl(&["start", &self.name], FailureVerbosity::Normal) {
            self.log_failure();
            return Err(e);
        }

        if blocking && !self.wait_until(self.start_timeout, |s| s.is_active())? {
            self.log_failure();
            return Err(ExecError::Timeout);
        }
        Ok(())
    }

    /// Stop the service. A blocking stop waits until the unit is no
    /// longer active, up to the stop timeout.
    pub fn stop(&mut self, blocking: bool) -> Result<()> {
        if let Err(e) = self.systemctl(&["stop", &self.name], FailureVerbosity::Normal) {
            self.log_failure();
            return Err(e);
        }

        if blocking && !self.wait_until(self.stop_timeout, |s| Ok(!s.is_active()?))? {
            self.log_failure();
            return Err(ExecError::Timeout);
        }
        Ok(())
    }

    fn wait_until(
        &self,
        timeout: Duration,
        condition: impl Fn(&Self) -> Result<bool>,
    ) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if condition(self)? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(CONDITION_POLL_INTERVAL);
        }
    }

    /// Log the unit's journal since the last start attempt.
    fn log_failure(&self) {
        let Some(since) = &self.started_at else {
            return;
        };
        let argv: Vec<String> = vec![
            "journalctl".into(),
            "-u".into(),
            self.name.clone(),
            "--since".into(),
            since.clone(),
        ];
        let journal = Tool::new(argv)
            .executor(std::sync::Arc::clone(&self.executor))
            .failure_verbosity(FailureVerbosity::NoException)
            .run();
        match journal {
            Ok(result) => {
                tracing::debug!(service = %self.name, journal = %result.output.stdout, "service journal");
            }
            Err(e) => tracing::debug!(service = %self.name, error = %e, "could not read journal"),
        }
    }
}

/// Wall-clock timestamp in the format journalctl's `--since` expects.
fn journal_timestamp() -> String {
    // Seconds since the epoch; journalctl accepts `@<seconds>`.
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format!("@{}", now.as_secs())
}
