//! Core dump collection for locally spawned commands.

use std::path::{Path, PathBuf};

/// Signals whose default action includes producing a core dump, per
/// signal(7).
#[cfg(unix)]
const CORE_SIGNALS: [i32; 10] = [
    libc::SIGABRT,
    libc::SIGBUS,
    libc::SIGFPE,
    libc::SIGILL,
    libc::SIGQUIT,
    libc::SIGSEGV,
    libc::SIGSYS,
    libc::SIGTRAP,
    libc::SIGXCPU,
    libc::SIGXFSZ,
];

/// Configuration for collecting a core dump from a crashed command.
///
/// The child's `RLIMIT_CORE` is raised before exec. After the process
/// dies on a core-producing signal, a `core.<pid>` file in the working
/// directory is moved to the configured output file; when the kernel
/// routed the dump to systemd instead, `coredumpctl dump` is used as a
/// fallback.
///
/// Only supported by the local executor.
#[derive(Debug, Clone)]
pub struct Coredump {
    output_file: Option<PathBuf>,
    core_limit: Option<u64>,
}

impl Default for Coredump {
    fn default() -> Self {
        Self::new()
    }
}

impl Coredump {
    /// Configuration with an unlimited core size and no output file.
    pub fn new() -> Self {
        Self {
            output_file: None,
            core_limit: None,
        }
    }

    /// Set where the core file should end up. Without an output file
    /// the limit is still raised but no dump is collected.
    pub fn output_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.output_file = Some(file.into());
        self
    }

    /// Cap the core file size, as for `ulimit -c`. `None` (the default)
    /// means unlimited.
    pub fn core_limit(mut self, limit: Option<u64>) -> Self {
        self.core_limit = limit;
        self
    }

    /// Where the collected dump will be placed, if configured.
    pub fn dump_file(&self) -> Option<&Path> {
        self.output_file.as_deref()
    }

    /// Whether an exit code reports death by a core-producing signal.
    /// Signal deaths carry a negative code.
    #[cfg(unix)]
    pub(crate) fn signal_dumps_core(code: i32) -> bool {
        code < 0 && CORE_SIGNALS.contains(&-code)
    }

    /// The rlimit value to install in the child before exec.
    #[cfg(unix)]
    pub(crate) fn rlimit(&self) -> libc::rlim_t {
        match self.core_limit {
            Some(limit) => limit as libc::rlim_t,
            None => libc::RLIM_INFINITY,
        }
    }

    /// Collect the dump of a process that died with `code`, moving
    /// `core.<pid>` (or the journal copy) to the output file.
    #[cfg(unix)]
    pub(crate) fn collect(&self, pid: u32, code: i32) {
        if !Self::signal_dumps_core(code) {
            return;
        }
        let Some(output) = &self.output_file else {
            return;
        };

        let core = PathBuf::from(format!("core.{pid}"));
        if core.is_file() {
            if let Err(e) = std::fs::rename(&core, output) {
                tracing::warn!(core = %core.display(), error = %e, "failed to move core file");
            }
            return;
        }

        // No core.<pid> file; the dump may have landed in the journal.
        if unsafe { libc::geteuid() } != 0 {
            tracing::warn!(
                "unable to store coredump, root permissions are required to \
                 retrieve it from the journal"
            );
        }
        let status = std::process::Command::new("coredumpctl")
            .args(["dump", &pid.to_string(), "-o"])
            .arg(output)
            .output();
        match status {
            Ok(out) if out.status.success() => {}
            Ok(out) => tracing::warn!(
                code = out.status.code().unwrap_or(-1),
                "coredumpctl could not extract the dump"
            ),
            Err(e) => tracing::warn!(error = %e, "failed to run coredumpctl"),
        }
    }
}
