//! Error types for cmdbridge.

use thiserror::Error;

/// Main error type for cmdbridge operations.
#[derive(Error, Debug)]
pub enum ExecError {
    /// The command could not be started at all.
    #[error("failed to spawn command: {0}")]
    Spawn(String),

    /// A remote executor was asked to spawn while a command is in flight.
    #[error("executor busy: previous command has not finished")]
    ExecutorBusy,

    /// The command finished with a non-zero exit code and the failure
    /// policy demands an error.
    #[error("command \"{command}\" has failed with code {code}")]
    ExecutionFailed { command: String, code: i32 },

    /// Exit code was queried while the process is still running.
    #[error("process has not finished yet")]
    NotFinished,

    /// A wait deadline elapsed. The underlying process keeps running.
    #[error("timed out waiting for process")]
    Timeout,

    /// The selected executor does not support a requested capability.
    #[error("unsupported on this executor: {0}")]
    Unsupported(&'static str),

    /// Remote authentication could not be established.
    #[error("authentication error: {0}")]
    Auth(String),

    /// Invalid lifecycle state transition attempted.
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidStateTransition {
        from: crate::process::ProcessState,
        to: crate::process::ProcessState,
    },

    /// Low-level SSH failure.
    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// File synchronization failure.
    #[error("rsync error: {0}")]
    Rsync(String),
}

/// Convenience Result type for cmdbridge operations.
pub type Result<T> = std::result::Result<T, ExecError>;
