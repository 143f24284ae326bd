//! # cmdbridge
//!
//! Uniform command execution on local and remote targets.
//!
//! This crate runs commands either as direct child processes or over
//! SSH on a remote host, behind one spawn surface. Callers describe an
//! invocation once and point it at any executor.
//!
//! ## Features
//!
//! - **Two backends**: local `std::process` children and remote SSH
//!   channels with a pty
//! - **Lifecycle tracking**: every spawn yields a handle with a
//!   `Running -> Finished / Killed` state machine
//! - **Three invocation modes**: blocking [`Tool`], background
//!   [`Daemon`], line-streaming [`AsyncTool`]
//! - **Failure policy**: per-invocation control over how non-zero exit
//!   codes are logged and surfaced
//! - **File synchronization**: staging directories kept in sync with
//!   [`Rsync`]
//!
//! ## Quick Start
//!
//! ```no_run
//! use cmdbridge::{Daemon, Tool};
//!
//! fn main() -> cmdbridge::Result<()> {
//!     cmdbridge::logging::try_init().ok();
//!
//!     // Run a command to completion and capture its output.
//!     let result = Tool::new(["uname", "-r"]).run()?;
//!     println!("kernel: {}", result.output.stdout_trimmed());
//!
//!     // Keep a process running in the background.
//!     let mut daemon = Daemon::new(["ping", "-i", "0.2", "localhost"]);
//!     daemon.start()?;
//!     // ... do work ...
//!     daemon.stop()?;
//!
//!     Ok(())
//! }
//! ```

pub mod context;
pub mod coredump;
pub mod error;
pub mod executor;
pub mod invoke;
pub mod logging;
pub mod output;
pub mod process;
pub mod rsync;
pub mod service;
pub mod strace;

// Re-export commonly used types
pub use context::{CommandLine, ExecutionContext, FailureVerbosity, OutputSink};
pub use coredump::Coredump;
pub use error::{ExecError, Result};
pub use executor::{
    local, shared, ConnectionInfo, Executor, LocalExecutor, RemoteExecutor, SharedExecutor,
};
pub use invoke::{AsyncTool, Daemon, RunResult, Tool};
pub use output::{CapturedOutput, OutputLines};
pub use process::{ProcessHandle, ProcessState};
pub use rsync::Rsync;
pub use service::Service;
pub use strace::Strace;
