//! Execution backends.
//!
//! An [`Executor`] turns an [`ExecutionContext`] into a running
//! [`ProcessHandle`]. The two backends, [`LocalExecutor`] and
//! [`RemoteExecutor`], expose the same spawn surface so callers can be
//! written once and pointed at either target.

mod local;
mod remote;

pub use local::LocalExecutor;
pub use remote::{ConnectionInfo, RemoteExecutor};

use std::sync::{Arc, Mutex};

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::process::ProcessHandle;

/// A backend that can spawn commands.
pub trait Executor: Send {
    /// Start the command described by `ctx` without waiting for it.
    ///
    /// The context is only borrowed, so it can be reused for repeated
    /// invocations.
    fn spawn(&mut self, ctx: &ExecutionContext) -> Result<ProcessHandle>;

    /// Target description for logs: `localhost` or `user@host`.
    fn target(&self) -> String;

    /// Connection parameters when the target is a remote host, `None`
    /// for the local machine. File synchronization uses this to decide
    /// between plain copies and rsync over SSH.
    fn remote_connection(&self) -> Option<ConnectionInfo> {
        None
    }
}

/// An executor shared between invocations and threads.
pub type SharedExecutor = Arc<Mutex<dyn Executor>>;

/// Wrap any executor for shared use.
pub fn shared(executor: impl Executor + 'static) -> SharedExecutor {
    Arc::new(Mutex::new(executor))
}

/// A shared executor for the local machine.
pub fn local() -> SharedExecutor {
    shared(LocalExecutor::new())
}

/// Name of the invoking user. Under sudo this is the original user
/// (`SUDO_USER`), not root.
pub(crate) fn real_user() -> Option<String> {
    std::env::var("SUDO_USER")
        .or_else(|_| std::env::var("USER"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_target() {
        assert_eq!(LocalExecutor::new().target(), "localhost");
    }

    #[test]
    fn test_shared_executor_is_send() {
        fn assert_send_sync<T: Send + Sync>(_: &T) {}
        let executor = local();
        assert_send_sync(&executor);
    }
}
