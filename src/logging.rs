//! Diagnostic logging setup.
//!
//! Records go to stderr, never to stdout: a crate whose job is
//! capturing command output must not write diagnostics into the stream
//! callers inspect. Filtering honors `RUST_LOG` when set and falls back
//! to [`DEFAULT_DIRECTIVES`] otherwise.

use tracing_subscriber::{fmt, EnvFilter};

/// Filter applied when `RUST_LOG` is unset. Spawn and exit events are
/// logged at debug level; raise it per target to see them, e.g.
/// `RUST_LOG=cmdbridge=debug`.
pub const DEFAULT_DIRECTIVES: &str = "cmdbridge=info";

fn env_filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Install the global subscriber.
///
/// # Panics
///
/// Panics when a subscriber is already installed; embedders that may
/// have set their own should use [`try_init`].
pub fn init() {
    init_with_directives(DEFAULT_DIRECTIVES);
}

/// Install the global subscriber with an explicit fallback filter,
/// still overridable through `RUST_LOG`.
pub fn init_with_directives(directives: &str) {
    fmt()
        .with_env_filter(env_filter(directives))
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// Fallible variant of [`init`]; errs when a subscriber is already
/// installed.
pub fn try_init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    fmt()
        .with_env_filter(env_filter(DEFAULT_DIRECTIVES))
        .with_writer(std::io::stderr)
        .compact()
        .try_init()
}
