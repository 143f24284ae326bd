//! Syscall tracing of locally spawned commands via strace.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Arguments always passed to strace:
/// detach late, syscall summary, instruction pointer, follow forks,
/// absolute timestamps, time spent in syscalls, fd paths.
const BASE_ARGS: [&str; 7] = ["-DDD", "-C", "-i", "-f", "-tt", "-T", "-y"];

/// Configuration for wrapping a command with `strace`.
///
/// Only supported by the local executor; a remote spawn with strace
/// configured fails with an unsupported-capability error.
#[derive(Debug, Clone, Default)]
pub struct Strace {
    output_file: Option<PathBuf>,
    expressions: BTreeSet<String>,
}

impl Strace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Redirect the trace to a file (strace `-o`).
    pub fn output_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.output_file = Some(file.into());
        self
    }

    /// Add a trace expression (strace `-e`). Multiple expressions are
    /// joined with commas into a single `-e` argument.
    pub fn expression(mut self, expr: impl Into<String>) -> Self {
        self.expressions.insert(expr.into());
        self
    }

    /// Add several trace expressions at once.
    pub fn expressions<I, S>(mut self, exprs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expressions.extend(exprs.into_iter().map(Into::into));
        self
    }

    /// Where the trace will be written, if redirected.
    pub fn trace_file(&self) -> Option<&Path> {
        self.output_file.as_deref()
    }

    fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = BASE_ARGS.map(String::from).to_vec();

        if let Some(file) = &self.output_file {
            args.push("-o".into());
            args.push(file.display().to_string());
        }

        if !self.expressions.is_empty() {
            args.push("-e".into());
            let joined: Vec<&str> = self.expressions.iter().map(|s| s.as_str()).collect();
            args.push(joined.join(","));
        }

        args
    }

    /// Prefix an argument vector so it runs under strace.
    pub fn wrap_command(&self, command: Vec<String>) -> Vec<String> {
        let mut wrapped = vec!["strace".to_string()];
        wrapped.extend(self.args());
        wrapped.extend(command);
        wrapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_plain() {
        let wrapped = Strace::new().wrap_command(vec!["true".into()]);
        assert_eq!(wrapped[0], "strace");
        assert_eq!(wrapped[1..8], BASE_ARGS.map(String::from));
        assert_eq!(wrapped.last().unwrap(), "true");
    }

    #[test]
    fn test_wrap_with_output_file() {
        let wrapped = Strace::new()
            .output_file("/tmp/trace.out")
            .wrap_command(vec!["true".into()]);
        let pos = wrapped.iter().position(|a| a == "-o").unwrap();
        assert_eq!(wrapped[pos + 1], "/tmp/trace.out");
    }

    #[test]
    fn test_expressions_joined_sorted() {
        let wrapped = Strace::new()
            .expression("trace=write")
            .expression("signal=!SIGCHLD")
            .wrap_command(vec!["true".into()]);
        let pos = wrapped.iter().position(|a| a == "-e").unwrap();
        assert_eq!(wrapped[pos + 1], "signal=!SIGCHLD,trace=write");
    }

    #[test]
    fn test_duplicate_expressions_collapse() {
        let strace = Strace::new()
            .expression("trace=open")
            .expressions(["trace=open"]);
        let wrapped = strace.wrap_command(vec!["true".into()]);
        let pos = wrapped.iter().position(|a| a == "-e").unwrap();
        assert_eq!(wrapped[pos + 1], "trace=open");
    }
}
