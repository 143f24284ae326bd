//! Per-invocation execution context.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::coredump::Coredump;
use crate::strace::Strace;

/// A command to be executed, either as an argument vector or as a
/// shell string.
///
/// The argument-vector form is preferred: it is executed directly on the
/// local machine without shell interpretation. The shell-string form is
/// passed to `sh -c`. Remote execution always goes through `sh -c`
/// regardless of the form.
#[derive(Debug, Clone)]
pub enum CommandLine {
    /// Command and arguments, executed directly.
    Argv(Vec<String>),
    /// Shell command string, executed via `sh -c`.
    Shell(String),
}

impl CommandLine {
    /// Human-readable representation used in logs and error messages.
    pub fn display(&self) -> String {
        match self {
            CommandLine::Argv(argv) => argv.join(" "),
            CommandLine::Shell(s) => s.clone(),
        }
    }

    /// Render the command as a single shell string.
    ///
    /// Argument vectors are joined with shell quoting applied so the
    /// result can be handed to a remote `sh -c` safely.
    pub fn shell_string(&self) -> String {
        match self {
            CommandLine::Argv(argv) => {
                let words: Vec<&str> = argv.iter().map(|s| s.as_str()).collect();
                shlex::try_join(words).unwrap_or_else(|_| argv.join(" "))
            }
            CommandLine::Shell(s) => s.clone(),
        }
    }

    /// Render the command as an argument vector for direct local spawn.
    ///
    /// Shell strings become `["sh", "-c", <string>]`.
    pub fn argv(&self) -> Vec<String> {
        match self {
            CommandLine::Argv(argv) => argv.clone(),
            CommandLine::Shell(s) => vec!["sh".into(), "-c".into(), s.clone()],
        }
    }

    /// Append arguments to the command.
    ///
    /// For the shell-string form the arguments are appended verbatim,
    /// separated by spaces.
    pub fn append<I, S>(&mut self, args: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        match self {
            CommandLine::Argv(argv) => argv.extend(args.into_iter().map(Into::into)),
            CommandLine::Shell(s) => {
                for arg in args {
                    s.push(' ');
                    s.push_str(&arg.into());
                }
            }
        }
    }
}

impl From<&str> for CommandLine {
    fn from(s: &str) -> Self {
        CommandLine::Shell(s.to_string())
    }
}

impl From<String> for CommandLine {
    fn from(s: String) -> Self {
        CommandLine::Shell(s)
    }
}

impl From<Vec<String>> for CommandLine {
    fn from(argv: Vec<String>) -> Self {
        CommandLine::Argv(argv)
    }
}

impl From<Vec<&str>> for CommandLine {
    fn from(argv: Vec<&str>) -> Self {
        CommandLine::Argv(argv.into_iter().map(String::from).collect())
    }
}

impl<const N: usize> From<[&str; N]> for CommandLine {
    fn from(argv: [&str; N]) -> Self {
        CommandLine::Argv(argv.into_iter().map(String::from).collect())
    }
}

/// Destination for one output stream of a spawned command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OutputSink {
    /// Accumulate in an in-memory buffer (default for stdout).
    #[default]
    Capture,
    /// Merge into whatever stdout is routed to (default for stderr).
    ToStdout,
    /// Append to the file at the given path. The file is created if
    /// missing and flushed/closed on every exit path, including kill.
    File(PathBuf),
    /// Drop the output.
    Discard,
}

/// Controls how a non-zero exit code is logged and surfaced.
///
/// The policy is fixed per [`ExecutionContext`] and evaluated only
/// against the final exit code, never against streaming state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureVerbosity {
    /// Log an error and return `ExecutionFailed`.
    #[default]
    Normal,
    /// Log at debug level only, still return `ExecutionFailed`.
    NoError,
    /// Log at debug level only, do not return an error; the caller must
    /// inspect the exit code.
    NoException,
    /// No logging, no error.
    Silent,
}

impl FailureVerbosity {
    /// Whether a non-zero exit code turns into an `ExecutionFailed` error.
    pub fn raises(&self) -> bool {
        matches!(self, FailureVerbosity::Normal | FailureVerbosity::NoError)
    }

    /// Whether a non-zero exit code is logged at all.
    pub fn logs(&self) -> bool {
        !matches!(self, FailureVerbosity::Silent)
    }
}

/// Per-invocation state consumed by an executor at spawn time.
///
/// Mutable until the process starts; the spawning executor only borrows
/// it, so one context can be reused for repeated invocations.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    command: CommandLine,
    cwd: Option<PathBuf>,
    env: Option<HashMap<String, String>>,
    sudo: bool,
    netns: Option<String>,
    stdout: OutputSink,
    stderr: OutputSink,
    failure_verbosity: FailureVerbosity,
    strace: Option<Strace>,
    coredump: Option<Coredump>,
    stream_lines: bool,
}

impl ExecutionContext {
    /// Create a context for the given command with default routing:
    /// stdout captured in memory, stderr merged into stdout.
    pub fn new(command: impl Into<CommandLine>) -> Self {
        Self {
            command: command.into(),
            cwd: None,
            env: None,
            sudo: false,
            netns: None,
            stdout: OutputSink::Capture,
            stderr: OutputSink::ToStdout,
            failure_verbosity: FailureVerbosity::Normal,
            strace: None,
            coredump: None,
            stream_lines: false,
        }
    }

    /// Set the working directory. The directory is created on the target
    /// for remote execution, but not for local execution.
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Set the environment mapping.
    ///
    /// Semantics differ by executor: a local spawn uses the mapping as
    /// the child's *entire* environment, while a remote spawn can only
    /// *add* the mapping to the environment inherited on the remote
    /// side. This asymmetry is inherent to the transport and is not
    /// papered over.
    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    /// Set a single environment variable, keeping any existing mapping.
    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Clear the environment mapping. A local spawn then starts with an
    /// empty environment; a remote spawn behaves as if no overlay was
    /// set.
    pub fn clear_env(mut self) -> Self {
        self.env = Some(HashMap::new());
        self
    }

    /// Run the command with privilege escalation (`sudo` prefix).
    pub fn sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    /// Run the command inside a network namespace (`ip netns exec`).
    pub fn netns(mut self, netns: impl Into<String>) -> Self {
        self.netns = Some(netns.into());
        self
    }

    /// Route the output streams.
    ///
    /// If `stderr` is `None` it is merged into the stdout sink.
    pub fn outputs(mut self, stdout: OutputSink, stderr: Option<OutputSink>) -> Self {
        self.stdout = stdout;
        self.stderr = stderr.unwrap_or(OutputSink::ToStdout);
        self
    }

    /// Set the failure-verbosity policy.
    pub fn failure_verbosity(mut self, verbosity: FailureVerbosity) -> Self {
        self.failure_verbosity = verbosity;
        self
    }

    /// Wrap the command with strace. Local executors only.
    pub fn strace(mut self, strace: Strace) -> Self {
        self.strace = Some(strace);
        self
    }

    /// Enable core dump collection for the command. Local executors only.
    pub fn coredump(mut self, coredump: Coredump) -> Self {
        self.coredump = Some(coredump);
        self
    }

    /// Request line-oriented streaming of captured output.
    pub fn stream_lines(mut self, stream: bool) -> Self {
        self.stream_lines = stream;
        self
    }

    /// Append arguments to the command in place.
    pub fn append_arguments<I, S>(&mut self, args: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command.append(args);
    }

    /// Replace the failure-verbosity policy in place.
    pub fn set_failure_verbosity(&mut self, verbosity: FailureVerbosity) {
        self.failure_verbosity = verbosity;
    }

    /// The command itself.
    pub fn command(&self) -> &CommandLine {
        &self.command
    }

    /// Human-readable command representation for logs.
    pub fn command_display(&self) -> String {
        self.command.display()
    }

    /// Argument vector for a direct local spawn, with strace, sudo and
    /// netns wrappers applied (outermost first: netns, sudo, strace).
    pub fn local_argv(&self) -> Vec<String> {
        let mut argv = self.command.argv();

        if let Some(strace) = &self.strace {
            argv = strace.wrap_command(argv);
        }

        if self.sudo {
            argv.insert(0, "sudo".into());
        }

        if let Some(ns) = &self.netns {
            let mut prefix: Vec<String> = ["ip", "netns", "exec"].map(String::from).to_vec();
            prefix.push(ns.clone());
            prefix.extend(argv);
            argv = prefix;
        }

        argv
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn environment(&self) -> Option<&HashMap<String, String>> {
        self.env.as_ref()
    }

    pub fn uses_sudo(&self) -> bool {
        self.sudo
    }

    pub fn network_namespace(&self) -> Option<&str> {
        self.netns.as_deref()
    }

    pub fn stdout_sink(&self) -> &OutputSink {
        &self.stdout
    }

    pub fn stderr_sink(&self) -> &OutputSink {
        &self.stderr
    }

    pub fn verbosity(&self) -> FailureVerbosity {
        self.failure_verbosity
    }

    pub fn strace_wrapper(&self) -> Option<&Strace> {
        self.strace.as_ref()
    }

    pub fn coredump_wrapper(&self) -> Option<&Coredump> {
        self.coredump.as_ref()
    }

    pub fn streams_lines(&self) -> bool {
        self.stream_lines
    }
}
