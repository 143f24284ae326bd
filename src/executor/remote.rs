//! Command execution on a remote host over SSH.
//!
//! Remote commands run over an `ssh2` channel with a pseudo-terminal
//! allocated. The pty is what makes termination possible (an interrupt
//! is written through it), at the cost of merging stderr into stdout.
//! Unlike the local backend, a remote executor runs at most one command
//! at a time; spawning while one is in flight fails with
//! [`ExecError::ExecutorBusy`].

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use ssh2::{Channel, Session};

use crate::context::{ExecutionContext, OutputSink};
use crate::error::{ExecError, Result};
use crate::executor::Executor;
use crate::output::{DrainTarget, OutputCollector};
use crate::process::{ProcessControl, ProcessHandle};

/// How to reach and authenticate against a remote host.
///
/// Authentication precedence: explicit password, then private key file,
/// then a running SSH agent. Without any of the three, connecting fails
/// with an authentication error.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    host: String,
    port: u16,
    user: String,
    password: Option<String>,
    key_file: Option<PathBuf>,
}

impl ConnectionInfo {
    /// Connection to `host` on port 22 as the invoking user (the
    /// original user when running under sudo).
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: super::real_user().unwrap_or_else(|| "root".to_string()),
            password: None,
            key_file: None,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Authenticate with a password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Authenticate with an (unencrypted) private key file.
    pub fn key_file(mut self, key: impl Into<PathBuf>) -> Self {
        self.key_file = Some(key.into());
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn username(&self) -> &str {
        &self.user
    }

    pub(crate) fn auth_password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub(crate) fn auth_key_file(&self) -> Option<&std::path::Path> {
        self.key_file.as_deref()
    }
}

/// Spawns commands on a remote host over a lazily established SSH
/// session. The session is opened on first use and reused afterwards.
pub struct RemoteExecutor {
    conn: ConnectionInfo,
    session: Option<Session>,
    current: Option<Arc<RemoteShared>>,
}

impl RemoteExecutor {
    pub fn new(conn: ConnectionInfo) -> Self {
        Self {
            conn,
            session: None,
            current: None,
        }
    }

    /// The connection parameters this executor was built with.
    pub fn connection(&self) -> &ConnectionInfo {
        &self.conn
    }

    /// Establish the SSH session now instead of on first spawn.
    pub fn connect(&mut self) -> Result<()> {
        self.session()?;
        Ok(())
    }

    /// Tear down the SSH session. A later spawn reconnects.
    pub fn close(&mut self) {
        self.current = None;
        if let Some(session) = self.session.take() {
            let _ = session.disconnect(None, "closing", None);
        }
    }

    fn session(&mut self) -> Result<Session> {
        if let Some(session) = &self.session {
            return Ok(session.clone());
        }

        let tcp = TcpStream::connect((self.conn.host.as_str(), self.conn.port))?;
        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.handshake()?;
        self.authenticate(&session)?;
        tracing::info!(
            host = %self.conn.host,
            user = %self.conn.user,
            "SSH session established"
        );
        self.session = Some(session.clone());
        Ok(session)
    }

    fn authenticate(&self, session: &Session) -> Result<()> {
        if let Some(password) = &self.conn.password {
            session
                .userauth_password(&self.conn.user, password)
                .map_err(|e| ExecError::Auth(format!("password auth failed: {e}")))?;
        } else if let Some(key) = &self.conn.key_file {
            session
                .userauth_pubkey_file(&self.conn.user, None, key, None)
                .map_err(|e| ExecError::Auth(format!("key auth failed: {e}")))?;
        } else if std::env::var_os("SSH_AUTH_SOCK").is_some() {
            session
                .userauth_agent(&self.conn.user)
                .map_err(|e| ExecError::Auth(format!("agent auth failed: {e}")))?;
        } else {
            return Err(ExecError::Auth(
                "no password or key file configured and no SSH agent available".into(),
            ));
        }

        if !session.authenticated() {
            return Err(ExecError::Auth(format!(
                "authentication as {} failed",
                self.conn.user
            )));
        }
        Ok(())
    }

    /// Run a short setup command synchronously over its own channel.
    fn run_setup(&mut self, cmd: &str) -> Result<i32> {
        let session = self.session()?;
        let mut channel = session.channel_session()?;
        channel.exec(cmd)?;
        let mut out = String::new();
        channel.read_to_string(&mut out)?;
        channel.wait_close()?;
        Ok(channel.exit_status()?)
    }
}

impl Executor for RemoteExecutor {
    fn spawn(&mut self, ctx: &ExecutionContext) -> Result<ProcessHandle> {
        if let Some(current) = &self.current {
            if !current.finished.load(Ordering::Acquire) {
                return Err(ExecError::ExecutorBusy);
            }
        }
        if ctx.strace_wrapper().is_some() {
            return Err(ExecError::Unsupported("strace on remote executors"));
        }
        if ctx.coredump_wrapper().is_some() {
            return Err(ExecError::Unsupported(
                "core dump collection on remote executors",
            ));
        }
        // The pty merges stderr into stdout before it reaches us.
        if *ctx.stderr_sink() != OutputSink::ToStdout {
            return Err(ExecError::Unsupported(
                "separate stderr routing on remote executors",
            ));
        }

        let mut collector = OutputCollector::new(true);
        let target = match ctx.stdout_sink() {
            OutputSink::Capture => DrainTarget::Buffer(collector.stdout_buffer()),
            OutputSink::File(path) => {
                let file = crate::output::open_sink_file(path).map_err(|e| {
                    ExecError::Spawn(format!("cannot open output file {}: {}", path.display(), e))
                })?;
                DrainTarget::File(file)
            }
            OutputSink::Discard => DrainTarget::Discard,
            OutputSink::ToStdout => {
                return Err(ExecError::Unsupported(
                    "terminal passthrough on remote executors",
                ));
            }
        };

        if let Some(dir) = ctx.working_dir() {
            let mut mkdir = format!("mkdir -p {}", dir.display());
            if ctx.uses_sudo() {
                mkdir = format!("sudo {mkdir}");
            }
            let rc = self.run_setup(&mkdir)?;
            if rc != 0 {
                return Err(ExecError::Spawn(format!(
                    "cannot create remote directory {}",
                    dir.display()
                )));
            }
        }

        let cmd = assemble_command(ctx);
        tracing::debug!(host = %self.conn.host, command = %cmd, "spawning remote command");

        let session = self.session()?;
        let mut channel = session.channel_session()?;
        channel.request_pty("xterm", None, None)?;
        channel
            .exec(&cmd)
            .map_err(|e| ExecError::Spawn(format!("{}: {}", ctx.command_display(), e)))?;
        // The drain thread must never block the whole session on an
        // idle channel.
        session.set_blocking(false);

        let lines = if ctx.streams_lines() && *ctx.stdout_sink() == OutputSink::Capture {
            Some(collector.make_stdout_lines())
        } else {
            None
        };

        let shared = Arc::new(RemoteShared {
            io: Mutex::new(ChannelIo { session, channel }),
            exit: Mutex::new(None),
            finished: AtomicBool::new(false),
        });

        let reader = ChannelReader {
            shared: Arc::clone(&shared),
        };
        collector.spawn_drain(reader, target, lines);

        self.current = Some(Arc::clone(&shared));
        let control = RemoteControl { shared };
        ProcessHandle::new(Box::new(control), collector, ctx.command_display())
    }

    fn target(&self) -> String {
        format!("{}@{}", self.conn.user, self.conn.host)
    }

    fn remote_connection(&self) -> Option<ConnectionInfo> {
        Some(self.conn.clone())
    }
}

/// Render the context as the single shell string handed to the remote
/// side, wrappers applied.
fn assemble_command(ctx: &ExecutionContext) -> String {
    let mut cmd = ctx.command().shell_string();

    if let Some(netns) = ctx.network_namespace() {
        cmd = format!("ip netns exec {netns} {cmd}");
    }

    if let Some(dir) = ctx.working_dir() {
        cmd = format!("cd {} && {}", dir.display(), cmd);
    }

    if ctx.uses_sudo() {
        // The whole command becomes the single-quoted argument of an
        // elevated shell; embedded quotes use the '\'' dance.
        let escaped = cmd.replace('\'', "'\\''");
        cmd = format!("sudo -E sh -c '{escaped}'");
    }

    // The overlay is additive on the remote side; exported variables
    // join whatever environment the login shell provides.
    if let Some(env) = ctx.environment() {
        if !env.is_empty() {
            let mut pairs: Vec<(&String, &String)> = env.iter().collect();
            pairs.sort();
            let exports: Vec<String> = pairs
                .iter()
                .map(|(key, value)| {
                    let quoted = shlex::try_quote(value)
                        .map(|q| q.into_owned())
                        .unwrap_or_else(|_| format!("'{}'", value.replace('\'', "'\\''")));
                    format!("export {key}={quoted}")
                })
                .collect();
            cmd = format!("{} && {}", exports.join(" && "), cmd);
        }
    }

    cmd
}

/// Session and channel of one in-flight remote command. All channel
/// traffic, from the drain thread and from control calls alike, is
/// serialized through the mutex.
struct ChannelIo {
    session: Session,
    channel: Channel,
}

struct RemoteShared {
    io: Mutex<ChannelIo>,
    exit: Mutex<Option<i32>>,
    finished: AtomicBool,
}

/// Reads the merged pty stream for the drain thread and harvests the
/// exit status at end of stream.
struct ChannelReader {
    shared: Arc<RemoteShared>,
}

impl ChannelReader {
    fn finish(&self, io: &mut ChannelIo) {
        io.session.set_blocking(true);
        let _ = io.channel.wait_close();
        let code = match io.channel.exit_signal() {
            // A signal death carries no numeric exit status over the
            // wire; -1 stands in for it.
            Ok(sig) if sig.exit_signal.is_some() => -1,
            _ => io.channel.exit_status().unwrap_or(-1),
        };
        *self.shared.exit.lock().unwrap_or_else(|e| e.into_inner()) = Some(code);
        self.shared.finished.store(true, Ordering::Release);
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut io = self.shared.io.lock().unwrap_or_else(|e| e.into_inner());
        match io.channel.read(buf) {
            Ok(0) => {
                self.finish(&mut io);
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(e),
            Err(_) => {
                // Channel torn down under us (e.g. by a kill); treat it
                // as end of stream and pick up whatever status exists.
                self.finish(&mut io);
                Ok(0)
            }
        }
    }
}

struct RemoteControl {
    shared: Arc<RemoteShared>,
}

impl ProcessControl for RemoteControl {
    fn try_wait(&mut self) -> Result<Option<i32>> {
        if self.shared.finished.load(Ordering::Acquire) {
            Ok(*self.shared.exit.lock().unwrap_or_else(|e| e.into_inner()))
        } else {
            Ok(None)
        }
    }

    fn terminate(&mut self) -> Result<()> {
        if self.shared.finished.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut io = self.shared.io.lock().unwrap_or_else(|e| e.into_inner());
        io.session.set_blocking(true);
        // An interrupt through the pty, as ^C would in an interactive
        // session.
        let result = io
            .channel
            .write_all(&[0x03])
            .and_then(|()| io.channel.flush());
        io.session.set_blocking(false);
        if let Err(e) = result {
            tracing::debug!(error = %e, "interrupt write failed, process likely gone");
        }
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        if self.shared.finished.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut io = self.shared.io.lock().unwrap_or_else(|e| e.into_inner());
        io.session.set_blocking(true);
        let result = io.channel.close();
        io.session.set_blocking(false);
        if let Err(e) = result {
            tracing::debug!(error = %e, "channel close failed, process likely gone");
        }
        Ok(())
    }
}
