//! File synchronization with the execution target.
//!
//! [`Rsync`] keeps a data directory on the target host and moves files
//! in and out of it: plain `cp` when the target is the local machine,
//! `rsync` over SSH when it is remote. Without an explicit data
//! directory a temporary one is created per host and user and reused
//! for the rest of the session.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use crate::context::FailureVerbosity;
use crate::error::{ExecError, Result};
use crate::executor::{self, ConnectionInfo, SharedExecutor};
use crate::invoke::{RunResult, Tool};

/// Session-wide staging directories, keyed by (target, user).
static STORAGES: OnceLock<Mutex<HashMap<(String, String), PathBuf>>> = OnceLock::new();

/// Synchronizes files with the data directory of an execution target.
pub struct Rsync {
    executor: SharedExecutor,
    data_dir: PathBuf,
}

impl Rsync {
    /// Synchronization against the given executor's host, staging into
    /// a per-host, per-user temporary directory that is created on
    /// first use and shared for the rest of the session.
    pub fn new(executor: SharedExecutor) -> Result<Self> {
        let target = executor.lock().unwrap_or_else(|e| e.into_inner()).target();
        let user = executor::real_user().unwrap_or_else(|| "root".to_string());

        let storages = STORAGES.get_or_init(|| Mutex::new(HashMap::new()));
        let mut storages = storages.lock().unwrap_or_else(|e| e.into_inner());

        let key = (target.clone(), user.clone());
        let data_dir = match storages.get(&key) {
            Some(dir) => dir.clone(),
            None => {
                let dir = Self::prepare_storage(&executor, &user)?;
                tracing::debug!(target = %target, dir = %dir.display(), "created staging directory");
                storages.insert(key, dir.clone());
                dir
            }
        };

        Ok(Self { executor, data_dir })
    }

    /// Synchronization against an explicit data directory.
    ///
    /// [`Rsync::wipe_data_directory`] removes everything inside it, so
    /// never point this at a home directory or the working directory.
    pub fn with_data_dir(executor: SharedExecutor, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            executor,
            data_dir: data_dir.into(),
        }
    }

    fn prepare_storage(executor: &SharedExecutor, user: &str) -> Result<PathBuf> {
        let result = Tool::from_context(
            crate::context::ExecutionContext::new(["mktemp", "-d"]),
            Arc::clone(executor),
        )
        .run()
        .map_err(|e| ExecError::Rsync(format!("could not prepare temporary directory: {e}")))?;
        let dir = PathBuf::from(result.output.stdout_trimmed());

        // Under root the directory would be root-only, but the SSH
        // connection runs as the regular user; hand it over while
        // keeping the root group.
        #[cfg(unix)]
        if unsafe { libc::geteuid() } == 0 {
            let argv: Vec<String> = vec![
                "chown".into(),
                "--silent".into(),
                user.into(),
                dir.display().to_string(),
            ];
            Tool::new(argv)
                .executor(Arc::clone(executor))
                .run()
                .map_err(|e| ExecError::Rsync(format!("could not chown staging directory: {e}")))?;
        }
        #[cfg(not(unix))]
        let _ = user;

        Ok(dir)
    }

    /// The data directory on the target host.
    pub fn data_directory(&self) -> &Path {
        &self.data_dir
    }

    /// Create a file in the data directory, optionally with content.
    /// Returns the path of the created file on the target.
    pub fn create_file(&self, name: &str, content: &str) -> Result<PathBuf> {
        let file = self.data_dir.join(name);
        let quoted_file = quote_path(&file);

        self.run_on_target(format!("touch {quoted_file}"))
            .map_err(|e| ExecError::Rsync(format!("could not create file {name}: {e}")))?;

        if !content.is_empty() {
            let quoted = shell_quote(content);
            self.run_on_target(format!("echo {quoted} > {quoted_file}"))
                .map_err(|e| ExecError::Rsync(format!("could not write to file {name}: {e}")))?;
        }

        Ok(file)
    }

    /// Remove a file or directory inside the data directory. Relative
    /// paths are taken relative to the data directory; paths escaping
    /// it are refused.
    pub fn remove_path(&self, target: impl AsRef<Path>) -> Result<()> {
        let target = self.resolve_data_dir_path(target.as_ref())?;
        self.run_on_target(format!("rm -rf {}", quote_path(&target)))
            .map_err(|e| {
                ExecError::Rsync(format!("could not delete {}: {e}", target.display()))
            })?;
        Ok(())
    }

    /// Remove everything inside the data directory, keeping the
    /// directory itself.
    pub fn wipe_data_directory(&self) -> Result<()> {
        // The directory is quoted, the glob stays outside the quotes so
        // it expands on the target.
        self.run_on_target(format!("rm -rf {}/*", quote_path(&self.data_dir)))
            .map_err(|e| ExecError::Rsync(format!("could not wipe data directory: {e}")))?;
        Ok(())
    }

    /// Upload a file or directory into the data directory. Returns the
    /// resulting path on the target.
    ///
    /// `checksum_diff` compares existing remote files by checksum
    /// instead of mod-time and size; slower but exact.
    pub fn push_path(&self, source: impl AsRef<Path>, checksum_diff: bool) -> Result<PathBuf> {
        let source = source.as_ref();

        match self.connection() {
            None => {
                let argv: Vec<String> = vec![
                    "cp".into(),
                    "--recursive".into(),
                    source.display().to_string(),
                    self.data_dir.display().to_string(),
                ];
                Tool::new(argv).run().map_err(|e| {
                    ExecError::Rsync(format!("could not push {}: {e}", source.display()))
                })?;
            }
            Some(conn) => {
                let auth = RsyncAuth::from_connection(&conn)?;
                let checksum = if checksum_diff { "--checksum " } else { "" };
                let cmd = format!(
                    "{}rsync {}--recursive {}{} {}@{}:{}",
                    auth.sshpass,
                    checksum,
                    auth.rsh,
                    source.display(),
                    conn.username(),
                    conn.host(),
                    self.data_dir.display(),
                );
                Tool::new(cmd).run().map_err(|e| {
                    ExecError::Rsync(format!("could not push {}: {e}", source.display()))
                })?;
            }
        }

        Ok(self.data_dir.join(basename(source)?))
    }

    /// Download a file or directory from the data directory into a
    /// local destination directory, which is created if missing.
    /// Returns the resulting local path.
    pub fn pull_path(
        &self,
        source: impl AsRef<Path>,
        destination: impl AsRef<Path>,
    ) -> Result<PathBuf> {
        let source = self.resolve_data_dir_path(source.as_ref())?;
        let destination = destination.as_ref();

        match self.connection() {
            None => {
                let argv: Vec<String> = vec![
                    "cp".into(),
                    "--recursive".into(),
                    source.display().to_string(),
                    destination.display().to_string(),
                ];
                Tool::new(argv).run().map_err(|e| {
                    ExecError::Rsync(format!("could not pull {}: {e}", source.display()))
                })?;
            }
            Some(conn) => {
                let auth = RsyncAuth::from_connection(&conn)?;
                std::fs::create_dir_all(destination).map_err(|e| {
                    ExecError::Rsync(format!(
                        "could not create local directory {}: {e}",
                        destination.display()
                    ))
                })?;

                let restore_owner = self.loan_ownership(&conn, &source)?;

                let cmd = format!(
                    "{}rsync --recursive {}{}@{}:{} {}",
                    auth.sshpass,
                    auth.rsh,
                    conn.username(),
                    conn.host(),
                    source.display(),
                    destination.display(),
                );
                let pulled = Tool::new(cmd).run();

                if let Some(owner) = restore_owner {
                    let _ = self.chown(&owner, &source);
                }
                pulled.map_err(|e| {
                    ExecError::Rsync(format!("could not pull {}: {e}", source.display()))
                })?;
            }
        }

        Ok(destination.join(basename(&source)?))
    }

    /// When running under root, remote files may be root-owned while
    /// the SSH connection runs as the regular user. Hand the path over
    /// for the transfer and return the owner to restore afterwards.
    fn loan_ownership(&self, conn: &ConnectionInfo, source: &Path) -> Result<Option<String>> {
        #[cfg(unix)]
        if unsafe { libc::geteuid() } == 0 {
            let owner = self
                .run_on_target(format!(
                    "stat --dereference --format=%U {}",
                    quote_path(source)
                ))
                .map_err(|e| ExecError::Rsync(format!("could not stat source: {e}")))?;
            let owner = owner.output.stdout_trimmed().to_string();
            self.run_on_target(format!(
                "chown --silent --recursive {} {}",
                conn.username(),
                quote_path(source)
            ))
            .map_err(|e| ExecError::Rsync(format!("could not chown source: {e}")))?;
            return Ok(Some(owner));
        }
        #[cfg(not(unix))]
        let _ = (conn, source);
        Ok(None)
    }

    fn chown(&self, owner: &str, path: &Path) -> Result<RunResult> {
        self.run_on_target(format!(
            "chown --silent --recursive {} {}",
            shell_quote(owner),
            quote_path(path)
        ))
    }

    fn connection(&self) -> Option<ConnectionInfo> {
        self.executor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remote_connection()
    }

    fn run_on_target(&self, command: String) -> Result<RunResult> {
        Tool::new(command)
            .executor(Arc::clone(&self.executor))
            .run()
    }

    /// Resolve a path against the data directory and refuse anything
    /// that lexically escapes it. The check never touches the target
    /// filesystem, so symlinks are not followed.
    fn resolve_data_dir_path(&self, path: &Path) -> Result<PathBuf> {
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        };
        let normalized = lexical_normalize(&joined);
        let base = lexical_normalize(&self.data_dir);

        if normalized == base || !normalized.starts_with(&base) {
            return Err(ExecError::Rsync(format!(
                "path {} is outside the data directory {}",
                path.display(),
                self.data_dir.display()
            )));
        }
        Ok(normalized)
    }
}

/// Authentication fragments for an rsync command line.
struct RsyncAuth {
    sshpass: String,
    rsh: String,
}

impl RsyncAuth {
    fn from_connection(conn: &ConnectionInfo) -> Result<Self> {
        let mut sshpass = String::new();
        let mut rsh = String::new();

        // rsync has no password option of its own; sshpass feeds it.
        if let Some(password) = conn.auth_password() {
            if !binary_available("sshpass")? {
                return Err(ExecError::Rsync("sshpass binary is missing".into()));
            }
            sshpass = format!("sshpass -p {} ", shell_quote(password));
        } else if let Some(key) = conn.auth_key_file() {
            rsh = format!("--rsh='ssh -i {}' ", key.display());
        }

        Ok(Self { sshpass, rsh })
    }
}

/// Whether `name` resolves to an executable on the local machine.
///
/// `command -v` exits non-zero for an unknown name; that is a lookup
/// result, not a failure, so the run itself must stay silent.
fn binary_available(name: &str) -> Result<bool> {
    let result = Tool::new(format!("command -v {}", shell_quote(name)))
        .failure_verbosity(FailureVerbosity::Silent)
        .run()?;
    Ok(result.success())
}

fn basename(path: &Path) -> Result<PathBuf> {
    path.file_name().map(PathBuf::from).ok_or_else(|| {
        ExecError::Rsync(format!("path {} has no file name", path.display()))
    })
}

fn shell_quote(text: &str) -> String {
    shlex::try_quote(text)
        .map(|q| q.into_owned())
        .unwrap_or_else(|_| format!("'{}'", text.replace('\'', "'\\''")))
}

fn quote_path(path: &Path) -> String {
    shell_quote(&path.display().to_string())
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other),
        }
    }
    out
}
