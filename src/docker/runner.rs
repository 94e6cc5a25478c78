//! Run a single command inside a fresh container.
//!
//! The compile image's entry point switches to the uid/gid found in
//! `LOCAL_USER_ID` / `LOCAL_GROUP_ID` and then execs its arguments, so files
//! written to bind mounts end up owned by the mapped host user.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ContainerError;

/// Image used for compilation unless overridden on the command line.
pub const DEFAULT_IMAGE: &str = "gcc-custom";

/// Exit code returned by coreutils `timeout` when the deadline expires.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Extra time the host waits past the in-container deadline before killing the client.
const HOST_GRACE: Duration = Duration::from_secs(30);

static HOST_IDENTITY: OnceCell<(u32, u32)> = OnceCell::const_new();

/// Identity the containerized command runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContainerUser {
    /// The invoking host user and group, resolved at run time.
    #[default]
    Current,
    /// The container's root user; no identity mapping is applied.
    Root,
    /// An explicit uid, paired with the host user's group.
    Uid(u32),
    /// An explicit uid and gid.
    UidGid(u32, u32),
}

/// A command to run in a container, with its mounts and limits.
#[derive(Debug, Clone)]
pub struct ContainerCommand {
    /// Shell command line executed inside the container.
    pub command: String,
    /// Working directory inside the container.
    pub cwd: Option<String>,
    /// Identity to run as.
    pub user: ContainerUser,
    /// Host directory to container path bind mounts (read-write).
    pub mounts: Vec<(PathBuf, String)>,
    /// Wall-clock limit enforced inside the container.
    pub timeout: Option<Duration>,
}

impl ContainerCommand {
    /// Creates a command from a shell command line.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            cwd: None,
            user: ContainerUser::Current,
            mounts: Vec::new(),
            timeout: None,
        }
    }

    /// Creates a command from an argument list. Each argument is quoted, so
    /// spaces and shell metacharacters reach the program verbatim.
    pub fn from_args<S: AsRef<str>>(args: &[S]) -> Self {
        let joined = args
            .iter()
            .map(|a| shell_quote(a.as_ref()))
            .collect::<Vec<_>>()
            .join(" ");
        Self::new(joined)
    }

    /// Sets the working directory inside the container.
    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Sets the identity to run as.
    pub fn with_user(mut self, user: ContainerUser) -> Self {
        self.user = user;
        self
    }

    /// Adds a read-write bind mount.
    pub fn with_mount(mut self, host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        self.mounts.push((host.into(), container.into()));
        self
    }

    /// Sets the in-container timeout.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Outcome of a container command that ran to completion.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// The full docker command line, for diagnostics.
    pub command: String,
    /// Exit code of the container.
    pub exit_code: i32,
    /// Combined stdout and stderr.
    pub captured_output: Option<String>,
}

impl CommandResult {
    /// Returns true if the command exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs commands inside containers.
#[async_trait]
pub trait ContainerRunner: Send + Sync {
    /// Runs the command and blocks until the container exits or the deadline fires.
    ///
    /// # Errors
    ///
    /// Returns `ContainerError::Timeout` when the timeout expires, never a
    /// generic failure. A non-zero exit code is not an error.
    async fn run(&self, command: &ContainerCommand) -> Result<CommandResult, ContainerError>;
}

/// `docker run --rm` based runner.
#[derive(Debug, Clone)]
pub struct DockerRunner {
    image: String,
    capture_output: bool,
}

impl DockerRunner {
    /// Creates a runner for the given image, capturing output.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            capture_output: true,
        }
    }

    /// Discards container output instead of capturing it.
    pub fn without_capture(mut self) -> Self {
        self.capture_output = false;
        self
    }

    /// Returns the image this runner starts.
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Builds the `docker` argument list for a command.
    ///
    /// `identity` is the already-resolved uid/gid pair, or `None` for root.
    pub fn docker_run_args(
        &self,
        command: &ContainerCommand,
        identity: Option<(u32, u32)>,
        container_name: &str,
    ) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            container_name.to_string(),
        ];

        for (host, container) in &command.mounts {
            args.push("-v".to_string());
            args.push(format!("{}:{}", absolute(host).display(), container));
        }

        if let Some(cwd) = &command.cwd {
            args.push("-w".to_string());
            args.push(cwd.clone());
        }

        if let Some((uid, gid)) = identity {
            args.push("-e".to_string());
            args.push(format!("LOCAL_USER_ID={uid}"));
            args.push("-e".to_string());
            args.push(format!("LOCAL_GROUP_ID={gid}"));
        }

        args.push(self.image.clone());

        if let Some(timeout) = command.timeout {
            args.push("timeout".to_string());
            args.push(format_timeout(timeout));
        }

        args.push("bash".to_string());
        args.push("-c".to_string());
        args.push(command.command.clone());
        args
    }

}

/// Quote a string for `bash -c`.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Unique name for a container started by binforge.
pub fn container_name(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

/// Force-remove a container by name through the given docker client command.
/// Killing the client does not stop the container it started.
pub async fn remove_container(mut docker: Command, name: &str) {
    if let Err(e) = docker
        .args(["rm", "-f", name])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        debug!(container = %name, error = %e, "Failed to remove container");
    }
}

/// Turn a finished container's exit code into the command outcome.
///
/// Exit code 124 is what the in-container `timeout` wrapper returns when the
/// deadline expires, so it is reported as `ContainerError::Timeout` whenever
/// the command had a deadline.
pub fn exit_outcome(
    command_line: String,
    timeout: Option<Duration>,
    exit_code: i32,
    captured_output: Option<String>,
) -> Result<CommandResult, ContainerError> {
    match timeout {
        Some(timeout) if exit_code == TIMEOUT_EXIT_CODE => Err(ContainerError::Timeout {
            command: command_line,
            timeout,
            captured_output,
        }),
        _ => Ok(CommandResult {
            command: command_line,
            exit_code,
            captured_output,
        }),
    }
}

impl Default for DockerRunner {
    fn default() -> Self {
        Self::new(DEFAULT_IMAGE)
    }
}

#[async_trait]
impl ContainerRunner for DockerRunner {
    async fn run(&self, command: &ContainerCommand) -> Result<CommandResult, ContainerError> {
        let identity = resolve_identity(command.user).await?;
        let name = container_name("binforge");
        let args = self.docker_run_args(command, identity, &name);
        let command_line = format!("docker {}", args.join(" "));
        debug!(container = %name, command = %command_line, "Starting container");

        let (stdout, stderr) = if self.capture_output {
            (Stdio::piped(), Stdio::piped())
        } else {
            (Stdio::null(), Stdio::null())
        };
        let child = Command::new("docker")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ContainerError::Spawn {
                command: command_line.clone(),
                source,
            })?;

        let output = match command.timeout {
            Some(timeout) => {
                match tokio::time::timeout(timeout + HOST_GRACE, child.wait_with_output()).await {
                    Ok(output) => output?,
                    Err(_) => {
                        warn!(container = %name, ?timeout, "Container ignored its deadline, removing it");
                        remove_container(Command::new("docker"), &name).await;
                        return Err(ContainerError::Timeout {
                            command: command_line,
                            timeout,
                            captured_output: None,
                        });
                    }
                }
            }
            None => child.wait_with_output().await?,
        };

        let captured_output = if self.capture_output {
            let mut text = String::from_utf8_lossy(&output.stdout).to_string();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            Some(text)
        } else {
            None
        };
        let exit_code = output.status.code().unwrap_or(-1);
        exit_outcome(command_line, command.timeout, exit_code, captured_output)
    }
}

/// Resolves the uid/gid pair to pass to the container, `None` meaning root.
pub async fn resolve_identity(user: ContainerUser) -> Result<Option<(u32, u32)>, ContainerError> {
    match user {
        ContainerUser::Root => Ok(None),
        ContainerUser::UidGid(uid, gid) => Ok(Some((uid, gid))),
        ContainerUser::Uid(uid) => {
            let (_, gid) = host_identity().await?;
            Ok(Some((uid, gid)))
        }
        ContainerUser::Current => Ok(Some(host_identity().await?)),
    }
}

async fn host_identity() -> Result<(u32, u32), ContainerError> {
    HOST_IDENTITY
        .get_or_try_init(|| async {
            let uid = query_id("-u").await?;
            let gid = query_id("-g").await?;
            Ok::<_, ContainerError>((uid, gid))
        })
        .await
        .copied()
}

async fn query_id(flag: &str) -> Result<u32, ContainerError> {
    let output = Command::new("id").arg(flag).output().await?;
    if !output.status.success() {
        return Err(ContainerError::Identity(format!(
            "`id {flag}` exited with {}",
            output.status
        )));
    }
    String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse()
        .map_err(|e| ContainerError::Identity(format!("`id {flag}` returned garbage: {e}")))
}

fn format_timeout(timeout: Duration) -> String {
    if timeout.subsec_nanos() == 0 {
        format!("{}s", timeout.as_secs())
    } else {
        format!("{:.3}s", timeout.as_secs_f64())
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}
