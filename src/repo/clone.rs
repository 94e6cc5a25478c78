//! Clone primitive: fetch a repository into the clone folder.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// Classification of a clone attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneStatus {
    Success,
    /// The destination folder already exists; nothing was fetched.
    FolderExists,
    /// The repository is private, deleted, or never existed.
    PrivateOrNonexistent,
    /// The primary checkout succeeded but at least one submodule did not.
    SubmodulesFailed,
    Unknown,
    Timeout,
}

/// Result of a clone attempt.
#[derive(Debug, Clone)]
pub struct CloneOutcome {
    pub status: CloneStatus,
    /// Output of the clone tool, kept for diagnostics.
    pub captured_output: Option<String>,
    pub elapsed: Duration,
}

impl CloneOutcome {
    pub fn new(status: CloneStatus) -> Self {
        Self {
            status,
            captured_output: None,
            elapsed: Duration::ZERO,
        }
    }

    /// True when a usable primary checkout exists.
    pub fn is_success(&self) -> bool {
        matches!(self.status, CloneStatus::Success | CloneStatus::SubmodulesFailed)
    }
}

/// Parameters of a clone attempt.
#[derive(Debug, Clone)]
pub struct CloneRequest {
    pub owner: String,
    pub name: String,
    pub clone_folder: PathBuf,
    pub folder_name: String,
    pub timeout: Option<Duration>,
    pub recursive: bool,
}

impl CloneRequest {
    /// Destination directory of the checkout.
    pub fn destination(&self) -> PathBuf {
        self.clone_folder.join(&self.folder_name)
    }
}

/// Fetches repositories and reports the checked-out commit.
///
/// Implementations must not leave a partial destination directory behind on
/// failure, except for `SubmodulesFailed` where the primary checkout is kept.
#[async_trait]
pub trait RepoCloner: Send + Sync {
    async fn clone_repo(&self, request: &CloneRequest) -> CloneOutcome;

    /// Resolved commit hash of the tree at `repo_path`.
    async fn head_commit(&self, repo_path: &Path) -> anyhow::Result<String>;
}

/// `git clone` based implementation.
#[derive(Debug, Clone)]
pub struct GitCloner {
    base_url: String,
    shallow: bool,
    git: Vec<String>,
}

impl GitCloner {
    pub fn new() -> Self {
        Self {
            base_url: "https://github.com".to_string(),
            shallow: true,
            git: vec!["git".to_string()],
        }
    }

    /// Replace the git invocation (program followed by leading arguments).
    pub fn with_git_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let command: Vec<String> = command.into_iter().map(Into::into).collect();
        if !command.is_empty() {
            self.git = command;
        }
        self
    }

    fn git(&self) -> Command {
        let mut command = Command::new(&self.git[0]);
        command.args(&self.git[1..]);
        command
    }

    /// Clone from a different host, e.g. a mirror.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Fetch full history instead of a depth-1 clone.
    pub fn with_full_history(mut self) -> Self {
        self.shallow = false;
        self
    }

    fn url(&self, owner: &str, name: &str) -> String {
        format!("{}/{}/{}.git", self.base_url.trim_end_matches('/'), owner, name)
    }
}

impl Default for GitCloner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RepoCloner for GitCloner {
    async fn clone_repo(&self, request: &CloneRequest) -> CloneOutcome {
        let start = Instant::now();
        let destination = request.destination();
        if destination.exists() {
            return CloneOutcome::new(CloneStatus::FolderExists);
        }
        if let Err(e) = tokio::fs::create_dir_all(&request.clone_folder).await {
            return CloneOutcome {
                status: CloneStatus::Unknown,
                captured_output: Some(format!("cannot create clone folder: {e}")),
                elapsed: start.elapsed(),
            };
        }

        let mut command = self.git();
        command.arg("clone");
        if self.shallow {
            command.arg("--depth=1");
        }
        if request.recursive {
            command.args(["--recursive", "--shallow-submodules"]);
        }
        command
            .arg(self.url(&request.owner, &request.name))
            .arg(&destination)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!(repo = %format!("{}/{}", request.owner, request.name), "git clone");

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return CloneOutcome {
                    status: CloneStatus::Unknown,
                    captured_output: Some(format!("failed to spawn git: {e}")),
                    elapsed: start.elapsed(),
                }
            }
        };

        let waited = match request.timeout {
            Some(timeout) => tokio::time::timeout(timeout, child.wait_with_output()).await,
            None => Ok(child.wait_with_output().await),
        };

        let outcome = match waited {
            Err(_) => CloneOutcome {
                status: CloneStatus::Timeout,
                captured_output: None,
                elapsed: start.elapsed(),
            },
            Ok(Err(e)) => CloneOutcome {
                status: CloneStatus::Unknown,
                captured_output: Some(e.to_string()),
                elapsed: start.elapsed(),
            },
            Ok(Ok(output)) => {
                let mut text = String::from_utf8_lossy(&output.stdout).to_string();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                let primary_ok = destination.join(".git").exists();
                let status = classify(output.status.success(), &text, primary_ok);
                CloneOutcome {
                    status,
                    captured_output: Some(text),
                    elapsed: start.elapsed(),
                }
            }
        };

        if !outcome.is_success() && destination.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&destination).await {
                debug!(path = %destination.display(), error = %e, "Failed to remove partial clone");
            }
        }
        outcome
    }

    async fn head_commit(&self, repo_path: &Path) -> anyhow::Result<String> {
        let output = self
            .git()
            .args(["rev-parse", "HEAD"])
            .current_dir(repo_path)
            .output()
            .await?;
        if !output.status.success() {
            anyhow::bail!(
                "git rev-parse HEAD failed in {}: {}",
                repo_path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Classify a finished `git clone` from its exit status and output.
pub fn classify(exited_ok: bool, output: &str, primary_checked_out: bool) -> CloneStatus {
    let submodule_failed = output.contains("Failed to recurse into submodule")
        || (output.contains("fatal: clone of") && output.contains("submodule path"));
    if submodule_failed && primary_checked_out {
        return CloneStatus::SubmodulesFailed;
    }
    if exited_ok {
        return CloneStatus::Success;
    }
    const PRIVATE_MARKERS: [&str; 4] = [
        "Repository not found",
        "could not read Username",
        "terminal prompts disabled",
        "Authentication failed",
    ];
    if PRIVATE_MARKERS.iter().any(|m| output.contains(m)) {
        return CloneStatus::PrivateOrNonexistent;
    }
    CloneStatus::Unknown
}
