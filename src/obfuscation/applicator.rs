//! Launcher for the external string obfuscator.
//!
//! The obfuscator image rewrites every C source of a mounted repository in
//! place: string literals (other than header names) are wrapped in the
//! `OBFUSCATED` macro and the obfuscation headers are included. binforge only
//! starts it and checks the outcome afterwards with [`super::contains_marker`].

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::docker::{container_name, remove_container};
use crate::error::ObfuscationError;

/// Default image of the string obfuscator.
pub const DEFAULT_OBFUSCATOR_IMAGE: &str = "adv-obfuscation";

/// Rewrites a repository's sources in place.
#[async_trait]
pub trait SourceObfuscator: Send + Sync {
    async fn obfuscate(&self, repo_path: &Path) -> Result<(), ObfuscationError>;
}

/// Runs the obfuscator image against the repository mounted at `/repos`.
#[derive(Debug, Clone)]
pub struct DockerObfuscator {
    image: String,
    header_lib_path: String,
    timeout: Option<Duration>,
    docker: Vec<String>,
}

impl DockerObfuscator {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            header_lib_path: "Lib".to_string(),
            timeout: None,
            docker: vec!["docker".to_string()],
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the docker client invocation (program followed by leading arguments).
    pub fn with_docker_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let command: Vec<String> = command.into_iter().map(Into::into).collect();
        if !command.is_empty() {
            self.docker = command;
        }
        self
    }

    fn docker_command(&self) -> Command {
        let mut command = Command::new(&self.docker[0]);
        command.args(&self.docker[1..]);
        command
    }

    /// Arguments for `docker` given the absolute repository path and the
    /// container name.
    pub fn docker_args(&self, repo_path: &Path, name: &str) -> Vec<String> {
        vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            name.to_string(),
            "-v".to_string(),
            format!("{}:/repos", repo_path.display()),
            self.image.clone(),
            "--repo-path".to_string(),
            "/repos".to_string(),
            "--header-lib-path".to_string(),
            self.header_lib_path.clone(),
        ]
    }
}

impl Default for DockerObfuscator {
    fn default() -> Self {
        Self::new(DEFAULT_OBFUSCATOR_IMAGE)
    }
}

#[async_trait]
impl SourceObfuscator for DockerObfuscator {
    async fn obfuscate(&self, repo_path: &Path) -> Result<(), ObfuscationError> {
        let repo_path = std::fs::canonicalize(repo_path)?;
        let name = container_name("binforge-obf");
        let args = self.docker_args(&repo_path, &name);
        debug!(image = %self.image, repo = %repo_path.display(), container = %name, "Running obfuscator");

        let child = self
            .docker_command()
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, child.wait_with_output()).await {
                Ok(output) => output?,
                Err(_) => {
                    warn!(container = %name, ?timeout, "Obfuscator timed out, removing container");
                    remove_container(self.docker_command(), &name).await;
                    return Err(ObfuscationError::Timeout(timeout));
                }
            },
            None => child.wait_with_output().await?,
        };

        if !output.status.success() {
            let mut text = String::from_utf8_lossy(&output.stdout).to_string();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(ObfuscationError::Failed {
                code: output.status.code().unwrap_or(-1),
                output: text,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_docker_args() {
        let obfuscator = DockerObfuscator::default();
        let args = obfuscator.docker_args(Path::new("/data/repos/a_____b"), "binforge-obf-1");
        assert_eq!(
            args,
            vec![
                "run",
                "--rm",
                "--name",
                "binforge-obf-1",
                "-v",
                "/data/repos/a_____b:/repos",
                "adv-obfuscation",
                "--repo-path",
                "/repos",
                "--header-lib-path",
                "Lib",
            ]
        );
    }

    /// Client stand-in: logs every invocation, and `run` hangs.
    #[cfg(unix)]
    fn fake_docker(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
        let log = dir.join("docker.log");
        let script = dir.join("docker.sh");
        std::fs::write(
            &script,
            format!(
                "echo \"$@\" >> '{}'\nif [ \"$1\" = run ]; then sleep 30; fi\n",
                log.display()
            ),
        )
        .expect("write script");
        (script, log)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_removes_named_container() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(&repo).expect("mkdir");
        let (script, log) = fake_docker(dir.path());

        let obfuscator = DockerObfuscator::default()
            .with_timeout(Some(Duration::from_millis(300)))
            .with_docker_command(["sh".to_string(), script.display().to_string()]);
        let err = obfuscator.obfuscate(&repo).await.expect_err("should time out");
        assert!(matches!(err, ObfuscationError::Timeout(t) if t == Duration::from_millis(300)));

        let calls = std::fs::read_to_string(&log).expect("log");
        let lines: Vec<&str> = calls.lines().collect();
        assert_eq!(lines.len(), 2, "calls: {calls}");
        let run: Vec<&str> = lines[0].split(' ').collect();
        assert_eq!(&run[..3], &["run", "--rm", "--name"]);
        let name = run[3];
        assert!(name.starts_with("binforge-obf-"));
        assert_eq!(lines[1], format!("rm -f {name}"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failure_reports_exit_code() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(&repo).expect("mkdir");
        let script = dir.path().join("docker.sh");
        std::fs::write(&script, "echo 'no such image' >&2\nexit 125\n").expect("write script");

        let obfuscator = DockerObfuscator::default()
            .with_docker_command(["sh".to_string(), script.display().to_string()]);
        match obfuscator.obfuscate(&repo).await {
            Err(ObfuscationError::Failed { code, output }) => {
                assert_eq!(code, 125);
                assert!(output.contains("no such image"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
