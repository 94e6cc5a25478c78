//! Whole-repository compilation in a single container.
//!
//! The image's `batch_make` entry point receives the compiler, the flags and
//! the recipe directories. For each recipe it builds, copies artifacts to
//! `/usr/src/bin/<rel>/` and appends a line to `compile_log.jsonl`:
//!
//! ```text
//! {"directory": "src", "success": true, "output": "..."}
//! ```
//!
//! With `--record-libraries` it also writes `libraries.txt`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

use super::{
    associate_binaries, CompileRequest, CompileResult, COMPILE_LOG_NAME, OUTPUT_MOUNT,
    REPO_MOUNT,
};
use crate::docker::{shell_quote, ContainerCommand, ContainerRunner, ContainerUser};
use crate::error::CompileError;

/// Entry point of the compile image.
pub const BATCH_ENTRY_POINT: &str = "batch_make";

#[derive(Debug, Deserialize)]
struct LogEntry {
    directory: PathBuf,
    success: bool,
    #[serde(default)]
    output: String,
}

/// Command line handed to `bash -c` inside the container.
pub fn batch_command(request: &CompileRequest, recipes: &[PathBuf]) -> String {
    let mut parts = vec![
        BATCH_ENTRY_POINT.to_string(),
        "--compiler".to_string(),
        shell_quote(&request.compiler),
        "--flags".to_string(),
        shell_quote(&request.flags),
    ];
    if request.record_libraries {
        parts.push("--record-libraries".to_string());
    }
    parts.push("--".to_string());
    parts.extend(recipes.iter().map(|r| shell_quote(&r.to_string_lossy())));
    parts.join(" ")
}

fn parse_compile_log(content: &str) -> Result<Vec<LogEntry>, CompileError> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str::<LogEntry>(line)
                .map_err(|e| CompileError::MalformedLog(format!("{e}: {}", crate::docker::truncate(line, 200))))
        })
        .collect()
}

fn normalize(dir: &Path) -> PathBuf {
    let trimmed = dir.strip_prefix("./").unwrap_or(dir);
    if trimmed.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        trimmed.to_path_buf()
    }
}

pub(crate) async fn compile(
    runner: &dyn ContainerRunner,
    request: &CompileRequest,
) -> Result<Vec<CompileResult>, CompileError> {
    let recipes = request.relative_recipes();
    let log_path = request.output_dir.join(COMPILE_LOG_NAME);
    if log_path.exists() {
        tokio::fs::remove_file(&log_path).await?;
    }

    let command = ContainerCommand::new(batch_command(request, &recipes))
        .with_mount(&request.repo_path, REPO_MOUNT)
        .with_mount(&request.output_dir, OUTPUT_MOUNT)
        .with_user(ContainerUser::Uid(request.container_uid))
        .with_timeout(request.timeout);
    let result = runner.run(&command).await?;
    if !result.success() {
        debug!(exit_code = result.exit_code, "Batch compile container exited with failure");
    }

    let entries = match tokio::fs::read_to_string(&log_path).await {
        Ok(content) => parse_compile_log(&content)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(repo = %request.repo_path.display(), "Batch compile produced no log");
            Vec::new()
        }
        Err(e) => return Err(e.into()),
    };
    let mut logged: HashMap<PathBuf, LogEntry> = entries
        .into_iter()
        .map(|entry| (normalize(&entry.directory), entry))
        .collect();

    let mut binaries = associate_binaries(&request.output_dir, &recipes);
    let fallback_output = result.captured_output.unwrap_or_default();

    Ok(recipes
        .into_iter()
        .map(|directory| {
            let entry = logged.remove(&directory);
            CompileResult {
                binaries: binaries.remove(&directory).unwrap_or_default(),
                success: entry.as_ref().is_some_and(|e| e.success),
                output: entry.map(|e| e.output).unwrap_or_else(|| fallback_output.clone()),
                directory,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::{BatchCompiler, CompileMode, LIBRARY_LOG_NAME};
    use crate::docker::CommandResult;
    use crate::error::ContainerError;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Emulates the entry point by writing into the mounted output directory.
    struct ScriptedRunner {
        log: String,
        artifacts: Vec<&'static str>,
        timeout: bool,
        seen: Mutex<Vec<ContainerCommand>>,
    }

    #[async_trait]
    impl ContainerRunner for ScriptedRunner {
        async fn run(&self, command: &ContainerCommand) -> Result<CommandResult, ContainerError> {
            self.seen.lock().expect("lock").push(command.clone());
            if self.timeout {
                return Err(ContainerError::Timeout {
                    command: command.command.clone(),
                    timeout: Duration::from_secs(1),
                    captured_output: None,
                });
            }
            let out = command
                .mounts
                .iter()
                .find(|(_, container)| container == OUTPUT_MOUNT)
                .map(|(host, _)| host.clone())
                .expect("output mount");
            std::fs::write(out.join(COMPILE_LOG_NAME), &self.log).expect("log");
            std::fs::write(out.join(LIBRARY_LOG_NAME), "m pthread").expect("libs");
            for artifact in &self.artifacts {
                let path = out.join(artifact);
                std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
                std::fs::write(path, b"\x7fELF").expect("write");
            }
            Ok(CommandResult {
                command: command.command.clone(),
                exit_code: 0,
                captured_output: Some("container output".to_string()),
            })
        }
    }

    fn request(root: &Path) -> CompileRequest {
        let repo = root.join("repo");
        std::fs::create_dir_all(repo.join("src")).expect("mkdir");
        CompileRequest {
            output_dir: root.join("out"),
            recipe_dirs: vec![repo.clone(), repo.join("src"), repo.join("docs")],
            repo_path: repo,
            compiler: "gcc".to_string(),
            flags: "-g -O1".to_string(),
            timeout: Some(Duration::from_secs(60)),
            record_libraries: true,
            container_uid: 30_007,
        }
    }

    #[test]
    fn test_batch_command() {
        let dir = tempfile::tempdir().expect("tempdir");
        let req = request(dir.path());
        let cmd = batch_command(&req, &req.relative_recipes());
        assert_eq!(
            cmd,
            "batch_make --compiler 'gcc' --flags '-g -O1' --record-libraries -- '.' 'src' 'docs'"
        );
    }

    #[tokio::test]
    async fn test_batch_compile_reads_log_and_binaries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = Arc::new(ScriptedRunner {
            log: concat!(
                "{\"directory\": \".\", \"success\": true, \"output\": \"ok\"}\n",
                "{\"directory\": \"./src\", \"success\": false, \"output\": \"error\"}\n",
            )
            .to_string(),
            artifacts: vec!["app", "src/tool"],
            timeout: false,
            seen: Mutex::new(Vec::new()),
        });
        let compiler = BatchCompiler::new(runner.clone(), CompileMode::Batch);
        let req = request(dir.path());

        let results = compiler.compile(&req).await.expect("compile");
        assert_eq!(results.len(), 3);
        assert!(results[0].success);
        assert_eq!(results[0].binaries.len(), 1);
        assert!(!results[1].success);
        assert_eq!(results[1].output, "error");
        assert!(results[1].has_binaries());
        // Missing from the log: failed, output falls back to the container output.
        assert!(!results[2].success);
        assert_eq!(results[2].output, "container output");

        let seen = runner.seen.lock().expect("lock");
        assert_eq!(seen[0].user, ContainerUser::Uid(30_007));
        assert_eq!(seen[0].timeout, Some(Duration::from_secs(60)));
        assert_eq!(seen[0].mounts.len(), 2);
    }

    #[tokio::test]
    async fn test_batch_timeout_is_compile_timeout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = Arc::new(ScriptedRunner {
            log: String::new(),
            artifacts: vec![],
            timeout: true,
            seen: Mutex::new(Vec::new()),
        });
        let compiler = BatchCompiler::new(runner, CompileMode::Batch);
        let err = compiler
            .compile(&request(dir.path()))
            .await
            .expect_err("should time out");
        assert!(matches!(err, CompileError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_malformed_log_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = Arc::new(ScriptedRunner {
            log: "not json\n".to_string(),
            artifacts: vec![],
            timeout: false,
            seen: Mutex::new(Vec::new()),
        });
        let compiler = BatchCompiler::new(runner, CompileMode::Batch);
        let err = compiler
            .compile(&request(dir.path()))
            .await
            .expect_err("malformed");
        assert!(matches!(err, CompileError::MalformedLog(_)));
    }
}
