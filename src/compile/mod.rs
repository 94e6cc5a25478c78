//! Containerized compilation of a repository's build recipes.
//!
//! Two strategies share one result shape:
//! - [`CompileMode::Batch`] starts a single container running the image's
//!   `batch_make` entry point over every recipe, then reads its log.
//! - [`CompileMode::PerRecipe`] starts one container per recipe running
//!   `make`, and collects the ELF files each build leaves behind.
//!
//! Either way artifacts end up under `<output_dir>/<recipe-rel-dir>/` and are
//! attributed to recipes by path ([`associate_binaries`]).

pub mod batch;
pub mod libraries;
pub mod per_recipe;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::docker::{ContainerCommand, ContainerRunner, ContainerUser};
use crate::error::CompileError;

pub use libraries::{parse_library_flags, read_library_log, write_library_log, LIBRARY_LOG_NAME};

/// Container path the repository is mounted at.
pub const REPO_MOUNT: &str = "/usr/src/repo";

/// Container path the output directory is mounted at.
pub const OUTPUT_MOUNT: &str = "/usr/src/bin";

/// Name of the batch entry point's per-recipe log inside the output directory.
pub const COMPILE_LOG_NAME: &str = "compile_log.jsonl";

/// Removes untracked and ignored files, submodules included.
pub const CLEAN_COMMAND: &str =
    "git clean -xffd && git submodule foreach --recursive git clean -xffd";

/// Outcome of building one recipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileResult {
    /// Recipe directory relative to the repository root (`.` for the root).
    pub directory: PathBuf,
    /// Whether the build exited successfully.
    pub success: bool,
    /// Produced binaries, relative to the output directory.
    pub binaries: BTreeSet<PathBuf>,
    /// Captured build output.
    pub output: String,
}

impl CompileResult {
    pub fn has_binaries(&self) -> bool {
        !self.binaries.is_empty()
    }
}

/// Everything needed to compile one repository under one variant.
#[derive(Debug, Clone)]
pub struct CompileRequest {
    /// Host directory receiving the artifacts.
    pub output_dir: PathBuf,
    /// Host path of the working tree.
    pub repo_path: PathBuf,
    /// Recipe directories (absolute, under `repo_path`).
    pub recipe_dirs: Vec<PathBuf>,
    pub compiler: String,
    pub flags: String,
    pub timeout: Option<Duration>,
    pub record_libraries: bool,
    /// Uid the build runs as inside the container.
    pub container_uid: u32,
}

impl CompileRequest {
    /// Recipe directories relative to the repository root.
    pub fn relative_recipes(&self) -> Vec<PathBuf> {
        self.recipe_dirs
            .iter()
            .map(|dir| crate::recipes::relative_dir(&self.repo_path, dir))
            .collect()
    }
}

/// Compilation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompileMode {
    /// One container for the whole repository.
    #[default]
    Batch,
    /// One container per recipe.
    PerRecipe,
}

/// Compiles repositories through a [`ContainerRunner`].
#[derive(Clone)]
pub struct BatchCompiler {
    runner: Arc<dyn ContainerRunner>,
    mode: CompileMode,
}

impl BatchCompiler {
    pub fn new(runner: Arc<dyn ContainerRunner>, mode: CompileMode) -> Self {
        Self { runner, mode }
    }

    pub fn mode(&self) -> CompileMode {
        self.mode
    }

    /// Return the working tree to its checked-out state, so objects left by
    /// one variant are not linked into the next.
    ///
    /// A failed clean is logged; the next build still runs.
    ///
    /// # Errors
    ///
    /// `CompileError::Timeout` when the clean exceeds `timeout`, or the
    /// runner's error when the container cannot start.
    pub async fn clean(
        &self,
        repo_path: &Path,
        container_uid: u32,
        timeout: Option<Duration>,
    ) -> Result<(), CompileError> {
        let command = ContainerCommand::new(CLEAN_COMMAND)
            .with_mount(repo_path, REPO_MOUNT)
            .with_cwd(REPO_MOUNT)
            .with_user(ContainerUser::Uid(container_uid))
            .with_timeout(timeout);
        let result = self.runner.run(&command).await?;
        if !result.success() {
            warn!(
                repo = %repo_path.display(),
                exit_code = result.exit_code,
                output = %crate::docker::truncate(result.captured_output.as_deref().unwrap_or(""), 500),
                "Cleaning working tree failed"
            );
        }
        Ok(())
    }

    /// Build every recipe of the request.
    ///
    /// # Errors
    ///
    /// `CompileError::Timeout` when the batch container exceeds its deadline.
    /// Individual recipe failures are reported as `success == false`.
    pub async fn compile(&self, request: &CompileRequest) -> Result<Vec<CompileResult>, CompileError> {
        tokio::fs::create_dir_all(&request.output_dir).await?;
        debug!(
            repo = %request.repo_path.display(),
            recipes = request.recipe_dirs.len(),
            compiler = %request.compiler,
            mode = ?self.mode,
            "Compiling"
        );
        match self.mode {
            CompileMode::Batch => batch::compile(self.runner.as_ref(), request).await,
            CompileMode::PerRecipe => per_recipe::compile(self.runner.as_ref(), request).await,
        }
    }
}

/// Attribute every file under `output_dir` to the recipe whose relative
/// directory is the longest prefix of the file's path.
///
/// Bookkeeping files at the top of `output_dir` are ignored. Files matching no
/// recipe are dropped.
pub fn associate_binaries(
    output_dir: &Path,
    recipes: &[PathBuf],
) -> BTreeMap<PathBuf, BTreeSet<PathBuf>> {
    let mut by_recipe: BTreeMap<PathBuf, BTreeSet<PathBuf>> = BTreeMap::new();
    for entry in WalkDir::new(output_dir).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(output_dir) else {
            continue;
        };
        if rel == Path::new(COMPILE_LOG_NAME) || rel == Path::new(LIBRARY_LOG_NAME) {
            continue;
        }
        let owner = recipes
            .iter()
            .filter(|recipe| recipe.as_path() == Path::new(".") || rel.starts_with(recipe))
            .max_by_key(|recipe| {
                if recipe.as_path() == Path::new(".") {
                    0
                } else {
                    recipe.components().count()
                }
            });
        if let Some(recipe) = owner {
            by_recipe
                .entry(recipe.clone())
                .or_default()
                .insert(rel.to_path_buf());
        }
    }
    by_recipe
}
