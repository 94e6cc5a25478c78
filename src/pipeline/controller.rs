//! The per-repository state machine.
//!
//! ```text
//! NotCloned -> Cloning -> Cloned -> DiscoveringRecipes
//!   -> for each variant: Obfuscating -> Compiling -> Validating -> RecordingMetrics
//!   -> Archiving -> Done
//! ```
//!
//! `Aborted` is reachable from every state: any error or panic that escapes a
//! stage is caught in [`RepositoryPipeline::process`], the working tree and
//! the binary directory of the variant in progress are removed, and the
//! record is returned with `clone_successful = false`. Snapshots of variants
//! that completed before the abort are kept.
//! Expected failures (clone refused, compile timeout, failed verification)
//! are handled inside the stage that hit them and never abort the repository.

use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tracing::{debug, error, info, warn};

use super::config::PipelineConfig;
use super::result::{PipelineMetaInfo, PipelineResult};
use crate::archive::{self, archive_path, folder_size, readable_size};
use crate::compile::{read_library_log, BatchCompiler, CompileRequest, CompileResult, LIBRARY_LOG_NAME};
use crate::error::{ArchiveError, CompileError, PipelineError};
use crate::metrics::{MetricsCollector, RepoOutcome};
use crate::obfuscation::{
    contains_marker, variant_plan, ObfuscationVariant, SourceObfuscator, VariantConfig,
    OPTIMIZATION_LEVEL,
};
use crate::recipes::{contains_files, find_makefiles};
use crate::repo::{CloneRequest, CloneStatus, RepoCloner, RepositoryRecord};

/// Stage a repository is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoState {
    NotCloned,
    Cloning,
    Cloned,
    DiscoveringRecipes,
    Obfuscating(ObfuscationVariant),
    Compiling(ObfuscationVariant),
    Validating(ObfuscationVariant),
    RecordingMetrics(ObfuscationVariant),
    Archiving,
    Done,
    Aborted,
}

impl fmt::Display for RepoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotCloned => f.write_str("not-cloned"),
            Self::Cloning => f.write_str("cloning"),
            Self::Cloned => f.write_str("cloned"),
            Self::DiscoveringRecipes => f.write_str("discovering-recipes"),
            Self::Obfuscating(v) => write!(f, "obfuscating[{v}]"),
            Self::Compiling(v) => write!(f, "compiling[{v}]"),
            Self::Validating(v) => write!(f, "validating[{v}]"),
            Self::RecordingMetrics(v) => write!(f, "recording-metrics[{v}]"),
            Self::Archiving => f.write_str("archiving"),
            Self::Done => f.write_str("done"),
            Self::Aborted => f.write_str("aborted"),
        }
    }
}

/// Result of one variant.
#[derive(Debug)]
pub enum VariantOutcome {
    Compiled {
        results: Vec<CompileResult>,
        libraries: BTreeSet<String>,
    },
    /// The variant produced nothing usable; its binary directory is gone.
    Failed(PipelineError),
}

/// What a run has produced so far. Survives an error or panic in the run so
/// the aborted result still carries the completed variants.
#[derive(Debug, Default)]
struct Progress {
    /// Latest state of the record.
    record: Option<RepositoryRecord>,
    clone_success: Option<bool>,
    repo_size: Option<u64>,
    /// Snapshots of completed variants.
    variant_records: Vec<RepositoryRecord>,
    /// Variant being processed, if any.
    current: Option<ObfuscationVariant>,
}

/// Short label for a variant failure, used in metrics.
fn failure_reason(err: &PipelineError) -> &'static str {
    match err {
        PipelineError::Compile(CompileError::Timeout(_)) => "timeout",
        PipelineError::Obfuscation(_) => "obfuscation",
        PipelineError::VerificationFailed { .. } => "verification",
        _ => "error",
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn remove_tree(path: &Path) {
    if !path.exists() {
        return;
    }
    if let Err(e) = tokio::fs::remove_dir_all(path).await {
        warn!(path = %path.display(), error = %e, "Failed to remove directory");
    }
}

/// Recipe directories of the working tree.
///
/// # Errors
///
/// `PipelineError::NoRecipes` when the tree has no `Makefile`.
pub fn discover_recipes(repo_path: &Path, full_name: &str) -> Result<Vec<PathBuf>, PipelineError> {
    let recipes = find_makefiles(repo_path);
    if recipes.is_empty() {
        return Err(PipelineError::NoRecipes(full_name.to_string()));
    }
    Ok(recipes)
}

/// Drives one repository through clone, compile and archive.
#[derive(Clone)]
pub struct RepositoryPipeline {
    config: Arc<PipelineConfig>,
    cloner: Arc<dyn RepoCloner>,
    compiler: BatchCompiler,
    obfuscator: Arc<dyn SourceObfuscator>,
    plan: Arc<Vec<VariantConfig>>,
    metrics: MetricsCollector,
}

impl RepositoryPipeline {
    pub fn new(
        config: Arc<PipelineConfig>,
        cloner: Arc<dyn RepoCloner>,
        compiler: BatchCompiler,
        obfuscator: Arc<dyn SourceObfuscator>,
    ) -> Self {
        let plan = Arc::new(variant_plan(&config.compiler, &config.base_flags));
        Self {
            config,
            cloner,
            compiler,
            obfuscator,
            plan,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Working directory of a repository.
    pub fn repo_path(&self, record: &RepositoryRecord) -> PathBuf {
        self.config.clone_folder.join(record.folder_name())
    }

    /// Binary directory of one variant: `<binary_folder>/<owner>/<name>/<variant>`.
    pub fn binary_dir(&self, record: &RepositoryRecord, variant: ObfuscationVariant) -> PathBuf {
        self.config
            .binary_folder
            .join(&record.repo_owner)
            .join(&record.repo_name)
            .join(variant.as_str())
    }

    fn enter(&self, record: &RepositoryRecord, state: RepoState) {
        debug!(repo = %record.full_name(), state = %state, "Pipeline state");
    }

    /// Process one repository. Never fails: errors and panics are converted
    /// into an aborted record at this boundary.
    pub async fn process(&self, record: RepositoryRecord) -> PipelineResult {
        let started = Instant::now();
        let fallback = record.clone();
        let mut progress = Progress::default();

        let run = AssertUnwindSafe(self.run(record, &mut progress)).catch_unwind().await;
        let (result, outcome) = match run {
            Ok(Ok(result)) => {
                let outcome = classify(&result);
                (result, outcome)
            }
            Ok(Err(e)) => {
                error!(repo = %fallback.full_name(), error = %e, "Repository pipeline failed");
                (self.abort(fallback, progress).await, RepoOutcome::Aborted)
            }
            Err(panic) => {
                error!(
                    repo = %fallback.full_name(),
                    panic = %panic_message(panic.as_ref()),
                    "Repository pipeline panicked"
                );
                (self.abort(fallback, progress).await, RepoOutcome::Aborted)
            }
        };

        self.metrics
            .record_repo(outcome, started.elapsed().as_secs_f64());
        result
    }

    async fn abort(&self, fallback: RepositoryRecord, progress: Progress) -> PipelineResult {
        let mut record = progress.record.unwrap_or(fallback);
        self.enter(&record, RepoState::Aborted);
        record.clone_successful = false;

        let mut variant_records = progress.variant_records;
        let completed = variant_records.len();
        if completed > 0 {
            record.compiled = variant_records.iter().any(|r| r.compiled);
            warn!(repo = %record.full_name(), completed, "Keeping snapshots of finished variants");
        }
        if let Some(variant) = progress.current {
            remove_tree(&self.binary_dir(&record, variant)).await;
            let mut aborted = record.clone();
            aborted.reset_for_variant(variant);
            variant_records.push(aborted);
        }
        remove_tree(&self.repo_path(&record)).await;

        PipelineResult {
            clone_success: progress.clone_success,
            repo_size: progress.repo_size,
            variant_records,
            ..PipelineResult::new(record)
        }
    }

    async fn run(
        &self,
        mut record: RepositoryRecord,
        progress: &mut Progress,
    ) -> Result<PipelineResult, PipelineError> {
        let config = self.config.as_ref();
        let full_name = record.full_name();
        let repo_path = self.repo_path(&record);
        self.enter(&record, RepoState::NotCloned);

        // Already fully processed.
        if record.clone_successful
            && !config.force_reclone
            && record.compiled
            && !config.force_recompile
        {
            debug!(repo = %full_name, "Already compiled, skipping");
            return Ok(PipelineResult::new(record));
        }

        // Stage 1: restore from archive or clone.
        let archive = archive_path(
            &config.archive_folder,
            &record.repo_owner,
            &record.repo_name,
            config.compression,
        );
        let mut clone_success = None;
        let repo_size = if !config.force_reclone && archive.exists() {
            if let Err(e) =
                archive::extract(&archive, &config.clone_folder, config.compression, config.clone_timeout)
                    .await
            {
                error!(repo = %full_name, error = %e, "Failed to extract archive");
                remove_tree(&repo_path).await;
                return Ok(PipelineResult::new(record));
            }
            info!(repo = %full_name, "Extracted from archive");
            folder_size(&repo_path)
        } else if config.force_reclone || (record.clone_successful && !repo_path.exists()) {
            if config.force_reclone {
                remove_tree(&repo_path).await;
            }
            self.enter(&record, RepoState::Cloning);
            let request = CloneRequest {
                owner: record.repo_owner.clone(),
                name: record.repo_name.clone(),
                clone_folder: config.clone_folder.clone(),
                folder_name: record.folder_name(),
                timeout: config.clone_timeout,
                recursive: config.recursive_clone,
            };
            let outcome = self.cloner.clone_repo(&request).await;
            let captured = outcome.captured_output.as_deref().unwrap_or_default();
            match outcome.status {
                CloneStatus::Success => {}
                CloneStatus::SubmodulesFailed => {
                    warn!(repo = %full_name, output = %captured, "Submodules ignored due to error");
                }
                CloneStatus::FolderExists => {
                    warn!(repo = %full_name, "Skipped because folder exists");
                    record.clone_successful = false;
                    return Ok(PipelineResult::new(record).with_clone_success(Some(false)));
                }
                CloneStatus::PrivateOrNonexistent => {
                    warn!(repo = %full_name, "Failed to clone: repository is private or nonexistent");
                    record.clone_successful = false;
                    return Ok(PipelineResult::new(record).with_clone_success(Some(false)));
                }
                CloneStatus::Timeout => {
                    error!(repo = %full_name, timeout = ?config.clone_timeout, "Clone timed out");
                    record.clone_successful = false;
                    return Ok(PipelineResult::new(record).with_clone_success(Some(false)));
                }
                CloneStatus::Unknown => {
                    error!(repo = %full_name, output = %captured, "Failed to clone with unknown error");
                    record.clone_successful = false;
                    return Ok(PipelineResult::new(record));
                }
            }
            clone_success = Some(true);
            let size = folder_size(&repo_path);
            info!(
                repo = %full_name,
                elapsed = %format!("{:.2}s", outcome.elapsed.as_secs_f64()),
                size = %readable_size(size),
                "Cloned"
            );
            size
        } else {
            if !record.clone_successful {
                return Ok(PipelineResult::new(record));
            }
            folder_size(&repo_path)
        };
        record.repo_size = repo_size;
        progress.clone_success = clone_success;
        progress.repo_size = Some(repo_size);
        progress.record = Some(record.clone());
        self.enter(&record, RepoState::Cloned);

        match self.cloner.head_commit(&repo_path).await {
            Ok(hash) => record.commit_hash = Some(hash),
            Err(e) => {
                warn!(repo = %full_name, error = %e, "Could not resolve commit hash");
                record.commit_hash = None;
            }
        }

        // Stage 2: recipes.
        self.enter(&record, RepoState::DiscoveringRecipes);
        let recipe_dirs = match discover_recipes(&repo_path, &full_name) {
            Ok(dirs) => dirs,
            Err(e @ PipelineError::NoRecipes(_)) => {
                remove_tree(&repo_path).await;
                warn!(repo = %full_name, "{e}, repository deleted");
                let mut result = PipelineResult::new(record).with_clone_success(clone_success);
                result.repo_size = Some(repo_size);
                result.makefiles = Some(Vec::new());
                return Ok(result);
            }
            Err(e) => return Err(e),
        };
        record.num_makefiles = recipe_dirs.len();
        record.optimization = OPTIMIZATION_LEVEL.to_string();

        let meta_info = config.record_metainfo.then(|| PipelineMetaInfo {
            num_makefiles: recipe_dirs.len(),
            has_gitmodules: repo_path.join(".gitmodules").exists(),
            makefiles_using_automake: recipe_dirs
                .iter()
                .filter(|dir| contains_files(dir, &["configure.ac", "configure.in"]))
                .count(),
        });

        // Stage 3: one compile per variant.
        info!(repo = %full_name, recipes = recipe_dirs.len(), "Compiling variants");
        let mut libraries = config.record_libraries.then(BTreeSet::new);
        let mut makefiles = None;
        let mut any_compiled = false;

        for variant in self.plan.iter() {
            record.reset_for_variant(variant.variant);
            progress.record = Some(record.clone());
            progress.current = Some(variant.variant);
            match self
                .compile_variant(&record, variant, &repo_path, &recipe_dirs)
                .await?
            {
                VariantOutcome::Compiled {
                    results,
                    libraries: variant_libraries,
                } => {
                    record.num_makefiles_succeeded = results.iter().filter(|r| r.success).count();
                    record.num_makefiles_binaries =
                        results.iter().filter(|r| r.has_binaries()).count();
                    record.num_binaries = results.iter().map(|r| r.binaries.len()).sum();
                    record.compiled = record.num_makefiles_binaries > 0;
                    any_compiled |= record.compiled;

                    let message = format!(
                        "{} ({}) out of {} Makefile(s) in {} compiled (partially), yielding {} binaries",
                        record.num_makefiles_succeeded,
                        record.num_makefiles_binaries,
                        record.num_makefiles,
                        full_name,
                        record.num_binaries
                    );
                    if record.num_makefiles_succeeded == record.num_makefiles {
                        info!(variant = %variant.variant, "{message}");
                    } else {
                        warn!(variant = %variant.variant, "{message}");
                    }

                    if let Some(all) = libraries.as_mut() {
                        all.extend(variant_libraries);
                    }
                    makefiles = Some(results);
                }
                VariantOutcome::Failed(e) => {
                    warn!(repo = %full_name, variant = %variant.variant, error = %e, "Variant failed");
                }
            }
            self.enter(&record, RepoState::RecordingMetrics(variant.variant));
            progress.variant_records.push(record.clone());
            progress.current = None;
        }
        record.compiled = any_compiled;
        progress.record = Some(record.clone());

        // Stage 4: archive.
        self.enter(&record, RepoState::Archiving);
        let mut archived = false;
        if repo_size > config.max_archive_size {
            remove_tree(&repo_path).await;
            info!(
                repo = %full_name,
                size = %readable_size(repo_size),
                "Removed repository because its size exceeds the archive limit"
            );
        } else {
            match archive::compress(
                &repo_path,
                &record.folder_name(),
                &archive,
                config.compression,
                config.clone_timeout,
            )
            .await
            {
                Ok(()) => {
                    archived = true;
                    info!(repo = %full_name, "Compressed, folder removed");
                }
                Err(e @ ArchiveError::Timeout { .. }) => {
                    error!(repo = %full_name, error = %e, "Compression timed out, giving up");
                }
                Err(e) => {
                    error!(repo = %full_name, error = %e, "Failed to compress repository");
                }
            }
            remove_tree(&repo_path).await;
        }
        self.enter(&record, RepoState::Done);

        Ok(PipelineResult {
            record,
            clone_success,
            repo_size: Some(repo_size),
            makefiles,
            libraries,
            meta_info,
            variant_records: std::mem::take(&mut progress.variant_records),
            archived,
        })
    }

    /// Clean the tree, obfuscate (when the variant rewrites sources), compile
    /// and verify one variant.
    ///
    /// Expected failures come back as `VariantOutcome::Failed` with the
    /// variant's binary directory removed. Only unexpected errors are returned
    /// as `Err`.
    pub async fn compile_variant(
        &self,
        record: &RepositoryRecord,
        variant: &VariantConfig,
        repo_path: &Path,
        recipe_dirs: &[PathBuf],
    ) -> Result<VariantOutcome, PipelineError> {
        let config = self.config.as_ref();
        let name = variant.variant.as_str();
        let binary_dir = self.binary_dir(record, variant.variant);
        let container_uid = record.container_uid(config.uid_base, config.uid_span);

        // Objects left by the previous variant would be linked into this one.
        if let Err(e) = self
            .compiler
            .clean(repo_path, container_uid, config.compile_timeout)
            .await
        {
            warn!(repo = %record.full_name(), variant = %name, error = %e, "Could not clean working tree");
        }

        if variant.variant.rewrites_sources() {
            self.enter(record, RepoState::Obfuscating(variant.variant));
            if let Err(e) = self.obfuscator.obfuscate(repo_path).await {
                return Ok(self.fail_variant(&binary_dir, name, e.into()).await);
            }
        }

        self.enter(record, RepoState::Compiling(variant.variant));
        // Stale artifacts from an earlier run would be attributed to this one.
        remove_tree(&binary_dir).await;
        let request = CompileRequest {
            output_dir: binary_dir.clone(),
            repo_path: repo_path.to_path_buf(),
            recipe_dirs: recipe_dirs.to_vec(),
            compiler: variant.compiler.clone(),
            flags: variant.flags.clone(),
            timeout: config.compile_timeout,
            record_libraries: config.record_libraries,
            container_uid,
        };
        let started = Instant::now();
        let results = match self.compiler.compile(&request).await {
            Ok(results) => results,
            Err(e @ CompileError::Timeout(_)) => {
                return Ok(self.fail_variant(&binary_dir, name, e.into()).await);
            }
            Err(e) => return Err(e.into()),
        };

        self.enter(record, RepoState::Validating(variant.variant));
        if let Some(marker) = variant.marker {
            if !contains_marker(repo_path, marker)? {
                let e = PipelineError::VerificationFailed {
                    repo: record.full_name(),
                    variant: name.to_string(),
                };
                return Ok(self.fail_variant(&binary_dir, name, e).await);
            }
        }

        let libraries = if config.record_libraries {
            read_library_log(&binary_dir.join(LIBRARY_LOG_NAME))?
        } else {
            BTreeSet::new()
        };

        let binaries = results.iter().map(|r| r.binaries.len()).sum();
        self.metrics
            .record_variant(name, binaries, started.elapsed().as_secs_f64());
        Ok(VariantOutcome::Compiled { results, libraries })
    }

    async fn fail_variant(&self, binary_dir: &Path, name: &str, err: PipelineError) -> VariantOutcome {
        remove_tree(binary_dir).await;
        self.metrics.record_variant_failure(name, failure_reason(&err));
        VariantOutcome::Failed(err)
    }
}

/// Metrics outcome of a completed (non-aborted) pipeline run.
fn classify(result: &PipelineResult) -> RepoOutcome {
    if result.makefiles.as_ref().is_some_and(|m| m.is_empty()) && result.variant_records.is_empty() {
        RepoOutcome::NoRecipes
    } else if result.variant_records.is_empty() {
        if result.record.clone_successful && result.record.compiled {
            RepoOutcome::Skipped
        } else {
            RepoOutcome::CloneFailed
        }
    } else if result.record.compiled {
        RepoOutcome::Compiled
    } else {
        RepoOutcome::NotCompiled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ObfuscationError;
    use std::time::Duration;

    #[test]
    fn test_state_display() {
        assert_eq!(
            RepoState::Compiling(ObfuscationVariant::LlvmBcf).to_string(),
            "compiling[llvm-obfuscation-bcf]"
        );
        assert_eq!(RepoState::Aborted.to_string(), "aborted");
    }

    #[test]
    fn test_failure_reasons() {
        assert_eq!(
            failure_reason(&PipelineError::Compile(CompileError::Timeout(Duration::from_secs(1)))),
            "timeout"
        );
        assert_eq!(
            failure_reason(&PipelineError::Obfuscation(ObfuscationError::Timeout(
                Duration::from_secs(1)
            ))),
            "obfuscation"
        );
        assert_eq!(
            failure_reason(&PipelineError::VerificationFailed {
                repo: "a/b".to_string(),
                variant: "adv-obfuscation".to_string(),
            }),
            "verification"
        );
    }

    #[test]
    fn test_discover_recipes_empty_tree() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = discover_recipes(dir.path(), "a/b").expect_err("no recipes");
        assert!(matches!(err, PipelineError::NoRecipes(ref name) if name == "a/b"));
    }

    #[test]
    fn test_panic_message() {
        let panic: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(panic.as_ref()), "boom");
        let panic: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(panic.as_ref()), "bang");
    }

    #[test]
    fn test_classify_outcomes() {
        let mut skipped = RepositoryRecord::new(0, "a", "b");
        skipped.compiled = true;
        assert_eq!(classify(&PipelineResult::new(skipped)), RepoOutcome::Skipped);

        let mut refused = RepositoryRecord::new(0, "a", "b");
        refused.clone_successful = false;
        assert_eq!(classify(&PipelineResult::new(refused)), RepoOutcome::CloneFailed);

        let mut empty = PipelineResult::new(RepositoryRecord::new(0, "a", "b"));
        empty.makefiles = Some(Vec::new());
        assert_eq!(classify(&empty), RepoOutcome::NoRecipes);
    }
}
