//! CLI command definitions for binforge.
//!
//! `binforge run` crawls a repository list into a binary dataset;
//! `binforge verify-image` only checks that the compile image is current.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{ArgAction, Parser};
use tracing::{info, warn};

use crate::archive::CompressionType;
use crate::compile::{BatchCompiler, CompileMode};
use crate::docker::{check_image, ContainerRunner, DockerRunner, ImageStatus, DEFAULT_IMAGE};
use crate::metrics::{init_metrics, write_metrics_file};
use crate::obfuscation::{DockerObfuscator, DEFAULT_OBFUSCATOR_IMAGE};
use crate::pipeline::config::{DEFAULT_MAX_ARCHIVE_SIZE, DEFAULT_UID_BASE, DEFAULT_UID_SPAN};
use crate::pipeline::{PipelineConfig, RepositoryPipeline};
use crate::repo::GitCloner;
use crate::scheduler::{Fleet, FleetConfig};

/// Clone, compile and archive C repositories into a binary dataset.
#[derive(Parser)]
#[command(name = "binforge")]
#[command(about = "Build a dataset of compiled binaries from C repositories")]
#[command(version)]
#[command(
    long_about = "binforge clones every repository in a list, compiles each Makefile inside a Docker image under several obfuscation variants, and archives the sources.\n\nExample usage:\n  binforge run --repo-list-file repos.txt --n-procs 32 --compression-type xz"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true, env = "BINFORGE_LOG_LEVEL")]
    pub log_level: String,

    /// Also write logs to this file, without colors.
    #[arg(long, global = true, env = "BINFORGE_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Process every repository in the list.
    Run(Box<RunArgs>),

    /// Check that the compile image is newer than its sources.
    VerifyImage(VerifyImageArgs),
}

/// Image selection shared by both subcommands.
#[derive(clap::Args, Debug, Clone)]
pub struct ImageArgs {
    /// Docker image used for compiling.
    #[arg(long, default_value = DEFAULT_IMAGE, env = "BINFORGE_IMAGE")]
    pub image: String,

    /// Files or directories baked into the image; the image must be newer than all of them.
    /// May be repeated.
    #[arg(long = "image-source", env = "BINFORGE_IMAGE_SOURCES", value_delimiter = ',')]
    pub image_sources: Vec<PathBuf>,
}

/// Arguments for `binforge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// File listing repositories, one `https://github.com/<owner>/<name>` URL per line.
    #[arg(long, env = "BINFORGE_REPO_LIST_FILE")]
    pub repo_list_file: PathBuf,

    /// Folder for working trees.
    #[arg(long, default_value = "repos/", env = "BINFORGE_CLONE_FOLDER")]
    pub clone_folder: PathBuf,

    /// Root of the binary dataset.
    #[arg(long, default_value = "dataset/binaries/", env = "BINFORGE_BINARY_FOLDER")]
    pub binary_folder: PathBuf,

    /// Folder for archived working trees.
    #[arg(long, default_value = "dataset/archives/", env = "BINFORGE_ARCHIVE_FOLDER")]
    pub archive_folder: PathBuf,

    /// Number of concurrent workers; 0 runs everything sequentially.
    #[arg(long, default_value = "70", env = "BINFORGE_N_PROCS")]
    pub n_procs: usize,

    /// Clone (and archive) timeout in seconds; 0 disables it.
    #[arg(long, default_value = "600", env = "BINFORGE_CLONE_TIMEOUT")]
    pub clone_timeout: u64,

    /// Clone again even when an archive or working tree exists.
    #[arg(long, env = "BINFORGE_FORCE_RECLONE")]
    pub force_reclone: bool,

    /// Per-stage compile timeout in seconds; 0 disables it.
    #[arg(long, default_value = "900", env = "BINFORGE_COMPILE_TIMEOUT")]
    pub compile_timeout: u64,

    /// Compile again even when the repository was already processed.
    #[arg(long, env = "BINFORGE_FORCE_RECOMPILE")]
    pub force_recompile: bool,

    /// Compile all recipes of a repository in one container run.
    #[arg(long, default_value = "true", action = ArgAction::Set, env = "BINFORGE_DOCKER_BATCH_COMPILE")]
    pub docker_batch_compile: bool,

    /// Archive compression.
    #[arg(long, value_enum, default_value = "gzip", env = "BINFORGE_COMPRESSION_TYPE")]
    pub compression_type: CompressionType,

    /// Working trees larger than this many bytes are deleted instead of archived.
    #[arg(long, default_value_t = DEFAULT_MAX_ARCHIVE_SIZE, env = "BINFORGE_MAX_ARCHIVE_SIZE")]
    pub max_archive_size: u64,

    /// Record linked libraries and merge them into this file.
    #[arg(long, env = "BINFORGE_RECORD_LIBRARIES")]
    pub record_libraries: Option<PathBuf>,

    /// Stop after this many repositories.
    #[arg(long, env = "BINFORGE_MAX_REPOS")]
    pub max_repos: Option<usize>,

    /// Clone submodules too.
    #[arg(long, default_value = "true", action = ArgAction::Set, env = "BINFORGE_RECURSIVE_CLONE")]
    pub recursive_clone: bool,

    /// Attach per-stage meta information to results.
    #[arg(long, default_value = "true", action = ArgAction::Set, env = "BINFORGE_RECORD_METAINFO")]
    pub record_metainfo: bool,

    /// Baseline compiler flags shared by every variant.
    #[arg(long, default_value = "-g ", allow_hyphen_values = true, env = "BINFORGE_GCC_OVERRIDE_FLAGS")]
    pub gcc_override_flags: String,

    /// Compiler for the unobfuscated variant.
    #[arg(long, default_value = "gcc", env = "BINFORGE_COMPILER")]
    pub compiler: String,

    /// Output file for the per-variant repository records.
    #[arg(long, default_value = "meta_data.json", env = "BINFORGE_METADATA_FILE")]
    pub metadata_file: PathBuf,

    #[command(flatten)]
    pub image: ImageArgs,

    /// Docker image of the source obfuscation applicator.
    #[arg(long, default_value = DEFAULT_OBFUSCATOR_IMAGE, env = "BINFORGE_OBFUSCATOR_IMAGE")]
    pub obfuscator_image: String,

    /// First uid handed to compile containers.
    #[arg(long, default_value_t = DEFAULT_UID_BASE, env = "BINFORGE_UID_BASE")]
    pub uid_base: u32,

    /// Number of distinct container uids.
    #[arg(long, default_value_t = DEFAULT_UID_SPAN, env = "BINFORGE_UID_SPAN")]
    pub uid_span: u32,

    /// Write Prometheus metrics to this file when the run ends.
    #[arg(long, env = "BINFORGE_METRICS_FILE")]
    pub metrics_file: Option<PathBuf>,

    /// Do not check the compile image before starting.
    #[arg(long, env = "BINFORGE_SKIP_IMAGE_CHECK")]
    pub skip_image_check: bool,

    /// Keep leftovers in the clone folder instead of removing them at start-up.
    #[arg(long, env = "BINFORGE_KEEP_CLONE_FOLDER")]
    pub keep_clone_folder: bool,
}

/// Arguments for `binforge verify-image`.
#[derive(Parser, Debug)]
pub struct VerifyImageArgs {
    #[command(flatten)]
    pub image: ImageArgs,
}

impl RunArgs {
    /// Convert the arguments into a validated pipeline configuration.
    pub fn pipeline_config(&self) -> anyhow::Result<PipelineConfig> {
        let mode = if self.docker_batch_compile {
            CompileMode::Batch
        } else {
            CompileMode::PerRecipe
        };
        let config = PipelineConfig::new()
            .with_folders(&self.clone_folder, &self.binary_folder, &self.archive_folder)
            .with_compiler(&self.compiler, &self.gcc_override_flags)
            .with_compile_mode(mode)
            .with_timeouts(
                seconds(self.clone_timeout),
                seconds(self.compile_timeout),
            )
            .with_force(self.force_reclone, self.force_recompile)
            .with_record_libraries(self.record_libraries.is_some())
            .with_archive(self.compression_type, self.max_archive_size)
            .with_uid_range(self.uid_base, self.uid_span);
        let config = PipelineConfig {
            recursive_clone: self.recursive_clone,
            record_metainfo: self.record_metainfo,
            ..config
        };
        config.validate()?;
        Ok(config)
    }

    pub fn fleet_config(&self) -> FleetConfig {
        FleetConfig {
            max_repos: self.max_repos,
            n_procs: self.n_procs,
            metadata_file: self.metadata_file.clone(),
            library_file: self.record_libraries.clone(),
            clean_clone_folder: !self.keep_clone_folder,
            ..FleetConfig::new(&self.repo_list_file)
        }
    }
}

fn seconds(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Parse CLI arguments without running any command.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse CLI arguments and run the selected command.
///
/// For control over logging initialization, use `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with already parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_command(*args).await,
        Commands::VerifyImage(args) => verify_image_command(args).await,
    }
}

async fn verify_image(args: &ImageArgs) -> anyhow::Result<()> {
    match check_image(&args.image, &args.image_sources).await? {
        ImageStatus::UpToDate => {
            info!(image = %args.image, "Docker image is up-to-date");
            Ok(())
        }
        ImageStatus::Stale { newest } => anyhow::bail!(
            "Docker image '{}' is older than {}; rebuild it before running",
            args.image,
            newest.display()
        ),
        ImageStatus::Missing => anyhow::bail!("Docker image '{}' does not exist", args.image),
    }
}

async fn verify_image_command(args: VerifyImageArgs) -> anyhow::Result<()> {
    verify_image(&args.image).await
}

async fn run_command(args: RunArgs) -> anyhow::Result<()> {
    let config = args.pipeline_config()?;
    let fleet_config = args.fleet_config();

    if args.skip_image_check {
        warn!("Skipping Docker image check");
    } else {
        verify_image(&args.image).await?;
    }

    init_metrics().context("Failed to register metrics")?;

    let runner: Arc<dyn ContainerRunner> = Arc::new(DockerRunner::new(&args.image.image));
    let obfuscator = DockerObfuscator::new(&args.obfuscator_image).with_timeout(config.compile_timeout);
    let pipeline = RepositoryPipeline::new(
        Arc::new(config.clone()),
        Arc::new(GitCloner::new()),
        BatchCompiler::new(runner.clone(), config.compile_mode),
        Arc::new(obfuscator),
    );

    let fleet = Fleet::new(fleet_config, Arc::new(pipeline), runner);
    let summary = fleet.run().await.context("Crawl failed")?;
    info!(
        processed = summary.processed,
        cloned = summary.cloned,
        compiled = summary.compiled,
        binaries = summary.binaries,
        libraries = summary.libraries,
        "Run complete"
    );

    if let Some(path) = &args.metrics_file {
        write_metrics_file(path)
            .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
        info!(path = %path.display(), "Metrics written");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).expect("parse")
    }

    fn run_args(cli: Cli) -> RunArgs {
        match cli.command {
            Commands::Run(args) => *args,
            Commands::VerifyImage(_) => panic!("expected run"),
        }
    }

    #[test]
    fn test_run_defaults() {
        let args = run_args(parse(&["binforge", "run", "--repo-list-file", "repos.txt"]));
        assert_eq!(args.n_procs, 70);
        assert!(args.docker_batch_compile);
        assert!(args.recursive_clone);
        assert_eq!(args.gcc_override_flags, "-g ");
        assert_eq!(args.image.image, "gcc-custom");
        assert!(args.image.image_sources.is_empty());

        let config = args.pipeline_config().expect("config");
        assert_eq!(config.compile_mode, CompileMode::Batch);
        assert_eq!(config.compile_timeout, Some(Duration::from_secs(900)));
        assert!(!config.record_libraries);

        let fleet = args.fleet_config();
        assert_eq!(fleet.repo_list_file, PathBuf::from("repos.txt"));
        assert!(fleet.clean_clone_folder);
        assert!(fleet.library_file.is_none());
    }

    #[test]
    fn test_run_overrides() {
        let args = run_args(parse(&[
            "binforge",
            "run",
            "--repo-list-file",
            "repos.txt",
            "--docker-batch-compile",
            "false",
            "--compression-type",
            "xz",
            "--record-libraries",
            "libs.txt",
            "--clone-timeout",
            "0",
            "--gcc-override-flags",
            "-g -fno-inline",
            "--n-procs",
            "0",
        ]));
        let config = args.pipeline_config().expect("config");
        assert_eq!(config.compile_mode, CompileMode::PerRecipe);
        assert_eq!(config.compression, CompressionType::Xz);
        assert_eq!(config.clone_timeout, None);
        assert_eq!(config.base_flags, "-g -fno-inline");
        assert!(config.record_libraries);
        assert_eq!(args.fleet_config().library_file, Some(PathBuf::from("libs.txt")));
        assert_eq!(args.fleet_config().n_procs, 0);
    }

    #[test]
    fn test_invalid_uid_range_rejected() {
        let args = run_args(parse(&[
            "binforge",
            "run",
            "--repo-list-file",
            "repos.txt",
            "--uid-span",
            "0",
        ]));
        assert!(args.pipeline_config().is_err());
    }

    #[test]
    fn test_verify_image_sources() {
        let cli = parse(&["binforge", "verify-image", "--image-source", "Dockerfile,scripts"]);
        match cli.command {
            Commands::VerifyImage(args) => {
                assert_eq!(
                    args.image.image_sources,
                    vec![PathBuf::from("Dockerfile"), PathBuf::from("scripts")]
                );
            }
            Commands::Run(_) => panic!("expected verify-image"),
        }
    }
}
