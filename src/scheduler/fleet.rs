//! Bounded worker pool over the repository list.
//!
//! Workers each own one repository end to end and send their
//! [`PipelineResult`] to a single aggregator task over an `mpsc` channel. The
//! aggregator is the only writer of the metadata log and the library set, so
//! neither needs a lock.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::libraries::LibrarySet;
use super::metadata::MetadataLog;
use crate::docker::{ContainerCommand, ContainerRunner, ContainerUser};
use crate::error::FleetError;
use crate::metrics::MetricsCollector;
use crate::pipeline::{PipelineResult, RepositoryPipeline};
use crate::repo::{iter_repos, RepositoryRecord};

/// Flush the library file after this many processed repositories.
const LIBRARY_FLUSH_INTERVAL: usize = 10;

/// Log progress after this many processed repositories.
const PROGRESS_INTERVAL: usize = 100;

/// Run-level settings.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub repo_list_file: PathBuf,
    pub max_repos: Option<usize>,
    /// Concurrent workers; 0 processes repositories sequentially on the
    /// calling task.
    pub n_procs: usize,
    pub metadata_file: PathBuf,
    /// Library file to load and keep updated, when libraries are recorded.
    pub library_file: Option<PathBuf>,
    /// Remove leftovers in the clone folder before starting.
    pub clean_clone_folder: bool,
}

impl FleetConfig {
    pub fn new(repo_list_file: impl Into<PathBuf>) -> Self {
        Self {
            repo_list_file: repo_list_file.into(),
            max_repos: None,
            n_procs: 70,
            metadata_file: PathBuf::from("meta_data.json"),
            library_file: None,
            clean_clone_folder: true,
        }
    }
}

/// Totals of a fleet run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FleetSummary {
    /// Repositories that went through the pipeline.
    pub processed: usize,
    /// Repositories freshly cloned in this run.
    pub cloned: usize,
    /// Repositories with binaries for at least one variant.
    pub compiled: usize,
    /// Binaries across all repositories and variants.
    pub binaries: usize,
    /// Distinct libraries in the library set at the end of the run.
    pub libraries: usize,
}

/// Drives a [`RepositoryPipeline`] over the whole repository list.
pub struct Fleet {
    config: FleetConfig,
    pipeline: Arc<RepositoryPipeline>,
    runner: Arc<dyn ContainerRunner>,
    metrics: MetricsCollector,
}

impl Fleet {
    /// `runner` is used for start-up maintenance of the clone folder.
    pub fn new(
        config: FleetConfig,
        pipeline: Arc<RepositoryPipeline>,
        runner: Arc<dyn ContainerRunner>,
    ) -> Self {
        Self {
            config,
            pipeline,
            runner,
            metrics: MetricsCollector::new(),
        }
    }

    /// Remove everything inside the clone folder.
    ///
    /// Trees may contain files owned by container uids, so the removal runs as
    /// root inside a container with the folder mounted at `/usr/src`.
    pub async fn clean_clone_folder(&self) -> Result<(), FleetError> {
        let clone_folder = &self.pipeline.config().clone_folder;
        if !clone_folder.exists() {
            return Ok(());
        }
        warn!(folder = %clone_folder.display(), "Removing contents of clone folder");
        let command = ContainerCommand::new("rm -rf /usr/src/*")
            .with_user(ContainerUser::Root)
            .with_mount(clone_folder, "/usr/src");
        let result = self.runner.run(&command).await?;
        if !result.success() {
            warn!(exit_code = result.exit_code, "Clone folder cleanup exited with failure");
        }
        Ok(())
    }

    /// Process every listed repository.
    pub async fn run(&self) -> Result<FleetSummary, FleetError> {
        if self.config.clean_clone_folder {
            self.clean_clone_folder().await?;
        }
        tokio::fs::create_dir_all(&self.pipeline.config().clone_folder).await?;

        let repos = iter_repos(&self.config.repo_list_file, self.config.max_repos).map_err(
            |source| FleetError::RepoList {
                path: self.config.repo_list_file.clone(),
                source,
            },
        )?;
        let log = MetadataLog::create(&self.config.metadata_file).map_err(FleetError::Metadata)?;
        let libraries = match &self.config.library_file {
            Some(path) => LibrarySet::load(path).map_err(FleetError::Libraries)?,
            None => LibrarySet::in_memory(),
        };

        info!(n_procs = self.config.n_procs, "Crawling starts");
        let (tx, rx) = mpsc::channel(self.config.n_procs.max(1) * 2);
        let aggregator = tokio::spawn(aggregate(rx, log, libraries));

        if self.config.n_procs == 0 {
            for record in repos {
                let result = self.pipeline.process(record).await;
                if tx.send(result).await.is_err() {
                    break;
                }
            }
        } else {
            self.dispatch(repos, &tx).await;
        }
        drop(tx);

        aggregator
            .await
            .map_err(|e| FleetError::Aggregator(e.to_string()))?
    }

    async fn dispatch(
        &self,
        repos: impl Iterator<Item = RepositoryRecord>,
        tx: &mpsc::Sender<PipelineResult>,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.config.n_procs));
        let mut workers = JoinSet::new();

        for record in repos {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let pipeline = self.pipeline.clone();
            let tx = tx.clone();
            let metrics = self.metrics.clone();
            workers.spawn(async move {
                let _permit = permit;
                metrics.worker_started();
                let result = pipeline.process(record).await;
                metrics.worker_finished();
                // A closed channel means the aggregator failed; the run reports that.
                let _ = tx.send(result).await;
            });

            while let Some(joined) = workers.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "Worker task failed");
                }
            }
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task failed");
            }
        }
    }
}

/// Single consumer of worker results.
async fn aggregate(
    mut rx: mpsc::Receiver<PipelineResult>,
    mut log: MetadataLog,
    mut libraries: LibrarySet,
) -> Result<FleetSummary, FleetError> {
    let mut summary = FleetSummary::default();

    while let Some(result) = rx.recv().await {
        summary.processed += 1;
        if result.clone_success == Some(true) {
            summary.cloned += 1;
        }
        if result.record.compiled && !result.variant_records.is_empty() {
            summary.compiled += 1;
        }
        summary.binaries += result.total_binaries();

        for record in result.log_records() {
            log.append(record).map_err(FleetError::Metadata)?;
        }

        if let Some(found) = result.libraries {
            libraries.extend(found);
        }
        if summary.processed % LIBRARY_FLUSH_INTERVAL == 0 {
            libraries.flush().map_err(FleetError::Libraries)?;
        }
        if summary.processed % PROGRESS_INTERVAL == 0 {
            info!(processed = summary.processed, "Processed {} repositories", summary.processed);
        }
    }

    libraries.flush().map_err(FleetError::Libraries)?;
    log.close().map_err(FleetError::Metadata)?;
    summary.libraries = libraries.len();
    info!(
        processed = summary.processed,
        cloned = summary.cloned,
        compiled = summary.compiled,
        binaries = summary.binaries,
        "Crawling finished"
    );
    Ok(summary)
}
