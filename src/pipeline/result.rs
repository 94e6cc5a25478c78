//! Values returned by the repository pipeline.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::compile::CompileResult;
use crate::repo::RepositoryRecord;

/// Recipe statistics gathered after compilation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineMetaInfo {
    pub num_makefiles: usize,
    pub has_gitmodules: bool,
    /// Recipe directories that also carry `configure.ac` or `configure.in`.
    pub makefiles_using_automake: usize,
}

/// Everything the pipeline learned about one repository.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    /// Final state of the record.
    pub record: RepositoryRecord,
    /// `Some(false)` when cloning definitively failed, `Some(true)` when a
    /// clone was performed, `None` when no clone was attempted or its
    /// outcome is unknown.
    pub clone_success: Option<bool>,
    pub repo_size: Option<u64>,
    /// Compile results of the last compiled variant; `Some(vec![])` when the
    /// repository had no recipes.
    pub makefiles: Option<Vec<CompileResult>>,
    pub libraries: Option<BTreeSet<String>>,
    pub meta_info: Option<PipelineMetaInfo>,
    /// One snapshot per processed variant, in processing order.
    pub variant_records: Vec<RepositoryRecord>,
    /// Whether the working tree was archived.
    pub archived: bool,
}

impl PipelineResult {
    pub fn new(record: RepositoryRecord) -> Self {
        Self {
            record,
            clone_success: None,
            repo_size: None,
            makefiles: None,
            libraries: None,
            meta_info: None,
            variant_records: Vec::new(),
            archived: false,
        }
    }

    pub fn with_clone_success(mut self, clone_success: Option<bool>) -> Self {
        self.clone_success = clone_success;
        self
    }

    /// Records to append to the metadata log: every variant snapshot, or the
    /// final record when no variant was processed.
    pub fn log_records(&self) -> Vec<&RepositoryRecord> {
        if self.variant_records.is_empty() {
            vec![&self.record]
        } else {
            self.variant_records.iter().collect()
        }
    }

    /// Total binaries across all variant snapshots.
    pub fn total_binaries(&self) -> usize {
        self.variant_records.iter().map(|r| r.num_binaries).sum()
    }
}
