//! Repository descriptors and the clone primitive.
//!
//! A [`RepositoryRecord`] is created for every line of the repository list and
//! is the unit serialized to the metadata log. The clone stage is abstracted
//! behind [`RepoCloner`] so the pipeline can run against fakes in tests.

pub mod clone;
pub mod list;

use serde::{Deserialize, Serialize};

use crate::obfuscation::ObfuscationVariant;

pub use clone::{CloneOutcome, CloneRequest, CloneStatus, GitCloner, RepoCloner};
pub use list::{iter_repos, parse_repo_url};

/// Separator between owner and name in working-directory names. Keeps the
/// clone folder flat instead of one directory per owner.
pub const FOLDER_SEPARATOR: &str = "_____";

/// One repository under processing, as recorded in the metadata log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRecord {
    /// Position in the repository list.
    pub idx: usize,
    pub repo_owner: String,
    pub repo_name: String,
    /// Size of the working tree in bytes, known after clone or restore.
    pub repo_size: u64,
    /// Whether the repository has been (or is believed to be) cloneable.
    pub clone_successful: bool,
    /// Variant the counters below refer to.
    pub obfuscation: ObfuscationVariant,
    /// Whether at least one recipe produced a binary.
    pub compiled: bool,
    /// Total number of Makefiles found.
    pub num_makefiles: usize,
    /// Number of Makefiles whose build exited successfully.
    pub num_makefiles_succeeded: usize,
    /// Number of Makefiles that produced at least one binary.
    pub num_makefiles_binaries: usize,
    /// Number of binaries produced.
    pub num_binaries: usize,
    /// Commit the working tree was checked out at.
    pub commit_hash: Option<String>,
    /// Optimization level the binaries were compiled with.
    pub optimization: String,
}

impl RepositoryRecord {
    /// Creates a fresh record, optimistically marked cloneable and not compiled.
    pub fn new(idx: usize, owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            idx,
            repo_owner: owner.into(),
            repo_name: name.into(),
            repo_size: 0,
            clone_successful: true,
            obfuscation: ObfuscationVariant::None,
            compiled: false,
            num_makefiles: 0,
            num_makefiles_succeeded: 0,
            num_makefiles_binaries: 0,
            num_binaries: 0,
            commit_hash: None,
            optimization: String::new(),
        }
    }

    /// `owner/name`.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.repo_owner, self.repo_name)
    }

    /// Name of the working directory inside the clone folder.
    pub fn folder_name(&self) -> String {
        format!("{}{}{}", self.repo_owner, FOLDER_SEPARATOR, self.repo_name)
    }

    /// Container uid for this repository: `base + idx % span`.
    ///
    /// Distinct indices within one span map to distinct uids, so concurrent
    /// workers never share file ownership inside their containers.
    pub fn container_uid(&self, base: u32, span: u32) -> u32 {
        let span = span.max(1);
        base + (self.idx % span as usize) as u32
    }

    /// Zero the per-variant counters before compiling a new variant.
    pub fn reset_for_variant(&mut self, variant: ObfuscationVariant) {
        self.obfuscation = variant;
        self.compiled = false;
        self.num_makefiles_succeeded = 0;
        self.num_makefiles_binaries = 0;
        self.num_binaries = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_record_defaults() {
        let record = RepositoryRecord::new(3, "torvalds", "linux");
        assert_eq!(record.full_name(), "torvalds/linux");
        assert_eq!(record.folder_name(), "torvalds_____linux");
        assert!(record.clone_successful);
        assert!(!record.compiled);
        assert_eq!(record.obfuscation, ObfuscationVariant::None);
    }

    #[test]
    fn test_container_uid_range() {
        let mut record = RepositoryRecord::new(0, "a", "b");
        assert_eq!(record.container_uid(30_000, 10_000), 30_000);
        record.idx = 12_345;
        assert_eq!(record.container_uid(30_000, 10_000), 32_345);
        record.idx = 9_999;
        assert_eq!(record.container_uid(30_000, 10_000), 39_999);
        assert_eq!(record.container_uid(30_000, 0), 30_000);
    }

    #[test]
    fn test_serialized_keys() {
        let mut record = RepositoryRecord::new(1, "owner", "name");
        record.obfuscation = ObfuscationVariant::LlvmAll;
        record.commit_hash = Some("abc123".to_string());
        let value = serde_json::to_value(&record).expect("serialize");
        for key in [
            "idx",
            "repo_owner",
            "repo_name",
            "repo_size",
            "clone_successful",
            "obfuscation",
            "compiled",
            "num_makefiles",
            "num_makefiles_succeeded",
            "num_makefiles_binaries",
            "num_binaries",
            "commit_hash",
            "optimization",
        ] {
            assert!(value.get(key).is_some(), "missing key {key}");
        }
        assert_eq!(value["obfuscation"], "llvm-obfuscation-all");
    }

    #[test]
    fn test_reset_for_variant_keeps_identity() {
        let mut record = RepositoryRecord::new(1, "owner", "name");
        record.num_makefiles = 4;
        record.num_binaries = 9;
        record.compiled = true;
        record.reset_for_variant(ObfuscationVariant::AdvObfuscation);
        assert_eq!(record.obfuscation, ObfuscationVariant::AdvObfuscation);
        assert_eq!(record.num_makefiles, 4);
        assert_eq!(record.num_binaries, 0);
        assert!(!record.compiled);
    }
}
