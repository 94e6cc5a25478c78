//! Per-repository pipeline configuration.
//!
//! One [`PipelineConfig`] is shared (read-only) by every worker of a run.

use std::path::PathBuf;
use std::time::Duration;

use crate::archive::CompressionType;
use crate::compile::CompileMode;
use crate::error::ConfigError;

/// Default first container uid.
pub const DEFAULT_UID_BASE: u32 = 30_000;

/// Default number of distinct container uids.
pub const DEFAULT_UID_SPAN: u32 = 10_000;

/// Default upper bound on the size of an archived working tree (100 MiB).
pub const DEFAULT_MAX_ARCHIVE_SIZE: u64 = 100 * 1024 * 1024;

/// Configuration for the repository pipeline controller.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    // Locations
    /// Folder holding working trees, one `<owner>_____<name>` folder each.
    pub clone_folder: PathBuf,
    /// Root of the binary dataset: `<binary_folder>/<owner>/<name>/<variant>/`.
    pub binary_folder: PathBuf,
    /// Root of the archived working trees.
    pub archive_folder: PathBuf,

    // Compilation
    /// Compiler for the unobfuscated variant.
    pub compiler: String,
    /// Baseline flags every variant starts from.
    pub base_flags: String,
    pub compile_mode: CompileMode,
    pub record_libraries: bool,
    pub record_metainfo: bool,

    // Timeouts
    pub clone_timeout: Option<Duration>,
    /// Limit for each compile (and obfuscation) stage.
    pub compile_timeout: Option<Duration>,

    // Behavior
    pub force_reclone: bool,
    pub force_recompile: bool,
    pub recursive_clone: bool,

    // Archiving
    pub compression: CompressionType,
    /// Working trees larger than this are deleted instead of archived.
    pub max_archive_size: u64,

    // Container identity
    pub uid_base: u32,
    pub uid_span: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            clone_folder: PathBuf::from("repos/"),
            binary_folder: PathBuf::from("dataset/binaries/"),
            archive_folder: PathBuf::from("dataset/archives/"),

            compiler: "gcc".to_string(),
            base_flags: "-g ".to_string(),
            compile_mode: CompileMode::Batch,
            record_libraries: false,
            record_metainfo: true,

            clone_timeout: Some(Duration::from_secs(600)),
            compile_timeout: Some(Duration::from_secs(900)),

            force_reclone: false,
            force_recompile: false,
            recursive_clone: true,

            compression: CompressionType::Gzip,
            max_archive_size: DEFAULT_MAX_ARCHIVE_SIZE,

            uid_base: DEFAULT_UID_BASE,
            uid_span: DEFAULT_UID_SPAN,
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.compiler.trim().is_empty() {
            return Err(invalid("compiler", "cannot be empty"));
        }

        if self.uid_span == 0 {
            return Err(invalid("uid_span", "must be greater than 0"));
        }

        if self.uid_base == 0 {
            return Err(invalid("uid_base", "must not map containers to root"));
        }

        let upper = u64::from(self.uid_base) + u64::from(self.uid_span);
        if upper > i32::MAX as u64 {
            return Err(invalid(
                "uid_span",
                format!("uid_base + uid_span ({upper}) exceeds {}", i32::MAX),
            ));
        }

        for (key, timeout) in [
            ("clone_timeout", self.clone_timeout),
            ("compile_timeout", self.compile_timeout),
        ] {
            if timeout.is_some_and(|t| t.is_zero()) {
                return Err(invalid(key, "must be greater than 0"));
            }
        }

        if self.max_archive_size == 0 {
            return Err(invalid("max_archive_size", "must be greater than 0"));
        }

        Ok(())
    }

    /// Builder method to set the folder layout.
    pub fn with_folders(
        mut self,
        clone_folder: impl Into<PathBuf>,
        binary_folder: impl Into<PathBuf>,
        archive_folder: impl Into<PathBuf>,
    ) -> Self {
        self.clone_folder = clone_folder.into();
        self.binary_folder = binary_folder.into();
        self.archive_folder = archive_folder.into();
        self
    }

    /// Builder method to set the baseline compiler and flags.
    pub fn with_compiler(mut self, compiler: impl Into<String>, base_flags: impl Into<String>) -> Self {
        self.compiler = compiler.into();
        self.base_flags = base_flags.into();
        self
    }

    /// Builder method to set the compile strategy.
    pub fn with_compile_mode(mut self, mode: CompileMode) -> Self {
        self.compile_mode = mode;
        self
    }

    /// Builder method to set both stage timeouts.
    pub fn with_timeouts(mut self, clone: Option<Duration>, compile: Option<Duration>) -> Self {
        self.clone_timeout = clone;
        self.compile_timeout = compile;
        self
    }

    /// Builder method to set the force flags.
    pub fn with_force(mut self, reclone: bool, recompile: bool) -> Self {
        self.force_reclone = reclone;
        self.force_recompile = recompile;
        self
    }

    /// Builder method to enable library recording.
    pub fn with_record_libraries(mut self, record: bool) -> Self {
        self.record_libraries = record;
        self
    }

    /// Builder method to set archive compression and size limit.
    pub fn with_archive(mut self, compression: CompressionType, max_size: u64) -> Self {
        self.compression = compression;
        self.max_archive_size = max_size;
        self
    }

    /// Builder method to set the container uid range.
    pub fn with_uid_range(mut self, base: u32, span: u32) -> Self {
        self.uid_base = base;
        self.uid_span = span;
        self
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.clone_timeout, Some(Duration::from_secs(600)));
        assert_eq!(config.compile_timeout, Some(Duration::from_secs(900)));
        assert_eq!(config.max_archive_size, 104_857_600);
        assert_eq!(config.compile_mode, CompileMode::Batch);
    }

    #[test]
    fn test_uid_range_validation() {
        let zero_span = PipelineConfig::new().with_uid_range(30_000, 0);
        assert!(matches!(
            zero_span.validate(),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "uid_span"
        ));

        let overflow = PipelineConfig::new().with_uid_range(i32::MAX as u32, 10);
        assert!(overflow.validate().is_err());

        let root = PipelineConfig::new().with_uid_range(0, 10);
        assert!(root.validate().is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = PipelineConfig::new().with_timeouts(Some(Duration::ZERO), None);
        assert!(config.validate().is_err());

        let unlimited = PipelineConfig::new().with_timeouts(None, None);
        assert!(unlimited.validate().is_ok());
    }

    #[test]
    fn test_empty_compiler_rejected() {
        let config = PipelineConfig::new().with_compiler("  ", "-g");
        assert!(config.validate().is_err());
    }
}
