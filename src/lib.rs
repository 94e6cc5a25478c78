//! binforge: builds a dataset of compiled binaries from C repositories.
//!
//! Repositories are cloned, every Makefile is compiled inside a Docker image
//! once per obfuscation variant, and the working trees are archived. The
//! [`scheduler`] drives many [`pipeline`] runs concurrently.

pub mod archive;
pub mod cli;
pub mod compile;
pub mod docker;
pub mod error;
pub mod metrics;
pub mod obfuscation;
pub mod pipeline;
pub mod recipes;
pub mod repo;
pub mod scheduler;

// Re-export commonly used error types
pub use error::{
    ArchiveError, CompileError, ConfigError, ContainerError, FleetError, ObfuscationError,
    PipelineError,
};
