//! Error types for binforge operations.
//!
//! Defines error types for the major subsystems:
//! - Container command execution
//! - Batch compilation
//! - Source obfuscation
//! - Repository archiving
//! - The per-repository pipeline
//! - The fleet run
//! - Configuration

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while running a command inside a container.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("Container command timed out after {timeout:?}: {command}")]
    Timeout {
        command: String,
        timeout: Duration,
        captured_output: Option<String>,
    },

    #[error("Failed to spawn container command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to resolve host identity: {0}")]
    Identity(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContainerError {
    /// Returns true if this error represents an expired deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Errors that can occur while compiling a repository.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Compilation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Container error: {0}")]
    Container(ContainerError),

    #[error("Malformed compile log entry: {0}")]
    MalformedLog(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ContainerError> for CompileError {
    fn from(err: ContainerError) -> Self {
        match err {
            ContainerError::Timeout { timeout, .. } => Self::Timeout(timeout),
            other => Self::Container(other),
        }
    }
}

/// Errors that can occur while applying source obfuscation.
#[derive(Debug, Error)]
pub enum ObfuscationError {
    #[error("Obfuscator timed out after {0:?}")]
    Timeout(Duration),

    #[error("Obfuscator exited with code {code}: {output}")]
    Failed { code: i32, output: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while compressing or extracting an archive.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Archive operation on '{path}' timed out after {timeout:?}")]
    Timeout { path: PathBuf, timeout: Duration },

    #[error("Archive operation on '{path}' failed: {reason}")]
    Failed { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while driving a single repository through the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("No Makefiles found in {0}")]
    NoRecipes(String),

    #[error("Obfuscation of {repo} could not be verified ({variant})")]
    VerificationFailed { repo: String, variant: String },

    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("Obfuscation error: {0}")]
    Obfuscation(#[from] ObfuscationError),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Container error: {0}")]
    Container(#[from] ContainerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that stop a fleet run.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("Cannot read repository list '{path}': {source}")]
    RepoList {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Metadata log error: {0}")]
    Metadata(std::io::Error),

    #[error("Library log error: {0}")]
    Libraries(std::io::Error),

    #[error("Failed to clean clone folder: {0}")]
    Cleanup(#[from] ContainerError),

    #[error("Aggregator task failed: {0}")]
    Aggregator(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
