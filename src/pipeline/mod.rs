//! Per-repository pipeline.
//!
//! The pipeline takes one [`RepositoryRecord`](crate::repo::RepositoryRecord)
//! from "listed" to "archived":
//!
//! 1. **Restore or clone**: extract an existing archive, or clone the repository
//! 2. **Discover recipes**: find every `Makefile`; repositories without one are deleted
//! 3. **Compile variants**: build every recipe once per obfuscation variant,
//!    verifying source rewriting where the variant requires it
//! 4. **Archive**: compress the working tree and remove it
//!
//! Every stage is bounded by a timeout and every failure is contained to the
//! repository (or, inside stage 3, to the variant) that caused it.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use binforge::compile::{BatchCompiler, CompileMode};
//! use binforge::docker::DockerRunner;
//! use binforge::obfuscation::DockerObfuscator;
//! use binforge::pipeline::{PipelineConfig, RepositoryPipeline};
//! use binforge::repo::{GitCloner, RepositoryRecord};
//!
//! let pipeline = RepositoryPipeline::new(
//!     Arc::new(PipelineConfig::new()),
//!     Arc::new(GitCloner::new()),
//!     BatchCompiler::new(Arc::new(DockerRunner::default()), CompileMode::Batch),
//!     Arc::new(DockerObfuscator::default()),
//! );
//! let result = pipeline.process(RepositoryRecord::new(0, "owner", "name")).await;
//! ```

pub mod config;
pub mod controller;
pub mod result;

pub use config::PipelineConfig;
pub use controller::{discover_recipes, RepoState, RepositoryPipeline, VariantOutcome};
pub use result::{PipelineMetaInfo, PipelineResult};
