//! Metrics module for Prometheus-based monitoring.
//!
//! Counters and histograms for repositories, variants and binaries. binforge
//! is a batch job, so instead of serving `/metrics` the final snapshot can be
//! written to a file for a node-exporter textfile collector.
//!
//! # Example
//!
//! ```ignore
//! use binforge::metrics::{init_metrics, MetricsCollector, RepoOutcome};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! let collector = MetricsCollector::new();
//! collector.record_repo(RepoOutcome::Compiled, 42.0);
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{MetricsCollector, RepoOutcome};
pub use prometheus::{export_metrics, init_metrics, write_metrics_file};

pub use prometheus::{
    ACTIVE_WORKERS, BINARIES_TOTAL, COMPILE_DURATION, REGISTRY, REPOS_TOTAL, REPO_DURATION,
    VARIANT_FAILURES_TOTAL,
};
