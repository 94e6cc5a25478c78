//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by binforge and provides
//! functions for initializing, registering, and exporting metrics.

use std::path::Path;
use std::sync::OnceLock;

use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};

/// Global Prometheus registry for all binforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Repositories processed, labeled by outcome.
pub static REPOS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Wall-clock time spent per repository, in seconds.
pub static REPO_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Binaries produced, labeled by obfuscation variant.
pub static BINARIES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Compile stage duration in seconds, labeled by obfuscation variant.
pub static COMPILE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Variants that produced no usable result, labeled by variant and reason.
pub static VARIANT_FAILURES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Number of workers currently processing a repository.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Calling this more than once is harmless: later calls build a fresh
/// registry but the statics keep the first one.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let repos_total = CounterVec::new(
        Opts::new("binforge_repos_total", "Repositories processed"),
        &["outcome"],
    )?;

    let repo_duration = Histogram::with_opts(
        HistogramOpts::new(
            "binforge_repo_duration_seconds",
            "Time spent processing one repository",
        )
        .buckets(vec![10.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0]),
    )?;

    let binaries_total = CounterVec::new(
        Opts::new("binforge_binaries_total", "Binaries produced"),
        &["variant"],
    )?;

    let compile_duration = HistogramVec::new(
        HistogramOpts::new(
            "binforge_compile_duration_seconds",
            "Compile stage duration in seconds",
        )
        .buckets(vec![5.0, 30.0, 60.0, 180.0, 600.0, 900.0]),
        &["variant"],
    )?;

    let variant_failures_total = CounterVec::new(
        Opts::new(
            "binforge_variant_failures_total",
            "Variants that produced no usable result",
        ),
        &["variant", "reason"],
    )?;

    let active_workers = Gauge::new("binforge_active_workers", "Number of active workers")?;

    registry.register(Box::new(repos_total.clone()))?;
    registry.register(Box::new(repo_duration.clone()))?;
    registry.register(Box::new(binaries_total.clone()))?;
    registry.register(Box::new(compile_duration.clone()))?;
    registry.register(Box::new(variant_failures_total.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = REPOS_TOTAL.set(repos_total);
    let _ = REPO_DURATION.set(repo_duration);
    let _ = BINARIES_TOTAL.set(binaries_total);
    let _ = COMPILE_DURATION.set(compile_duration);
    let _ = VARIANT_FAILURES_TOTAL.set(variant_failures_total);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// Write the current metrics snapshot to `path` (node-exporter textfile format).
pub fn write_metrics_file(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, export_metrics())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(repos) = REPOS_TOTAL.get() {
            repos.with_label_values(&["compiled"]).inc();
        }
        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("binforge_repos_total"));
    }

    #[test]
    fn test_write_metrics_file() {
        let _ = init_metrics();
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("metrics/binforge.prom");
        write_metrics_file(&path).expect("write");
        assert!(path.exists());
    }
}
