//! Recording helpers over the raw Prometheus metrics.
//!
//! All methods are no-ops until [`super::init_metrics`] has run, so library
//! code can record unconditionally.

use super::prometheus::{
    ACTIVE_WORKERS, BINARIES_TOTAL, COMPILE_DURATION, REPOS_TOTAL, REPO_DURATION,
    VARIANT_FAILURES_TOTAL,
};

/// Final disposition of a repository, used as the `outcome` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoOutcome {
    /// Already processed; nothing was done.
    Skipped,
    /// Could not be cloned or restored.
    CloneFailed,
    /// No build recipes.
    NoRecipes,
    /// At least one variant produced binaries.
    Compiled,
    /// Recipes were built but no variant produced binaries.
    NotCompiled,
    /// An error or panic escaped the pipeline.
    Aborted,
}

impl RepoOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::CloneFailed => "clone_failed",
            Self::NoRecipes => "no_recipes",
            Self::Compiled => "compiled",
            Self::NotCompiled => "not_compiled",
            Self::Aborted => "aborted",
        }
    }
}

/// Metrics collector for recording binforge operational metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a processed repository.
    pub fn record_repo(&self, outcome: RepoOutcome, duration_secs: f64) {
        if let Some(repos_total) = REPOS_TOTAL.get() {
            repos_total.with_label_values(&[outcome.as_str()]).inc();
        }
        if let Some(repo_duration) = REPO_DURATION.get() {
            repo_duration.observe(duration_secs);
        }
        tracing::trace!(outcome = outcome.as_str(), duration_secs, "Recorded repository metric");
    }

    /// Record a compiled variant.
    pub fn record_variant(&self, variant: &str, binaries: usize, duration_secs: f64) {
        if let Some(binaries_total) = BINARIES_TOTAL.get() {
            binaries_total
                .with_label_values(&[variant])
                .inc_by(binaries as f64);
        }
        if let Some(compile_duration) = COMPILE_DURATION.get() {
            compile_duration
                .with_label_values(&[variant])
                .observe(duration_secs);
        }
    }

    /// Record a variant that failed (`timeout`, `obfuscation`, `verification`, `error`).
    pub fn record_variant_failure(&self, variant: &str, reason: &str) {
        if let Some(failures) = VARIANT_FAILURES_TOTAL.get() {
            failures.with_label_values(&[variant, reason]).inc();
        }
        tracing::trace!(variant, reason, "Recorded variant failure");
    }

    pub fn worker_started(&self) {
        if let Some(active) = ACTIVE_WORKERS.get() {
            active.inc();
        }
    }

    pub fn worker_finished(&self) {
        if let Some(active) = ACTIVE_WORKERS.get() {
            active.dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::init_metrics;

    #[test]
    fn test_collector_without_init_is_noop() {
        let collector = MetricsCollector::new();
        collector.record_repo(RepoOutcome::Skipped, 0.1);
        collector.record_variant("none", 3, 1.0);
        collector.record_variant_failure("adv-obfuscation", "verification");
    }

    #[test]
    fn test_collector_records() {
        let _ = init_metrics();
        let collector = MetricsCollector::new();
        collector.record_variant("llvm-obfuscation-fla", 4, 2.0);
        collector.worker_started();
        collector.worker_finished();

        if let Some(binaries) = BINARIES_TOTAL.get() {
            assert!(binaries.with_label_values(&["llvm-obfuscation-fla"]).get() >= 4.0);
        }
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(RepoOutcome::CloneFailed.as_str(), "clone_failed");
        assert_eq!(RepoOutcome::Compiled.as_str(), "compiled");
    }
}
