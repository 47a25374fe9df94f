//! Deleter metrics tracking
//!
//! Components return reports; the run orchestrator folds them into these
//! process-wide atomic counters.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::cleaner::CleanupReport;
use crate::fetcher::FetchSummary;
use crate::marker::MarkingReport;

/// Thread-safe counters for the block lifecycle
#[derive(Debug, Clone)]
pub struct DeleterMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    blocks_marked_for_deletion: AtomicUsize,
    blocks_cleaned: AtomicUsize,
    cleanup_failures: AtomicUsize,
    blocks_fetch_failed: AtomicUsize,
    runs_completed: AtomicUsize,
}

impl Default for DeleterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl DeleterMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                blocks_marked_for_deletion: AtomicUsize::new(0),
                blocks_cleaned: AtomicUsize::new(0),
                cleanup_failures: AtomicUsize::new(0),
                blocks_fetch_failed: AtomicUsize::new(0),
                runs_completed: AtomicUsize::new(0),
            }),
        }
    }

    pub fn record_fetch(&self, summary: &FetchSummary) {
        self.inner
            .blocks_fetch_failed
            .fetch_add(summary.failed, Ordering::Relaxed);
    }

    /// Only newly written marks count; no-ops and dry-run marks do not.
    pub fn record_marking(&self, report: &MarkingReport) {
        self.inner
            .blocks_marked_for_deletion
            .fetch_add(report.marked.len(), Ordering::Relaxed);
    }

    pub fn record_cleanup(&self, report: &CleanupReport) {
        self.inner
            .blocks_cleaned
            .fetch_add(report.cleaned.len(), Ordering::Relaxed);
        self.inner
            .cleanup_failures
            .fetch_add(report.failed.len(), Ordering::Relaxed);
    }

    pub fn record_run_completed(&self) {
        self.inner.runs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn blocks_marked_for_deletion(&self) -> usize {
        self.inner.blocks_marked_for_deletion.load(Ordering::Relaxed)
    }

    pub fn blocks_cleaned(&self) -> usize {
        self.inner.blocks_cleaned.load(Ordering::Relaxed)
    }

    pub fn cleanup_failures(&self) -> usize {
        self.inner.cleanup_failures.load(Ordering::Relaxed)
    }

    pub fn blocks_fetch_failed(&self) -> usize {
        self.inner.blocks_fetch_failed.load(Ordering::Relaxed)
    }

    pub fn runs_completed(&self) -> usize {
        self.inner.runs_completed.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all counters
    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            blocks_marked_for_deletion: self.blocks_marked_for_deletion(),
            blocks_cleaned: self.blocks_cleaned(),
            cleanup_failures: self.cleanup_failures(),
            blocks_fetch_failed: self.blocks_fetch_failed(),
            runs_completed: self.runs_completed(),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSummary {
    pub blocks_marked_for_deletion: usize,
    pub blocks_cleaned: usize,
    pub cleanup_failures: usize,
    pub blocks_fetch_failed: usize,
    pub runs_completed: usize,
}

impl MetricsSummary {
    pub fn log(&self) {
        tracing::info!(
            runs_completed = self.runs_completed,
            blocks_marked_for_deletion = self.blocks_marked_for_deletion,
            blocks_cleaned = self.blocks_cleaned,
            cleanup_failures = self.cleanup_failures,
            blocks_fetch_failed = self.blocks_fetch_failed,
            "Deleter metrics summary"
        );
    }
}
