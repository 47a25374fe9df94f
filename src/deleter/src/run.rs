//! One pass of the block lifecycle: fetch, evaluate, mark, clean.

use chrono::{DateTime, Utc};
use common::config::{Configuration, MarkFailurePolicy, RetentionConfig};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use ulid::Ulid;

use crate::bucket::Bucket;
use crate::cleaner::{BlocksCleaner, CleanupReport};
use crate::deletion_mark::DeletionMarkFilter;
use crate::error::{DeleterError, Result};
use crate::fetcher::{ConsistencyDelayFilter, FetchSummary, MetadataFetcher};
use crate::marker::{DeletionMarker, MarkingReport};
use crate::metrics::DeleterMetrics;
use crate::retention::{RetentionEvaluator, RetentionWindow};

/// Stored in the `details` field of marks written by the retention pass.
pub const RETENTION_MARK_DETAILS: &str = "block is outside the retention window";

/// What a completed run did.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: Ulid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub window: RetentionWindow,
    pub fetch: FetchSummary,
    pub marking: MarkingReport,
    pub cleanup: CleanupReport,
}

/// Runs the block lifecycle against one bucket.
///
/// Blocks marked by a run are not cleaned by that same run. They enter the
/// marked set on the next discovery pass and are deleted once their mark is
/// older than the delete delay.
#[derive(Debug)]
pub struct BlocksDeleter {
    fetcher: MetadataFetcher,
    marker: DeletionMarker,
    cleaner: BlocksCleaner,
    retention: RetentionConfig,
    on_mark_failure: MarkFailurePolicy,
    metrics: DeleterMetrics,
}

impl BlocksDeleter {
    pub fn from_config(bucket: Arc<dyn Bucket>, config: &Configuration) -> Result<Self> {
        // Catch empty windows at startup rather than on the first run.
        RetentionWindow::from_config(&config.retention, Utc::now())?;

        let deletion = &config.deletion;
        let mut fetcher = MetadataFetcher::new(bucket.clone(), config.fetcher.concurrency)?;
        if !deletion.consistency_delay.is_zero() {
            fetcher = fetcher.with_filter(ConsistencyDelayFilter::new(deletion.consistency_delay));
        }
        let fetcher =
            fetcher.with_filter(DeletionMarkFilter::new(deletion.ignore_deletion_marks_delay));

        Ok(Self {
            fetcher,
            marker: DeletionMarker::new(bucket.clone(), deletion.dry_run),
            cleaner: BlocksCleaner::new(bucket, deletion.delete_delay, deletion.dry_run),
            retention: config.retention.clone(),
            on_mark_failure: deletion.on_mark_failure,
            metrics: DeleterMetrics::new(),
        })
    }

    /// Share counters with the caller instead of keeping private ones.
    pub fn with_metrics(mut self, metrics: DeleterMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &DeleterMetrics {
        &self.metrics
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunReport> {
        self.run_at(Utc::now(), cancel).await
    }

    /// Run with an explicit notion of the current time.
    ///
    /// Mark ages, relative retention bounds and the consistency delay are all
    /// measured against `now`.
    pub async fn run_at(&self, now: DateTime<Utc>, cancel: &CancellationToken) -> Result<RunReport> {
        let run_id = Ulid::new();
        let span = tracing::info_span!("deleter_run", run_id = %run_id);

        self.run_inner(run_id, now, cancel).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Ulid,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let started_at = Utc::now();
        let window = RetentionWindow::from_config(&self.retention, now)?;

        tracing::info!(
            now = %now,
            window_min = window.min_time,
            window_max = window.max_time,
            "Starting deleter run"
        );

        let fetched = self.fetcher.fetch(now, cancel).await?;
        let fetch = fetched.summary();
        self.metrics.record_fetch(&fetch);

        let candidates = RetentionEvaluator::new(window).deletion_candidates(&fetched.active);

        let mut marking = self
            .marker
            .mark_blocks(
                &candidates,
                Some(RETENTION_MARK_DETAILS),
                now,
                self.on_mark_failure,
                cancel,
            )
            .await;
        self.metrics.record_marking(&marking);
        if let Some(e) = marking.abort_reason.take() {
            return Err(e);
        }
        if marking.cancelled {
            return Err(DeleterError::Cancelled);
        }

        let cleanup = self
            .cleaner
            .delete_marked_blocks(&fetched.marked, now, cancel)
            .await;
        self.metrics.record_cleanup(&cleanup);
        if cleanup.cancelled {
            return Err(DeleterError::Cancelled);
        }

        self.metrics.record_run_completed();

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            window,
            fetch,
            marking,
            cleanup,
        };

        tracing::info!(
            discovered = report.fetch.discovered,
            fetch_failed = report.fetch.failed,
            marked = report.marking.marked.len(),
            already_marked = report.marking.already_marked.len(),
            mark_failed = report.marking.failed.len(),
            cleaned = report.cleanup.cleaned.len(),
            cleanup_failed = report.cleanup.failed.len(),
            pending = report.cleanup.pending.len(),
            elapsed_ms = (report.finished_at - report.started_at).num_milliseconds(),
            "Deleter run complete"
        );

        Ok(report)
    }
}
