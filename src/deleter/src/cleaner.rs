//! Deleting marked blocks once their grace period has passed.
//!
//! Every object of a block is deleted before its `meta.json`, and the deletion
//! mark goes last. A cleanup that stops half way leaves the block discoverable
//! as marked, either normally or as a partial block, so the next run finishes
//! the job.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::block::BlockId;
use crate::bucket::Bucket;
use crate::deletion_mark::DeletionMark;
use crate::error::{BucketError, DeleterError, Result};

/// Outcome of one cleanup pass.
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    /// Blocks whose objects and mark are all gone
    pub cleaned: Vec<BlockId>,
    /// Blocks that are still marked because a delete failed, with the error text
    pub failed: BTreeMap<BlockId, String>,
    /// Marked blocks still inside their grace period
    pub pending: Vec<BlockId>,
    /// Blocks that would have been deleted in dry-run mode
    pub dry_run: Vec<BlockId>,
    pub cancelled: bool,
}

#[derive(Debug, Clone)]
pub struct BlocksCleaner {
    bucket: Arc<dyn Bucket>,
    delete_delay: Duration,
    dry_run: bool,
}

impl BlocksCleaner {
    pub fn new(bucket: Arc<dyn Bucket>, delete_delay: Duration, dry_run: bool) -> Self {
        Self {
            bucket,
            delete_delay,
            dry_run,
        }
    }

    /// Delete every block in `marked` whose mark is at least `delete_delay` old.
    ///
    /// A failure on one block is recorded in the report and the pass moves on to
    /// the next block. Cancellation is honoured between blocks only.
    pub async fn delete_marked_blocks(
        &self,
        marked: &BTreeMap<BlockId, DeletionMark>,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> CleanupReport {
        let mut report = CleanupReport::default();

        tracing::info!(
            marked = marked.len(),
            delete_delay = ?self.delete_delay,
            dry_run = self.dry_run,
            "Starting cleanup of marked blocks"
        );

        for (&id, mark) in marked {
            if cancel.is_cancelled() {
                tracing::info!("Cleanup cancelled");
                report.cancelled = true;
                break;
            }

            if !mark.is_older_than(self.delete_delay, now) {
                tracing::debug!(
                    block = %id,
                    marked_at = %mark.marked_at(),
                    "Block is not yet eligible for deletion"
                );
                report.pending.push(id);
                continue;
            }

            if self.dry_run {
                tracing::info!(
                    block = %id,
                    marked_at = %mark.marked_at(),
                    "[DRY-RUN] Would delete block"
                );
                report.dry_run.push(id);
                continue;
            }

            match self.delete_block(id).await {
                Ok(()) => {
                    tracing::info!(block = %id, "Deleted block");
                    report.cleaned.push(id);
                }
                Err(e) => {
                    tracing::warn!(block = %id, error = %e, "Failed to delete block, will retry next run");
                    report.failed.insert(id, e.to_string());
                }
            }
        }

        tracing::info!(
            cleaned = report.cleaned.len(),
            failed = report.failed.len(),
            pending = report.pending.len(),
            "Cleanup of marked blocks complete"
        );

        report
    }

    /// Delete all objects of a block: data first, then meta.json, then the mark.
    ///
    /// Objects that are already gone count as deleted.
    pub async fn delete_block(&self, id: BlockId) -> Result<()> {
        let delete_error = |source: BucketError| DeleterError::Delete { id, source };

        let meta_path = id.meta_path();
        let mark_path = id.deletion_mark_path();

        let keys = self.bucket.list(&id.dir()).await.map_err(delete_error)?;
        for key in keys.iter().filter(|k| **k != meta_path && **k != mark_path) {
            tracing::trace!(block = %id, key = %key, "Deleting block object");
            self.bucket.delete(key).await.map_err(delete_error)?;
        }

        self.bucket.delete(&meta_path).await.map_err(delete_error)?;
        self.bucket.delete(&mark_path).await.map_err(delete_error)?;

        Ok(())
    }
}
