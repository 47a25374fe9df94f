//! Writing deletion marks.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use common::config::MarkFailurePolicy;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::block::BlockId;
use crate::bucket::Bucket;
use crate::deletion_mark::DeletionMark;
use crate::error::{DeleterError, Result};

/// What a single mark request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// A new deletion mark was written.
    Marked,
    /// The block already carried a mark; it was left untouched.
    AlreadyMarked,
    /// meta.json is gone, so another run has already started deleting the block.
    BlockGone,
    /// Dry-run: nothing was written.
    DryRun,
}

/// Outcome of marking a set of blocks.
#[derive(Debug, Default)]
pub struct MarkingReport {
    pub marked: Vec<BlockId>,
    pub already_marked: Vec<BlockId>,
    pub gone: Vec<BlockId>,
    pub dry_run: Vec<BlockId>,
    /// Blocks whose mark could not be written, with the error text
    pub failed: BTreeMap<BlockId, String>,
    /// Set when the loop stopped because the token was cancelled
    pub cancelled: bool,
    /// The write error that stopped the loop under [`MarkFailurePolicy::Abort`]
    pub abort_reason: Option<DeleterError>,
}

impl MarkingReport {
    pub fn attempted(&self) -> usize {
        self.marked.len()
            + self.already_marked.len()
            + self.gone.len()
            + self.dry_run.len()
            + self.failed.len()
    }
}

/// Writes `deletion-mark.json` for blocks, never overwriting an existing one.
#[derive(Debug, Clone)]
pub struct DeletionMarker {
    bucket: Arc<dyn Bucket>,
    dry_run: bool,
}

impl DeletionMarker {
    pub fn new(bucket: Arc<dyn Bucket>, dry_run: bool) -> Self {
        Self { bucket, dry_run }
    }

    /// Mark one block for deletion.
    ///
    /// The existence check before the write keeps the original mark time when
    /// two runs race on the same block.
    pub async fn mark_for_deletion(
        &self,
        id: BlockId,
        details: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<MarkOutcome> {
        let mark_path = id.deletion_mark_path();

        let already_marked = self
            .bucket
            .exists(&mark_path)
            .await
            .map_err(|source| DeleterError::MarkWrite { id, source })?;
        if already_marked {
            tracing::debug!(block = %id, "Block already marked for deletion");
            return Ok(MarkOutcome::AlreadyMarked);
        }

        let meta_exists = self
            .bucket
            .exists(&id.meta_path())
            .await
            .map_err(|source| DeleterError::MarkWrite { id, source })?;
        if !meta_exists {
            tracing::info!(block = %id, "Block is already being deleted, not marking it");
            return Ok(MarkOutcome::BlockGone);
        }

        if self.dry_run {
            tracing::info!(block = %id, "[DRY-RUN] Would mark block for deletion");
            return Ok(MarkOutcome::DryRun);
        }

        let mark = DeletionMark::new(id, now, details.map(str::to_string));
        let data = serde_json::to_vec(&mark).map_err(|source| DeleterError::Encode { id, source })?;

        self.bucket
            .put(&mark_path, Bytes::from(data))
            .await
            .map_err(|source| DeleterError::MarkWrite { id, source })?;

        tracing::info!(block = %id, marked_at = %now, "Marked block for deletion");
        Ok(MarkOutcome::Marked)
    }

    /// Mark every block in `ids`, stopping at the first block boundary after
    /// `cancel` fires.
    pub async fn mark_blocks(
        &self,
        ids: &[BlockId],
        details: Option<&str>,
        now: DateTime<Utc>,
        policy: MarkFailurePolicy,
        cancel: &CancellationToken,
    ) -> MarkingReport {
        let mut report = MarkingReport::default();

        for &id in ids {
            if cancel.is_cancelled() {
                tracing::info!(
                    remaining = ids.len() - report.attempted(),
                    "Marking cancelled"
                );
                report.cancelled = true;
                break;
            }

            match self.mark_for_deletion(id, details, now).await {
                Ok(MarkOutcome::Marked) => report.marked.push(id),
                Ok(MarkOutcome::AlreadyMarked) => report.already_marked.push(id),
                Ok(MarkOutcome::BlockGone) => report.gone.push(id),
                Ok(MarkOutcome::DryRun) => report.dry_run.push(id),
                Err(e) => {
                    report.failed.insert(id, e.to_string());
                    match policy {
                        MarkFailurePolicy::Abort => {
                            tracing::error!(block = %id, error = %e, "Failed to mark block, aborting");
                            report.abort_reason = Some(e);
                            break;
                        }
                        MarkFailurePolicy::Continue => {
                            tracing::warn!(block = %id, error = %e, "Failed to mark block, continuing");
                        }
                    }
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockMeta;
    use crate::deletion_mark::read_deletion_mark;
    use crate::testing::{FaultyBucket, memory_bucket, upload_block, write_deletion_mark};
    use chrono::TimeZone;
    use ulid::Ulid;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn id(n: u128) -> BlockId {
        BlockId::from(Ulid::from_parts(1_700_000_000_000, n))
    }

    #[tokio::test]
    async fn test_mark_writes_mark() {
        let bucket = memory_bucket();
        upload_block(bucket.as_ref(), &BlockMeta::new(id(1), 0, 100)).await;

        let marker = DeletionMarker::new(bucket.clone(), false);
        let outcome = marker
            .mark_for_deletion(id(1), Some("outside retention"), now())
            .await
            .unwrap();
        assert_eq!(outcome, MarkOutcome::Marked);

        let mark = read_deletion_mark(bucket.as_ref(), id(1)).await.unwrap().unwrap();
        assert_eq!(mark.deletion_time, now().timestamp());
        assert_eq!(mark.details.as_deref(), Some("outside retention"));
    }

    #[tokio::test]
    async fn test_mark_twice_keeps_first_mark() {
        let bucket = memory_bucket();
        upload_block(bucket.as_ref(), &BlockMeta::new(id(1), 0, 100)).await;
        let marker = DeletionMarker::new(bucket.clone(), false);

        let first = marker.mark_for_deletion(id(1), None, now()).await.unwrap();
        let later = now() + chrono::Duration::hours(1);
        let second = marker.mark_for_deletion(id(1), None, later).await.unwrap();

        assert_eq!(first, MarkOutcome::Marked);
        assert_eq!(second, MarkOutcome::AlreadyMarked);

        let mark = read_deletion_mark(bucket.as_ref(), id(1)).await.unwrap().unwrap();
        assert_eq!(mark.marked_at(), now());
    }

    #[tokio::test]
    async fn test_mark_vanished_block_is_noop() {
        let bucket = memory_bucket();
        let marker = DeletionMarker::new(bucket.clone(), false);

        let outcome = marker.mark_for_deletion(id(1), None, now()).await.unwrap();
        assert_eq!(outcome, MarkOutcome::BlockGone);
        assert!(!bucket.exists(&id(1).deletion_mark_path()).await.unwrap());
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let bucket = memory_bucket();
        upload_block(bucket.as_ref(), &BlockMeta::new(id(1), 0, 100)).await;
        let marker = DeletionMarker::new(bucket.clone(), true);

        let outcome = marker.mark_for_deletion(id(1), None, now()).await.unwrap();
        assert_eq!(outcome, MarkOutcome::DryRun);
        assert!(!bucket.exists(&id(1).deletion_mark_path()).await.unwrap());
    }

    #[tokio::test]
    async fn test_abort_policy_stops_at_first_failure() {
        let inner = memory_bucket();
        for n in 1..=3 {
            upload_block(inner.as_ref(), &BlockMeta::new(id(n), 0, 100)).await;
        }
        let bucket = Arc::new(FaultyBucket::new(inner.clone()).fail_put(&id(2).dir()));
        let marker = DeletionMarker::new(bucket, false);

        let report = marker
            .mark_blocks(
                &[id(1), id(2), id(3)],
                None,
                now(),
                MarkFailurePolicy::Abort,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(report.marked, vec![id(1)]);
        assert!(report.failed.contains_key(&id(2)));
        assert!(matches!(
            report.abort_reason,
            Some(DeleterError::MarkWrite { .. })
        ));
        assert!(!inner.exists(&id(3).deletion_mark_path()).await.unwrap());
    }

    #[tokio::test]
    async fn test_continue_policy_marks_the_rest() {
        let inner = memory_bucket();
        for n in 1..=3 {
            upload_block(inner.as_ref(), &BlockMeta::new(id(n), 0, 100)).await;
        }
        let bucket = Arc::new(FaultyBucket::new(inner.clone()).fail_put(&id(2).dir()));
        let marker = DeletionMarker::new(bucket, false);

        let report = marker
            .mark_blocks(
                &[id(1), id(2), id(3)],
                None,
                now(),
                MarkFailurePolicy::Continue,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(report.marked, vec![id(1), id(3)]);
        assert_eq!(report.failed.len(), 1);
        assert!(report.abort_reason.is_none());
    }

    #[tokio::test]
    async fn test_mark_blocks_sorts_outcomes() {
        let bucket = memory_bucket();
        upload_block(bucket.as_ref(), &BlockMeta::new(id(1), 0, 100)).await;
        upload_block(bucket.as_ref(), &BlockMeta::new(id(2), 0, 100)).await;
        write_deletion_mark(bucket.as_ref(), id(2), now()).await;

        let marker = DeletionMarker::new(bucket, false);
        let report = marker
            .mark_blocks(
                &[id(1), id(2), id(3)],
                None,
                now(),
                MarkFailurePolicy::Abort,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(report.marked, vec![id(1)]);
        assert_eq!(report.already_marked, vec![id(2)]);
        assert_eq!(report.gone, vec![id(3)]);
        assert_eq!(report.attempted(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_marking_writes_nothing() {
        let bucket = memory_bucket();
        upload_block(bucket.as_ref(), &BlockMeta::new(id(1), 0, 100)).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let marker = DeletionMarker::new(bucket.clone(), false);
        let report = marker
            .mark_blocks(&[id(1)], None, now(), MarkFailurePolicy::Abort, &cancel)
            .await;

        assert!(report.cancelled);
        assert!(report.marked.is_empty());
        assert!(!bucket.exists(&id(1).deletion_mark_path()).await.unwrap());
    }
}
