//! Block discovery.
//!
//! One pass lists the top-level directories of the bucket, reads `meta.json`
//! for every directory named by a ULID with bounded concurrency, and routes
//! each block through the filter chain into the active set, the marked set,
//! the partial set, the per-block error map or the excluded map.

mod filter;

pub use filter::{ConsistencyDelayFilter, FilterDecision, MetadataFilter};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::block::{BlockId, BlockMeta};
use crate::bucket::Bucket;
use crate::deletion_mark::{DeletionMark, read_deletion_mark};
use crate::error::{DeleterError, FetchError, Result};

/// Outcome of one discovery pass.
///
/// Every discovered block appears in exactly one of the five collections.
/// Directories with no objects left in them are not blocks and appear in none.
#[derive(Debug, Default)]
pub struct FetchResult {
    /// Blocks that are not scheduled for deletion
    pub active: BTreeMap<BlockId, BlockMeta>,
    /// Blocks whose deletion mark is older than the filter delay, plus partial
    /// blocks left behind by an interrupted cleanup
    pub marked: BTreeMap<BlockId, DeletionMark>,
    /// Directories holding objects but no meta.json and no deletion mark,
    /// usually an upload still in progress
    pub partial: BTreeSet<BlockId>,
    /// Blocks whose metadata or mark could not be read this pass
    pub errors: BTreeMap<BlockId, FetchError>,
    /// Blocks dropped by a filter, keyed to the filter name
    pub excluded: BTreeMap<BlockId, &'static str>,
}

impl FetchResult {
    pub fn summary(&self) -> FetchSummary {
        FetchSummary {
            discovered: self.active.len()
                + self.marked.len()
                + self.partial.len()
                + self.errors.len()
                + self.excluded.len(),
            active: self.active.len(),
            marked: self.marked.len(),
            partial: self.partial.len(),
            failed: self.errors.len(),
            excluded: self.excluded.len(),
        }
    }
}

/// Counts of a [`FetchResult`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchSummary {
    pub discovered: usize,
    pub active: usize,
    pub marked: usize,
    pub partial: usize,
    pub failed: usize,
    pub excluded: usize,
}

enum BlockOutcome {
    Active(BlockMeta),
    Marked(DeletionMark),
    Partial,
    Excluded(&'static str),
    Failed(FetchError),
    /// Empty directory left behind by a store with real directories
    Gone,
}

/// Discovers blocks and their metadata.
#[derive(Debug)]
pub struct MetadataFetcher {
    bucket: Arc<dyn Bucket>,
    concurrency: usize,
    filters: Vec<Box<dyn MetadataFilter>>,
}

impl MetadataFetcher {
    /// `concurrency` bounds the number of in-flight meta.json reads.
    pub fn new(bucket: Arc<dyn Bucket>, concurrency: usize) -> Result<Self> {
        if concurrency == 0 {
            return Err(DeleterError::Config(
                "fetcher concurrency must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            bucket,
            concurrency,
            filters: Vec::new(),
        })
    }

    /// Append a filter to the chain.
    pub fn with_filter(mut self, filter: impl MetadataFilter + 'static) -> Self {
        self.filters.push(Box::new(filter));
        self
    }

    /// Run one discovery pass.
    ///
    /// Only a failure to list the bucket fails the pass; anything that goes
    /// wrong for a single block lands in [`FetchResult::errors`]. Blocks not
    /// yet started when `cancel` fires are skipped and the pass returns
    /// [`DeleterError::Cancelled`].
    pub async fn fetch(&self, now: DateTime<Utc>, cancel: &CancellationToken) -> Result<FetchResult> {
        let dirs = self.bucket.list_dirs().await.map_err(DeleterError::List)?;

        let ids: Vec<BlockId> = dirs
            .iter()
            .filter_map(|dir| {
                let id = BlockId::from_dir_name(dir);
                if id.is_none() {
                    tracing::trace!(dir = %dir, "Ignoring non-block directory");
                }
                id
            })
            .collect();

        tracing::debug!(
            directories = dirs.len(),
            blocks = ids.len(),
            concurrency = self.concurrency,
            "Fetching block metadata"
        );

        let outcomes: Vec<(BlockId, Option<BlockOutcome>)> = stream::iter(ids)
            .map(|id| async move {
                if cancel.is_cancelled() {
                    return (id, None);
                }
                (id, Some(self.fetch_block(id, now).await))
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        if cancel.is_cancelled() {
            tracing::info!("Metadata fetch cancelled");
            return Err(DeleterError::Cancelled);
        }

        let mut result = FetchResult::default();
        for (id, outcome) in outcomes {
            match outcome {
                Some(BlockOutcome::Active(meta)) => {
                    result.active.insert(id, meta);
                }
                Some(BlockOutcome::Marked(mark)) => {
                    result.marked.insert(id, mark);
                }
                Some(BlockOutcome::Partial) => {
                    result.partial.insert(id);
                }
                Some(BlockOutcome::Excluded(filter)) => {
                    result.excluded.insert(id, filter);
                }
                Some(BlockOutcome::Failed(e)) => {
                    tracing::warn!(block = %id, error = %e, "Failed to fetch block metadata");
                    result.errors.insert(id, e);
                }
                Some(BlockOutcome::Gone) | None => {}
            }
        }

        let summary = result.summary();
        tracing::info!(
            discovered = summary.discovered,
            active = summary.active,
            marked = summary.marked,
            partial = summary.partial,
            failed = summary.failed,
            excluded = summary.excluded,
            "Fetched block metadata"
        );

        Ok(result)
    }

    async fn fetch_block(&self, id: BlockId, now: DateTime<Utc>) -> BlockOutcome {
        let meta = match self.bucket.get(&id.meta_path()).await {
            Ok(data) => match BlockMeta::parse(id, &data) {
                Ok(meta) => meta,
                Err(e) => return BlockOutcome::Failed(e),
            },
            Err(e) if e.is_not_found() => return self.partial_block(id).await,
            Err(e) => return BlockOutcome::Failed(e.into()),
        };

        for filter in &self.filters {
            match filter.decide(self.bucket.as_ref(), &meta, now).await {
                Ok(FilterDecision::Keep) => {}
                Ok(FilterDecision::Marked(mark)) => return BlockOutcome::Marked(mark),
                Ok(FilterDecision::Exclude) => return BlockOutcome::Excluded(filter.name()),
                Err(e) => return BlockOutcome::Failed(e),
            }
        }

        BlockOutcome::Active(meta)
    }

    /// A directory without meta.json is an upload in progress, a cleanup
    /// that stopped after deleting meta.json, or the empty directory a
    /// filesystem store keeps after a finished cleanup. Only an interrupted
    /// cleanup still carries a deletion mark.
    async fn partial_block(&self, id: BlockId) -> BlockOutcome {
        match read_deletion_mark(self.bucket.as_ref(), id).await {
            Ok(Some(mark)) => {
                tracing::debug!(block = %id, "Partially deleted block carries a deletion mark");
                return BlockOutcome::Marked(mark);
            }
            Ok(None) => {}
            Err(e) => return BlockOutcome::Failed(e),
        }

        match self.bucket.list(&id.dir()).await {
            Ok(keys) if keys.is_empty() => {
                tracing::trace!(block = %id, "Ignoring empty block directory");
                BlockOutcome::Gone
            }
            Ok(_) => {
                tracing::debug!(block = %id, "Block has no meta.json yet");
                BlockOutcome::Partial
            }
            Err(e) => BlockOutcome::Failed(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deletion_mark::DeletionMarkFilter;
    use crate::testing::{FaultyBucket, block_keys, memory_bucket, upload_block, write_deletion_mark};
    use bytes::Bytes;
    use chrono::TimeZone;
    use std::time::Duration;
    use ulid::Ulid;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn id(n: u128) -> BlockId {
        BlockId::from(Ulid::from_parts(1_700_000_000_000, n))
    }

    #[tokio::test]
    async fn test_fetch_sorts_blocks_into_sets() {
        let bucket = memory_bucket();
        upload_block(bucket.as_ref(), &BlockMeta::new(id(1), 0, 100)).await;
        upload_block(bucket.as_ref(), &BlockMeta::new(id(2), 100, 200)).await;
        write_deletion_mark(bucket.as_ref(), id(2), now() - chrono::Duration::hours(1)).await;
        bucket
            .put(&id(3).meta_path(), Bytes::from_static(b"{broken"))
            .await
            .unwrap();
        bucket
            .put("debug/metas/x.json", Bytes::from_static(b"{}"))
            .await
            .unwrap();

        let fetcher = MetadataFetcher::new(bucket, 4)
            .unwrap()
            .with_filter(DeletionMarkFilter::default());
        let result = fetcher.fetch(now(), &CancellationToken::new()).await.unwrap();

        assert_eq!(result.active.keys().copied().collect::<Vec<_>>(), vec![id(1)]);
        assert_eq!(result.marked.keys().copied().collect::<Vec<_>>(), vec![id(2)]);
        assert!(matches!(
            result.errors.get(&id(3)),
            Some(FetchError::CorruptedMeta(_))
        ));
        assert_eq!(result.summary().discovered, 3);
    }

    #[tokio::test]
    async fn test_fetch_without_filters_keeps_marked_blocks_active() {
        let bucket = memory_bucket();
        upload_block(bucket.as_ref(), &BlockMeta::new(id(1), 0, 100)).await;
        write_deletion_mark(bucket.as_ref(), id(1), now()).await;

        let fetcher = MetadataFetcher::new(bucket, 1).unwrap();
        let result = fetcher.fetch(now(), &CancellationToken::new()).await.unwrap();

        assert!(result.active.contains_key(&id(1)));
        assert!(result.marked.is_empty());
    }

    #[tokio::test]
    async fn test_partial_blocks() {
        let bucket = memory_bucket();
        // Cleanup interrupted after meta.json was deleted.
        bucket
            .put(&format!("{}/chunks/000001", id(1)), Bytes::from_static(b"c"))
            .await
            .unwrap();
        write_deletion_mark(bucket.as_ref(), id(1), now()).await;
        // Upload still in progress.
        bucket
            .put(&format!("{}/index", id(2)), Bytes::from_static(b"i"))
            .await
            .unwrap();

        let fetcher = MetadataFetcher::new(bucket, 2)
            .unwrap()
            .with_filter(DeletionMarkFilter::default());
        let result = fetcher.fetch(now(), &CancellationToken::new()).await.unwrap();

        assert!(result.marked.contains_key(&id(1)));
        assert!(result.partial.contains(&id(2)));
        assert!(result.errors.is_empty());
        assert_eq!(result.summary().failed, 0);
        assert_eq!(result.summary().partial, 1);
    }

    #[tokio::test]
    async fn test_empty_block_directory_is_not_a_block() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = object_store::local::LocalFileSystem::new_with_prefix(dir.path()).unwrap();
        let bucket: Arc<dyn Bucket> = Arc::new(crate::bucket::ObjectStoreBucket::new(Arc::new(store)));
        upload_block(bucket.as_ref(), &BlockMeta::new(id(1), 0, 100)).await;
        for key in block_keys(bucket.as_ref(), id(1)).await {
            bucket.delete(&key).await.unwrap();
        }

        let fetcher = MetadataFetcher::new(bucket, 1)
            .unwrap()
            .with_filter(DeletionMarkFilter::default());
        let result = fetcher.fetch(now(), &CancellationToken::new()).await.unwrap();

        assert_eq!(result.summary(), FetchSummary::default());
    }

    #[tokio::test]
    async fn test_list_failure_fails_the_pass() {
        let bucket = Arc::new(FaultyBucket::new(memory_bucket()).fail_list());

        let fetcher = MetadataFetcher::new(bucket, 2).unwrap();
        let err = fetcher.fetch(now(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, DeleterError::List(_)));
    }

    #[tokio::test]
    async fn test_get_failure_is_isolated() {
        let inner = memory_bucket();
        upload_block(inner.as_ref(), &BlockMeta::new(id(1), 0, 100)).await;
        upload_block(inner.as_ref(), &BlockMeta::new(id(2), 0, 100)).await;
        let bucket = Arc::new(FaultyBucket::new(inner).fail_get(&id(2).dir()));

        let fetcher = MetadataFetcher::new(bucket, 2).unwrap();
        let result = fetcher.fetch(now(), &CancellationToken::new()).await.unwrap();

        assert!(result.active.contains_key(&id(1)));
        assert!(matches!(result.errors.get(&id(2)), Some(FetchError::Bucket(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let inner = memory_bucket();
        for n in 0..20 {
            upload_block(inner.as_ref(), &BlockMeta::new(id(n), 0, 100)).await;
        }
        let bucket = Arc::new(FaultyBucket::new(inner).with_get_latency(Duration::from_millis(50)));

        let fetcher = MetadataFetcher::new(bucket.clone(), 3).unwrap();
        let result = fetcher.fetch(now(), &CancellationToken::new()).await.unwrap();

        assert_eq!(result.active.len(), 20);
        assert_eq!(bucket.max_in_flight_gets(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_fetch() {
        let bucket = memory_bucket();
        upload_block(bucket.as_ref(), &BlockMeta::new(id(1), 0, 100)).await;

        let cancel = CancellationToken::new();
        cancel.cancel();

        let fetcher = MetadataFetcher::new(bucket, 1).unwrap();
        let err = fetcher.fetch(now(), &cancel).await.unwrap_err();
        assert!(matches!(err, DeleterError::Cancelled));
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let err = MetadataFetcher::new(memory_bucket(), 0).unwrap_err();
        assert!(matches!(err, DeleterError::Config(_)));
    }
}
