use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

use crate::block::BlockMeta;
use crate::bucket::Bucket;
use crate::deletion_mark::DeletionMark;
use crate::error::FetchError;

/// Where a filter sends a block.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterDecision {
    /// Pass the block on to the next filter, and into the active set if none objects.
    Keep,
    /// The block carries a deletion mark old enough to hand it to cleanup.
    Marked(DeletionMark),
    /// Drop the block from this pass entirely.
    Exclude,
}

/// One step of the discovery filter chain.
///
/// Filters run per block inside the fetch fan-out, in chain order; the first
/// decision other than [`FilterDecision::Keep`] wins. An error is recorded for
/// that block only.
#[async_trait]
pub trait MetadataFilter: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    async fn decide(
        &self,
        bucket: &dyn Bucket,
        meta: &BlockMeta,
        now: DateTime<Utc>,
    ) -> Result<FilterDecision, FetchError>;
}

/// Hides blocks whose ULID is younger than `delay`.
///
/// Uploads are not atomic in object stores, so a block that just appeared
/// may still be incomplete or invisible to other readers.
#[derive(Debug, Clone)]
pub struct ConsistencyDelayFilter {
    delay: Duration,
}

impl ConsistencyDelayFilter {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl MetadataFilter for ConsistencyDelayFilter {
    fn name(&self) -> &'static str {
        "consistency-delay"
    }

    async fn decide(
        &self,
        _bucket: &dyn Bucket,
        meta: &BlockMeta,
        now: DateTime<Utc>,
    ) -> Result<FilterDecision, FetchError> {
        let delay = chrono::Duration::from_std(self.delay).unwrap_or(chrono::Duration::MAX);
        if now.signed_duration_since(meta.ulid.created_at()) < delay {
            tracing::debug!(
                block = %meta.ulid,
                created_at = %meta.ulid.created_at(),
                "Block is within the consistency delay, skipping"
            );
            return Ok(FilterDecision::Exclude);
        }

        Ok(FilterDecision::Keep)
    }
}
