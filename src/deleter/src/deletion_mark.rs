//! Deletion marks and the filter that separates marked blocks from active ones.
//!
//! A deletion mark is the only record that a block is scheduled for deletion.
//! It is written once by the marker, read on every discovery pass, and removed
//! last when the cleaner deletes the block.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::block::{BlockId, BlockMeta};
use crate::bucket::Bucket;
use crate::error::FetchError;
use crate::fetcher::{FilterDecision, MetadataFilter};

/// The only deletion-mark.json version this tool reads or writes.
pub const DELETION_MARK_VERSION: u32 = 1;

/// Contents of `<ULID>/deletion-mark.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionMark {
    pub id: BlockId,
    /// Unix timestamp in seconds of when the mark was written
    pub deletion_time: i64,
    /// The same instant in milliseconds. Marks written by other tools may
    /// carry only `deletion_time`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_time_ms: Option<i64>,
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl DeletionMark {
    pub fn new(id: BlockId, marked_at: DateTime<Utc>, details: Option<String>) -> Self {
        Self {
            id,
            deletion_time: marked_at.timestamp(),
            deletion_time_ms: Some(marked_at.timestamp_millis()),
            version: DELETION_MARK_VERSION,
            details,
        }
    }

    pub fn marked_at(&self) -> DateTime<Utc> {
        let precise = self.deletion_time_ms.and_then(DateTime::from_timestamp_millis);
        precise
            .or_else(|| DateTime::from_timestamp(self.deletion_time, 0))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Whether at least `delay` has passed since the mark was written.
    ///
    /// A zero delay makes every mark old enough as soon as it is observed.
    pub fn is_older_than(&self, delay: Duration, now: DateTime<Utc>) -> bool {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(self.marked_at()) >= delay
    }

    /// Decode the mark found in the directory of `id`.
    pub fn parse(id: BlockId, data: &[u8]) -> Result<Self, FetchError> {
        let mark: DeletionMark = serde_json::from_slice(data)
            .map_err(|e| FetchError::CorruptedMark(e.to_string()))?;

        if mark.version != DELETION_MARK_VERSION {
            return Err(FetchError::CorruptedMark(format!(
                "unexpected deletion-mark.json version {}",
                mark.version
            )));
        }

        if mark.id != id {
            return Err(FetchError::CorruptedMark(format!(
                "deletion mark names block {} but lives in directory {id}",
                mark.id
            )));
        }

        Ok(mark)
    }
}

/// Read the deletion mark of a block, `None` if it has none.
pub async fn read_deletion_mark(
    bucket: &dyn Bucket,
    id: BlockId,
) -> Result<Option<DeletionMark>, FetchError> {
    match bucket.get(&id.deletion_mark_path()).await {
        Ok(data) => DeletionMark::parse(id, &data).map(Some),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Moves blocks carrying a deletion mark out of the active set.
///
/// Marks younger than `delay` leave the block active. Marking such a block
/// again is a no-op, and it moves to the marked set once the delay passes.
#[derive(Debug, Clone, Default)]
pub struct DeletionMarkFilter {
    delay: Duration,
}

impl DeletionMarkFilter {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl MetadataFilter for DeletionMarkFilter {
    fn name(&self) -> &'static str {
        "deletion-mark"
    }

    async fn decide(
        &self,
        bucket: &dyn Bucket,
        meta: &BlockMeta,
        now: DateTime<Utc>,
    ) -> Result<FilterDecision, FetchError> {
        let Some(mark) = read_deletion_mark(bucket, meta.ulid).await? else {
            return Ok(FilterDecision::Keep);
        };

        if mark.is_older_than(self.delay, now) {
            return Ok(FilterDecision::Marked(mark));
        }

        tracing::debug!(
            block = %meta.ulid,
            marked_at = %mark.marked_at(),
            delay = ?self.delay,
            "Block marked for deletion recently, keeping it active"
        );
        Ok(FilterDecision::Keep)
    }
}
