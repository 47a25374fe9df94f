//! Block lifecycle management for TSDB blocks in object storage.
//!
//! A run discovers the blocks in a bucket, marks the ones that fall outside
//! the retention window with a `deletion-mark.json`, and deletes blocks whose
//! mark is older than the configured delete delay. Readers that are part way
//! through scanning a block get the delete delay to finish before the block
//! disappears.
//!
//! Every mutation is safe to repeat. Marking checks for an existing mark
//! before writing, and deleting an object that is already gone succeeds, so
//! overlapping or retried runs converge on the same bucket state.

pub mod block;
pub mod bucket;
pub mod cleaner;
pub mod deletion_mark;
pub mod error;
pub mod fetcher;
pub mod marker;
pub mod metrics;
pub mod retention;
pub mod run;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use block::{BlockId, BlockMeta};
pub use bucket::{Bucket, ObjectStoreBucket};
pub use cleaner::{BlocksCleaner, CleanupReport};
pub use deletion_mark::{DeletionMark, DeletionMarkFilter};
pub use error::{BucketError, DeleterError, FetchError, Result};
pub use fetcher::{FetchResult, MetadataFetcher};
pub use marker::{DeletionMarker, MarkOutcome, MarkingReport};
pub use metrics::DeleterMetrics;
pub use retention::{RetentionEvaluator, RetentionWindow, should_keep};
pub use run::{BlocksDeleter, RunReport};
