//! Error taxonomy for the block lifecycle.
//!
//! Per-block failures ([`FetchError`], failed deletions) are collected into
//! reports and never abort a run. [`DeleterError`] is reserved for failures
//! that stop a run: the bucket cannot be listed, a mark cannot be written
//! under the abort policy, the configuration is unusable, or the run was
//! cancelled.

use thiserror::Error;

use crate::block::BlockId;

/// A failed object store operation.
#[derive(Error, Debug)]
pub enum BucketError {
    #[error("object not found: {key}")]
    NotFound { key: String },

    #[error("{op} {key}: {source}")]
    Store {
        op: &'static str,
        key: String,
        #[source]
        source: object_store::Error,
    },
}

impl BucketError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BucketError::NotFound { .. })
    }
}

/// Why a single block could not be discovered.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("corrupted meta.json: {0}")]
    CorruptedMeta(String),

    #[error("corrupted deletion mark: {0}")]
    CorruptedMark(String),

    #[error(transparent)]
    Bucket(#[from] BucketError),
}

/// Failures that abort a whole run.
#[derive(Error, Debug)]
pub enum DeleterError {
    #[error("failed to list blocks: {0}")]
    List(#[source] BucketError),

    #[error("failed to mark block {id} for deletion: {source}")]
    MarkWrite {
        id: BlockId,
        #[source]
        source: BucketError,
    },

    #[error("failed to delete block {id}: {source}")]
    Delete {
        id: BlockId,
        #[source]
        source: BucketError,
    },

    #[error("failed to encode deletion mark for block {id}: {source}")]
    Encode {
        id: BlockId,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("run cancelled")]
    Cancelled,
}

pub type Result<T, E = DeleterError> = std::result::Result<T, E>;
