//! Block identity, metadata and object layout.
//!
//! A block lives under `<ULID>/` in the bucket:
//!
//! ```text
//! 01HZX3K4V6M2YB5G8QF0C7N9TD/
//!   meta.json
//!   index
//!   chunks/000001
//!   deletion-mark.json   (only once marked)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::FetchError;

pub const META_FILENAME: &str = "meta.json";
pub const DELETION_MARK_FILENAME: &str = "deletion-mark.json";

/// The only meta.json version this tool understands.
pub const META_VERSION: u32 = 1;

/// Unique identifier of a block, also the name of its directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(Ulid);

impl BlockId {
    pub fn new(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Parse a top-level directory name. Anything that is not a ULID is not a block.
    pub fn from_dir_name(name: &str) -> Option<Self> {
        name.trim_end_matches('/').parse().ok()
    }

    /// Creation time encoded in the ULID.
    pub fn created_at(&self) -> DateTime<Utc> {
        let millis = i64::try_from(self.0.timestamp_ms()).unwrap_or(i64::MAX);
        DateTime::from_timestamp_millis(millis).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn dir(&self) -> String {
        self.0.to_string()
    }

    pub fn meta_path(&self) -> String {
        format!("{}/{META_FILENAME}", self.0)
    }

    pub fn deletion_mark_path(&self) -> String {
        format!("{}/{DELETION_MARK_FILENAME}", self.0)
    }
}

impl From<Ulid> for BlockId {
    fn from(ulid: Ulid) -> Self {
        Self(ulid)
    }
}

impl FromStr for BlockId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parsed `meta.json` of a block.
///
/// Only the identity and the time range matter here; every other field the
/// producer wrote (`stats`, `compaction`, `thanos`, ...) is kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockMeta {
    pub ulid: BlockId,
    /// Inclusive lower bound of the block's samples, in milliseconds
    pub min_time: i64,
    /// Inclusive upper bound of the block's samples, in milliseconds
    pub max_time: i64,
    pub version: u32,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl BlockMeta {
    pub fn new(ulid: BlockId, min_time: i64, max_time: i64) -> Self {
        Self {
            ulid,
            min_time,
            max_time,
            version: META_VERSION,
            extra: serde_json::Map::new(),
        }
    }

    /// Decode the meta.json found in the directory of `id`.
    pub fn parse(id: BlockId, data: &[u8]) -> Result<Self, FetchError> {
        let meta: BlockMeta = serde_json::from_slice(data)
            .map_err(|e| FetchError::CorruptedMeta(e.to_string()))?;

        if meta.version != META_VERSION {
            return Err(FetchError::CorruptedMeta(format!(
                "unexpected meta.json version {}",
                meta.version
            )));
        }

        if meta.ulid != id {
            return Err(FetchError::CorruptedMeta(format!(
                "meta.json describes block {} but lives in directory {id}",
                meta.ulid
            )));
        }

        Ok(meta)
    }
}
