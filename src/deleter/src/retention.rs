//! The retention decision.
//!
//! A block is kept while its time range overlaps the retention window.
//! Unbounded sides of the window are resolved to `i64::MIN`/`i64::MAX` by
//! [`RetentionWindow::from_config`], so [`should_keep`] applies the overlap
//! rule to plain numbers.

use chrono::{DateTime, Utc};
use common::config::RetentionConfig;
use std::collections::BTreeMap;

use crate::block::{BlockId, BlockMeta};
use crate::error::{DeleterError, Result};

/// Inclusive range of sample time, in milliseconds, that must be kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionWindow {
    pub min_time: i64,
    pub max_time: i64,
}

impl RetentionWindow {
    pub fn new(min_time: i64, max_time: i64) -> Result<Self> {
        if min_time > max_time {
            return Err(DeleterError::Config(format!(
                "retention window is empty: min_time {min_time} is after max_time {max_time}"
            )));
        }

        Ok(Self { min_time, max_time })
    }

    /// A window that keeps every block.
    pub fn unbounded() -> Self {
        Self {
            min_time: i64::MIN,
            max_time: i64::MAX,
        }
    }

    /// Resolve the configured bounds against the start time of a run.
    pub fn from_config(config: &RetentionConfig, now: DateTime<Utc>) -> Result<Self> {
        let min_time = config
            .min_time
            .resolve_min(now)
            .map_err(|e| DeleterError::Config(e.to_string()))?;
        let max_time = config
            .max_time
            .resolve_max(now)
            .map_err(|e| DeleterError::Config(e.to_string()))?;

        Self::new(min_time, max_time)
    }

    pub fn is_unbounded(&self) -> bool {
        self.min_time == i64::MIN && self.max_time == i64::MAX
    }
}

/// Whether `meta` overlaps `window`.
pub fn should_keep(meta: &BlockMeta, window: &RetentionWindow) -> bool {
    meta.max_time >= window.min_time && meta.min_time <= window.max_time
}

/// Picks the active blocks that fall outside the retention window.
#[derive(Debug, Clone, Copy)]
pub struct RetentionEvaluator {
    window: RetentionWindow,
}

impl RetentionEvaluator {
    pub fn new(window: RetentionWindow) -> Self {
        Self { window }
    }

    pub fn window(&self) -> RetentionWindow {
        self.window
    }

    pub fn should_keep(&self, meta: &BlockMeta) -> bool {
        should_keep(meta, &self.window)
    }

    /// Deletion candidates among `active`, in block ID order.
    pub fn deletion_candidates(&self, active: &BTreeMap<BlockId, BlockMeta>) -> Vec<BlockId> {
        let candidates: Vec<BlockId> = active
            .values()
            .filter(|meta| !self.should_keep(meta))
            .map(|meta| {
                tracing::debug!(
                    block = %meta.ulid,
                    min_time = meta.min_time,
                    max_time = meta.max_time,
                    "Block is outside the retention window"
                );
                meta.ulid
            })
            .collect();

        tracing::info!(
            active = active.len(),
            candidates = candidates.len(),
            window_min = self.window.min_time,
            window_max = self.window.max_time,
            "Evaluated retention"
        );

        candidates
    }
}
