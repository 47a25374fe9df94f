use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

use crate::time::TimeBound;

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "blocks-deleter.toml";

/// Prefix for environment overrides, e.g. `BLOCKS_DELETER__RETENTION__MIN_TIME`.
pub const ENV_PREFIX: &str = "BLOCKS_DELETER__";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Object store DSN: `memory://`, `file:///path` or `s3://[key:secret@]host[:port]/bucket`
    pub dsn: String,
    /// Optional root inside the store under which blocks live
    #[serde(default)]
    pub prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dsn: String::from("file:///.data/blocks"),
            prefix: String::new(),
        }
    }
}

/// Inclusive time range of blocks that must be kept.
///
/// Both bounds are resolved against the start time of each run; `0` means
/// unbounded on that side.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Env: BLOCKS_DELETER__RETENTION__MIN_TIME
    #[serde(default)]
    pub min_time: TimeBound,
    /// Env: BLOCKS_DELETER__RETENTION__MAX_TIME
    #[serde(default)]
    pub max_time: TimeBound,
}

/// What the marking phase does when writing a deletion mark fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkFailurePolicy {
    /// Stop marking and fail the run on the first write error.
    #[default]
    Abort,
    /// Record the failure and keep marking the remaining blocks.
    Continue,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeletionConfig {
    /// Minimum age of a deletion mark before the block is deleted.
    ///
    /// Env: BLOCKS_DELETER__DELETION__DELETE_DELAY
    #[serde(with = "humantime_serde", default)]
    pub delete_delay: Duration,

    /// Minimum age of a deletion mark before the block is hidden from the active set.
    ///
    /// Env: BLOCKS_DELETER__DELETION__IGNORE_DELETION_MARKS_DELAY
    #[serde(with = "humantime_serde", default)]
    pub ignore_deletion_marks_delay: Duration,

    /// Blocks younger than this (by ULID timestamp) are never considered.
    ///
    /// Env: BLOCKS_DELETER__DELETION__CONSISTENCY_DELAY
    #[serde(with = "humantime_serde", default)]
    pub consistency_delay: Duration,

    /// Env: BLOCKS_DELETER__DELETION__ON_MARK_FAILURE
    #[serde(default)]
    pub on_mark_failure: MarkFailurePolicy,

    /// Log what would be marked or deleted without writing anything.
    ///
    /// Env: BLOCKS_DELETER__DELETION__DRY_RUN
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for DeletionConfig {
    fn default() -> Self {
        Self {
            delete_delay: Duration::ZERO,
            ignore_deletion_marks_delay: Duration::ZERO,
            consistency_delay: Duration::ZERO,
            on_mark_failure: MarkFailurePolicy::Abort,
            dry_run: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetcherConfig {
    /// Maximum number of metadata fetches in flight.
    ///
    /// Env: BLOCKS_DELETER__FETCHER__CONCURRENCY
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_concurrency() -> usize {
    32
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunConfig {
    /// Interval between runs. When absent the process runs once and exits.
    ///
    /// Env: BLOCKS_DELETER__RUN__INTERVAL
    #[serde(with = "humantime_serde", default)]
    pub interval: Option<Duration>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub deletion: DeletionConfig,
    #[serde(default)]
    pub fetcher: FetcherConfig,
    #[serde(default)]
    pub run: RunConfig,
}

impl Configuration {
    /// Load defaults, then `blocks-deleter.toml` if present, then environment overrides.
    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::figment(Toml::file(DEFAULT_CONFIG_FILE))
            .extract()
            .map_err(Box::new)
    }

    /// Load from an explicit configuration file, still applying environment overrides.
    pub fn load_from_path(path: &Path) -> Result<Self, Box<figment::Error>> {
        if !path.exists() {
            return Err(Box::new(figment::Error::from(format!(
                "configuration file not found: {}",
                path.display()
            ))));
        }

        Self::figment(Toml::file_exact(path))
            .extract()
            .map_err(Box::new)
    }

    fn figment(file: figment::providers::Data<Toml>) -> Figment {
        Figment::from(Serialized::defaults(Configuration::default()))
            .merge(file)
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.fetcher.concurrency == 0 {
            anyhow::bail!(
                "fetcher.concurrency must be at least 1, got {}",
                self.fetcher.concurrency
            );
        }

        if self.storage.dsn.trim().is_empty() {
            anyhow::bail!("storage.dsn must not be empty");
        }

        if let Some(interval) = self.run.interval {
            if interval.is_zero() {
                anyhow::bail!("run.interval must be positive when set");
            }
        }

        Ok(())
    }
}
