//! # Config - index engine settings
//!
//! Every knob the leveled index reads lives here, so that the table and
//! catalog crates share one definition of defaults and limits.
//!
//! ```text
//! IndexConfig
//! ├── max_tables_per_level   fan-out F: tables a level may collect before it merges
//! ├── max_auto_merge_level   ceiling C: levels < C merge automatically
//! ├── skip_index_verify      skip the whole-file digest check on open
//! └── table: TableConfig
//!     ├── initial_readers    file handles opened eagerly per table
//!     ├── max_readers        handles kept pooled per table; extra leases open transiently
//!     ├── cache_depth        log2 of the midpoint samples kept in memory
//!     └── use_bloom_filter   load the stream-hash bloom sidecar
//! ```
//!
//! ## Environment
//!
//! [`IndexConfig::from_env`] starts from the defaults and overrides any of:
//!
//! ```text
//! INDEX_FAN_OUT               max_tables_per_level  (default: 2)
//! INDEX_MAX_AUTO_MERGE_LEVEL  max_auto_merge_level  (default: 2)
//! INDEX_SKIP_VERIFY           skip_index_verify     (default: false)
//! INDEX_INITIAL_READERS       table.initial_readers (default: 2)
//! INDEX_MAX_READERS           table.max_readers     (default: 16)
//! INDEX_CACHE_DEPTH           table.cache_depth     (default: 16)
//! INDEX_BLOOM                 table.use_bloom_filter (default: true)
//! ```

use std::str::FromStr;

use thiserror::Error;

/// Default fan-out: a level merges as soon as it holds this many tables.
pub const DEFAULT_MAX_TABLES_PER_LEVEL: usize = 2;

/// Default ceiling: levels below this merge automatically.
pub const DEFAULT_MAX_AUTO_MERGE_LEVEL: usize = 2;

/// Default number of file handles each table opens up front.
pub const DEFAULT_INITIAL_READERS: usize = 2;

/// Default upper bound on file handles per table.
pub const DEFAULT_MAX_READERS: usize = 16;

/// Default midpoint cache depth (up to 2^16 sampled keys per table).
pub const DEFAULT_CACHE_DEPTH: u32 = 16;

/// Largest accepted midpoint cache depth.
pub const MAX_CACHE_DEPTH: u32 = 28;

/// Rejected configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_tables_per_level must be at least 2, got {0}")]
    FanOutTooSmall(usize),

    #[error("initial_readers must be at least 1")]
    NoInitialReaders,

    #[error("max_readers ({max}) must be >= initial_readers ({initial})")]
    ReaderBounds { initial: usize, max: usize },

    #[error("cache_depth {0} exceeds maximum {max}", max = MAX_CACHE_DEPTH)]
    CacheDepthTooLarge(u32),

    #[error("environment variable {key}: cannot parse {value:?}")]
    Unparsable { key: String, value: String },
}

/// Per-table settings: reader pool bounds, midpoint cache, bloom usage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableConfig {
    pub initial_readers: usize,
    pub max_readers: usize,
    pub cache_depth: u32,
    pub use_bloom_filter: bool,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            initial_readers: DEFAULT_INITIAL_READERS,
            max_readers: DEFAULT_MAX_READERS,
            cache_depth: DEFAULT_CACHE_DEPTH,
            use_bloom_filter: true,
        }
    }
}

impl TableConfig {
    /// Checks the reader pool bounds and cache depth.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_readers == 0 {
            return Err(ConfigError::NoInitialReaders);
        }
        if self.max_readers < self.initial_readers {
            return Err(ConfigError::ReaderBounds {
                initial: self.initial_readers,
                max: self.max_readers,
            });
        }
        if self.cache_depth > MAX_CACHE_DEPTH {
            return Err(ConfigError::CacheDepthTooLarge(self.cache_depth));
        }
        Ok(())
    }
}

/// Settings supplied when a catalog is opened.
///
/// The values are not persisted with the catalog: reopening with a different
/// fan-out or ceiling regroups the existing tables under the new rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexConfig {
    pub max_tables_per_level: usize,
    pub max_auto_merge_level: usize,
    pub skip_index_verify: bool,
    pub table: TableConfig,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            max_tables_per_level: DEFAULT_MAX_TABLES_PER_LEVEL,
            max_auto_merge_level: DEFAULT_MAX_AUTO_MERGE_LEVEL,
            skip_index_verify: false,
            table: TableConfig::default(),
        }
    }
}

impl IndexConfig {
    /// Default settings with the given fan-out and ceiling.
    pub fn with_levels(max_tables_per_level: usize, max_auto_merge_level: usize) -> Self {
        Self {
            max_tables_per_level,
            max_auto_merge_level,
            ..Self::default()
        }
    }

    /// Checks every field; the first violation wins.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_tables_per_level < 2 {
            return Err(ConfigError::FanOutTooSmall(self.max_tables_per_level));
        }
        self.table.validate()
    }

    /// Builds a configuration from `INDEX_*` environment variables.
    ///
    /// Unset variables keep their default; a set but unparsable variable is
    /// an error rather than a silent fallback.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reads through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        override_with(&lookup, "INDEX_FAN_OUT", &mut cfg.max_tables_per_level)?;
        override_with(&lookup, "INDEX_MAX_AUTO_MERGE_LEVEL", &mut cfg.max_auto_merge_level)?;
        override_with(&lookup, "INDEX_SKIP_VERIFY", &mut cfg.skip_index_verify)?;
        override_with(&lookup, "INDEX_INITIAL_READERS", &mut cfg.table.initial_readers)?;
        override_with(&lookup, "INDEX_MAX_READERS", &mut cfg.table.max_readers)?;
        override_with(&lookup, "INDEX_CACHE_DEPTH", &mut cfg.table.cache_depth)?;
        override_with(&lookup, "INDEX_BLOOM", &mut cfg.table.use_bloom_filter)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

fn override_with<F, T>(lookup: &F, key: &str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        *slot = raw.trim().parse().map_err(|_| ConfigError::Unparsable {
            key: key.to_string(),
            value: raw.clone(),
        })?;
    }
    Ok(())
}
