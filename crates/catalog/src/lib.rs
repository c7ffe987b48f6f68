//! # Catalog - leveled set of index tables
//!
//! Ties [`ptable`] tables together into the index of the whole log.
//!
//! ## Levels
//!
//! ```text
//! ┌────────────────────────────┐  ← fresh tables from staging flushes
//! │ L0                         │
//! ├────────────────────────────┤  ← merge of F tables from L0
//! │ L1                         │
//! ├────────────────────────────┤
//! │ ...                        │
//! ├────────────────────────────┤  ← ceiling C: merged into, never out of
//! │ LC, LC+1, ...              │     automatically
//! └────────────────────────────┘
//! ```
//!
//! A level below the ceiling that reaches the fan-out `F` is merged into one
//! table at the front of the next level, which may cascade further. Levels at
//! or above the ceiling accumulate until a manual merge folds them together.
//!
//! ## Module Responsibilities
//!
//! | Module         | Purpose                                                  |
//! |----------------|----------------------------------------------------------|
//! | `lib.rs`       | `IndexCatalog` snapshot, accessors, dispose              |
//! | [`cascade`]    | `add_table`, `try_manual_merge`, `table_for_manual_merge` |
//! | `read`         | Lookups across all levels                                |
//! | `recovery`     | Descriptor round trip, temp cleanup, orphan listing      |
//! | [`descriptor`] | Text descriptor format with atomic save                  |
//! | `handle`       | `CatalogWriter` / `CatalogView` snapshot publication     |
//!
//! ## Snapshots
//!
//! An [`IndexCatalog`] is immutable. Every mutation returns a new catalog in
//! a [`MergeResult`] together with the tables it replaced; the caller saves
//! the descriptor, publishes the new catalog and only then marks the
//! replaced tables for deletion. [`CatalogWriter`] does exactly that.

pub mod cascade;
pub mod descriptor;
mod error;
mod filenames;
mod handle;
mod read;
mod recovery;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use config::IndexConfig;
use ptable::IndexTable;
use tracing::warn;

pub use cascade::{MergeContext, MergeResult};
pub use descriptor::{DESCRIPTOR_FILENAME, MAX_LEVEL};
pub use error::{CatalogError, Result};
pub use filenames::{is_table_file, FilenameAllocator, SequentialFilenames, TABLE_EXTENSION};
pub use handle::{CatalogView, CatalogWriter};

/// Checkpoint value of a catalog that has indexed nothing yet.
pub const NO_CHECKPOINT: i64 = -1;

/// An immutable snapshot of the index: tables per level plus the log
/// positions the tables cover.
#[derive(Clone)]
pub struct IndexCatalog {
    /// `levels[l]` holds level `l`, newest first. No trailing empty levels.
    pub(crate) levels: Vec<Vec<Arc<IndexTable>>>,
    pub(crate) prepare_checkpoint: i64,
    pub(crate) commit_checkpoint: i64,
    pub(crate) max_tables_per_level: usize,
    pub(crate) max_auto_merge_level: usize,
}

impl fmt::Debug for IndexCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexCatalog")
            .field("levels", &self.level_sizes())
            .field("prepare_checkpoint", &self.prepare_checkpoint)
            .field("commit_checkpoint", &self.commit_checkpoint)
            .field("fan_out", &self.max_tables_per_level)
            .field("ceiling", &self.max_auto_merge_level)
            .finish()
    }
}

impl IndexCatalog {
    /// An empty catalog with the fan-out and ceiling of `config`.
    pub fn new(config: &IndexConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            levels: Vec::new(),
            prepare_checkpoint: NO_CHECKPOINT,
            commit_checkpoint: NO_CHECKPOINT,
            max_tables_per_level: config.max_tables_per_level,
            max_auto_merge_level: config.max_auto_merge_level,
        })
    }

    pub fn prepare_checkpoint(&self) -> i64 {
        self.prepare_checkpoint
    }

    pub fn commit_checkpoint(&self) -> i64 {
        self.commit_checkpoint
    }

    /// Fan-out: tables a level below the ceiling may reach before merging.
    pub fn max_tables_per_level(&self) -> usize {
        self.max_tables_per_level
    }

    /// Ceiling: the first level that is never merged automatically.
    pub fn max_auto_merge_level(&self) -> usize {
        self.max_auto_merge_level
    }

    /// Tables of `level`, newest first. Empty for levels beyond the last.
    pub fn level(&self, level: usize) -> &[Arc<IndexTable>] {
        self.levels.get(level).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Number of tables per level.
    pub fn level_sizes(&self) -> Vec<usize> {
        self.levels.iter().map(Vec::len).collect()
    }

    pub fn table_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    /// Total entries across all tables.
    pub fn entry_count(&self) -> u64 {
        self.tables().map(|(_, t)| t.count()).sum()
    }

    /// All tables with their level, level by level, newest first.
    pub fn tables(&self) -> impl Iterator<Item = (usize, &Arc<IndexTable>)> + '_ {
        self.levels
            .iter()
            .enumerate()
            .flat_map(|(level, tables)| tables.iter().map(move |t| (level, t)))
    }

    /// Level holding `table`, compared by identity.
    pub fn level_of(&self, table: &Arc<IndexTable>) -> Option<usize> {
        self.tables()
            .find(|(_, t)| Arc::ptr_eq(t, table))
            .map(|(level, _)| level)
    }

    /// Fails if the catalog claims to cover log positions past
    /// `log_checkpoint`, e.g. after the log was truncated behind its back.
    pub fn ensure_within(&self, log_checkpoint: i64) -> Result<()> {
        let claimed = self.prepare_checkpoint.max(self.commit_checkpoint);
        if claimed > log_checkpoint {
            return Err(CatalogError::CheckpointAhead {
                catalog: claimed,
                log: log_checkpoint,
            });
        }
        Ok(())
    }

    /// Releases every table without deleting files and waits up to `timeout`
    /// per table for its readers to drain.
    ///
    /// # Errors
    ///
    /// [`CatalogError::DrainTimeout`] naming how many tables were still busy.
    /// Their teardown still completes when the readers finish.
    pub fn dispose(&self, timeout: Duration) -> Result<()> {
        for (_, table) in self.tables() {
            table.mark_for_disposal();
        }
        let mut pending = 0;
        for (_, table) in self.tables() {
            if table.wait_for_destroy(timeout).is_err() {
                warn!(
                    path = %table.path().display(),
                    readers = table.active_readers(),
                    "table readers did not drain in time"
                );
                pending += 1;
            }
        }
        if pending > 0 {
            return Err(CatalogError::DrainTimeout { pending, timeout });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
