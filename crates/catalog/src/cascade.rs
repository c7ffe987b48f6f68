//! Level maintenance: inserting tables and merging them down the levels.
//!
//! Two kinds of merge exist:
//!
//! - **automatic**: level `L < ceiling` holding `fan_out` or more tables is
//!   merged into one table at the front of `L + 1`, repeated until every
//!   level below the ceiling is under the fan-out;
//! - **manual**: every table on the ceiling level and above is merged into a
//!   single table at `ceiling + 1`. Only done on request.
//!
//! Merging never mutates a catalog. Each operation returns the new catalog
//! plus the tables it superseded, which stay readable until the caller marks
//! them for deletion.

use std::sync::Arc;

use config::TableConfig;
use ptable::{IndexCollaborators, IndexTable, TableVersion};
use tracing::{debug, info};

use crate::descriptor::MAX_LEVEL;
use crate::error::{CatalogError, Result};
use crate::filenames::FilenameAllocator;
use crate::IndexCatalog;

/// Everything a merge needs beyond the tables themselves.
pub struct MergeContext<'a, C: ?Sized> {
    pub collaborators: &'a C,
    pub filenames: &'a dyn FilenameAllocator,
    /// Format of the tables the merge writes.
    pub version: TableVersion,
    pub skip_verify: bool,
    pub table_config: &'a TableConfig,
}

impl<C: ?Sized> Clone for MergeContext<'_, C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C: ?Sized> Copy for MergeContext<'_, C> {}

/// Outcome of a catalog mutation.
#[derive(Debug)]
pub struct MergeResult {
    /// The catalog after the mutation.
    pub catalog: IndexCatalog,
    /// Tables no longer referenced by `catalog`, oldest merge first.
    pub superseded: Vec<Arc<IndexTable>>,
    /// Whether any merge ran.
    pub has_merged_any: bool,
    /// Tables written by this mutation.
    pub(crate) created: Vec<Arc<IndexTable>>,
}

/// Working copy of the levels while a mutation is in progress.
struct Levels<'c> {
    levels: Vec<Vec<Arc<IndexTable>>>,
    superseded: Vec<Arc<IndexTable>>,
    created: Vec<Arc<IndexTable>>,
    catalog: &'c IndexCatalog,
}

impl<'c> Levels<'c> {
    fn of(catalog: &'c IndexCatalog) -> Self {
        Self {
            levels: catalog.levels.clone(),
            superseded: Vec::new(),
            created: Vec::new(),
            catalog,
        }
    }

    fn ensure_level(&mut self, level: usize) {
        if self.levels.len() <= level {
            self.levels.resize_with(level + 1, Vec::new);
        }
    }

    fn push_front(&mut self, level: usize, table: Arc<IndexTable>) {
        self.ensure_level(level);
        self.levels[level].insert(0, table);
    }

    /// Merges `inputs` (newest first) into one new table.
    fn merge<C>(&mut self, inputs: Vec<Arc<IndexTable>>, ctx: MergeContext<'_, C>) -> Result<Arc<IndexTable>>
    where
        C: IndexCollaborators + ?Sized,
    {
        let path = ctx.filenames.next_path();
        let table = IndexTable::from_merge(
            &inputs,
            &path,
            ctx.collaborators,
            ctx.version,
            ctx.skip_verify,
            ctx.table_config,
        )?;
        let table = Arc::new(table);
        self.created.push(Arc::clone(&table));
        self.superseded.extend(inputs);
        Ok(table)
    }

    /// Runs automatic merges until every level below the ceiling is under
    /// the fan-out.
    fn cascade<C>(&mut self, ctx: MergeContext<'_, C>) -> Result<()>
    where
        C: IndexCollaborators + ?Sized,
    {
        let fan_out = self.catalog.max_tables_per_level;
        let ceiling = self.catalog.max_auto_merge_level;
        let mut level = 0;
        while level < ceiling && level < self.levels.len() {
            if self.levels[level].len() >= fan_out {
                let inputs = std::mem::take(&mut self.levels[level]);
                info!(level, tables = inputs.len(), "merging level");
                let merged = self.merge(inputs, ctx)?;
                self.push_front(level + 1, merged);
            }
            level += 1;
        }
        Ok(())
    }

    /// Merges every table at or above the ceiling into one table at
    /// `ceiling + 1`. Returns `false` if fewer than two such tables exist.
    fn merge_capped<C>(&mut self, ctx: MergeContext<'_, C>) -> Result<bool>
    where
        C: IndexCollaborators + ?Sized,
    {
        let ceiling = self.catalog.max_auto_merge_level;
        if capped_count(&self.levels, ceiling) < 2 {
            return Ok(false);
        }
        // Lower levels hold newer data, so they go first.
        let inputs: Vec<Arc<IndexTable>> = self
            .levels
            .iter_mut()
            .skip(ceiling)
            .flat_map(std::mem::take)
            .collect();
        info!(ceiling, tables = inputs.len(), "manual merge of capped levels");
        let merged = self.merge(inputs, ctx)?;
        self.push_front(ceiling + 1, merged);
        Ok(true)
    }

    fn finish(mut self, prepare: i64, commit: i64) -> MergeResult {
        while self.levels.last().is_some_and(Vec::is_empty) {
            self.levels.pop();
        }
        let has_merged_any = !self.created.is_empty();
        MergeResult {
            catalog: IndexCatalog {
                levels: self.levels,
                prepare_checkpoint: prepare,
                commit_checkpoint: commit,
                max_tables_per_level: self.catalog.max_tables_per_level,
                max_auto_merge_level: self.catalog.max_auto_merge_level,
            },
            superseded: self.superseded,
            has_merged_any,
            created: self.created,
        }
    }

    /// Deletes what a failed mutation wrote; the inputs stay untouched.
    fn abandon(self) {
        for table in &self.created {
            table.mark_for_deletion();
        }
    }
}

fn capped_count(levels: &[Vec<Arc<IndexTable>>], ceiling: usize) -> usize {
    levels.iter().skip(ceiling).map(Vec::len).sum()
}

impl IndexCatalog {
    /// Inserts `table` at the front of `level` and runs the automatic
    /// cascade.
    ///
    /// If `table` is already in the catalog at `level`, it is not inserted
    /// again: the call performs one manual merge step instead (see
    /// [`table_for_manual_merge`](Self::table_for_manual_merge)).
    ///
    /// # Errors
    ///
    /// - [`CatalogError::InvalidArgument`] if `level` exceeds [`MAX_LEVEL`],
    ///   the table is already present at another level, or a checkpoint is
    ///   lower than the catalog's.
    /// - Any merge failure. Tables written before the failure are deleted and
    ///   `self` is unaffected.
    pub fn add_table<C>(
        &self,
        table: Arc<IndexTable>,
        prepare_checkpoint: i64,
        commit_checkpoint: i64,
        level: usize,
        ctx: MergeContext<'_, C>,
    ) -> Result<MergeResult>
    where
        C: IndexCollaborators + ?Sized,
    {
        if level > MAX_LEVEL {
            return Err(CatalogError::InvalidArgument(format!(
                "level {} exceeds the maximum of {}",
                level, MAX_LEVEL
            )));
        }
        if prepare_checkpoint < self.prepare_checkpoint || commit_checkpoint < self.commit_checkpoint {
            return Err(CatalogError::InvalidArgument(format!(
                "checkpoints {}/{} are behind the catalog's {}/{}",
                prepare_checkpoint, commit_checkpoint, self.prepare_checkpoint, self.commit_checkpoint
            )));
        }

        let mut work = Levels::of(self);
        match self.level_of(&table) {
            Some(found) if found != level => {
                return Err(CatalogError::InvalidArgument(format!(
                    "table {} is already on level {}, not {}",
                    table.path().display(),
                    found,
                    level
                )));
            }
            Some(_) => {
                debug!(path = %table.path().display(), level, "re-inserted table, manual merge step");
                if let Err(e) = work.merge_capped(ctx).and_then(|_| work.cascade(ctx)) {
                    work.abandon();
                    return Err(e);
                }
            }
            None => {
                work.push_front(level, table);
                if let Err(e) = work.cascade(ctx) {
                    work.abandon();
                    return Err(e);
                }
            }
        }
        Ok(work.finish(prepare_checkpoint, commit_checkpoint))
    }

    /// Merges every table on the ceiling level and above into one, then
    /// runs the automatic cascade.
    ///
    /// Returns `has_merged_any == false` and an unchanged catalog when fewer
    /// than two such tables exist.
    pub fn try_manual_merge<C>(&self, ctx: MergeContext<'_, C>) -> Result<MergeResult>
    where
        C: IndexCollaborators + ?Sized,
    {
        let mut work = Levels::of(self);
        if let Err(e) = work.merge_capped(ctx).and_then(|_| work.cascade(ctx)) {
            work.abandon();
            return Err(e);
        }
        Ok(work.finish(self.prepare_checkpoint, self.commit_checkpoint))
    }

    /// Picks the table an operator-driven compaction would feed back through
    /// [`add_table`](Self::add_table) to advance one manual merge step.
    ///
    /// When the capped levels hold two or more tables, returns the oldest
    /// table of the lowest capped level with at least two tables, or else
    /// the oldest capped table. Otherwise returns the ceiling and `None`.
    /// Never mutates anything.
    pub fn table_for_manual_merge(&self) -> (usize, Option<Arc<IndexTable>>) {
        let ceiling = self.max_auto_merge_level;
        if capped_count(&self.levels, ceiling) < 2 {
            return (ceiling, None);
        }
        let crowded = (ceiling..self.levels.len()).find(|&l| self.levels[l].len() >= 2);
        let level = crowded.or_else(|| (ceiling..self.levels.len()).rev().find(|&l| !self.levels[l].is_empty()));
        match level {
            Some(l) => (l, self.levels[l].last().cloned()),
            None => (ceiling, None),
        }
    }
}
