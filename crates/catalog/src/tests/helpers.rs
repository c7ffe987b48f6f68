use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use config::{IndexConfig, TableConfig};
use ptable::{FnCollaborators, IndexCollaborators, IndexEntry, IndexTable, StagingTable, TableVersion};

use crate::*;

/// Every entry live; identity is the log position, so only exact duplicates
/// coalesce.
pub fn keep_all() -> impl IndexCollaborators<StreamId = i64> {
    FnCollaborators::new(
        |_: &i64, old| old,
        |_: &IndexEntry| true,
        |entry: &IndexEntry| Some(entry.log_position),
    )
}

pub fn table_config() -> TableConfig {
    TableConfig {
        initial_readers: 1,
        max_readers: 4,
        cache_depth: 4,
        use_bloom_filter: true,
    }
}

pub fn config(fan_out: usize, ceiling: usize) -> IndexConfig {
    IndexConfig {
        table: table_config(),
        ..IndexConfig::with_levels(fan_out, ceiling)
    }
}

/// A catalog plus the pieces needed to mutate it outside a writer.
pub struct Fixture {
    pub filenames: SequentialFilenames,
    pub table_config: TableConfig,
    pub next_id: u64,
}

impl Fixture {
    pub fn new(dir: &Path) -> Self {
        Self {
            filenames: SequentialFilenames::new(dir),
            table_config: table_config(),
            next_id: 1,
        }
    }

    /// Continues naming after the tables already in `dir`, with stream ids
    /// starting at `next_id`.
    pub fn resume(dir: &Path, next_id: u64) -> Self {
        Self {
            filenames: SequentialFilenames::resume(dir),
            table_config: table_config(),
            next_id,
        }
    }

    pub fn ctx<'a, C: IndexCollaborators>(&'a self, collab: &'a C) -> MergeContext<'a, C> {
        MergeContext {
            collaborators: collab,
            filenames: &self.filenames,
            version: TableVersion::V2,
            skip_verify: false,
            table_config: &self.table_config,
        }
    }

    /// A fresh single-entry table `(id, 0) -> id * 10`.
    pub fn single(&mut self) -> Result<Arc<IndexTable>> {
        let id = self.next_id;
        self.next_id += 1;
        let mut staging = StagingTable::new(TableVersion::V2);
        staging.add(id, 0, id as i64 * 10);
        let path = self.filenames.next_path();
        Ok(Arc::new(IndexTable::from_staging(
            &staging,
            &path,
            false,
            &self.table_config,
        )?))
    }

    /// Adds one fresh table at level 0, checkpointed at its own position.
    pub fn add_one<C: IndexCollaborators>(
        &mut self,
        catalog: &IndexCatalog,
        collab: &C,
    ) -> Result<MergeResult> {
        let table = self.single()?;
        let checkpoint = (self.next_id - 1) as i64 * 10;
        Ok(catalog.add_table(table, checkpoint, checkpoint, 0, self.ctx(collab))?)
    }
}

/// Takes the new catalog and deletes what it replaced, like a writer would.
pub fn apply(result: MergeResult) -> IndexCatalog {
    for t in &result.superseded {
        t.mark_for_deletion();
    }
    result.catalog
}

/// Tables on the ceiling level and above.
pub fn capped(catalog: &IndexCatalog) -> usize {
    (catalog.max_auto_merge_level()..catalog.level_count())
        .map(|l| catalog.level(l).len())
        .sum()
}

/// Asserts `(id, 0) -> id * 10` is readable for every id in `ids`.
pub fn assert_readable(catalog: &IndexCatalog, ids: impl IntoIterator<Item = u64>) -> Result<()> {
    for id in ids {
        assert_eq!(
            catalog.get(id, 0)?,
            vec![IndexEntry::new(id, 0, id as i64 * 10)],
            "stream {id}"
        );
    }
    Ok(())
}
