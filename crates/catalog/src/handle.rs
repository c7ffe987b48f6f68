//! Publication of catalog snapshots to concurrent readers.
//!
//! One [`CatalogWriter`] owns a catalog directory. Each mutation builds a new
//! [`IndexCatalog`], persists its descriptor, swaps it in as the current
//! snapshot and only then retires the tables it replaced. [`CatalogView`]s
//! clone the current `Arc` per query and never wait on a merge.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use config::IndexConfig;
use parking_lot::RwLock;
use ptable::{IndexCollaborators, IndexEntry, IndexTable, StagingTable, TableVersion};
use tracing::{debug, info, warn};

use crate::cascade::{MergeContext, MergeResult};
use crate::descriptor::DESCRIPTOR_FILENAME;
use crate::error::Result;
use crate::filenames::{FilenameAllocator, SequentialFilenames};
use crate::recovery::cleanup_tmp_files;
use crate::IndexCatalog;

/// How often a view retries a lookup that raced with a table teardown.
const LOOKUP_RETRIES: usize = 8;

type Shared = Arc<RwLock<Arc<IndexCatalog>>>;

/// Single writer of a catalog directory.
///
/// Not `Clone`, and every mutation takes `&mut self`, so merges are
/// serialized by ownership.
pub struct CatalogWriter {
    dir: PathBuf,
    descriptor_path: PathBuf,
    config: IndexConfig,
    version: TableVersion,
    filenames: SequentialFilenames,
    current: Shared,
}

impl std::fmt::Debug for CatalogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogWriter")
            .field("dir", &self.dir)
            .field("catalog", &*self.current.read())
            .finish()
    }
}

impl CatalogWriter {
    /// Opens the catalog in `dir`, creating the directory and an empty
    /// catalog if needed. Leftover temp files are removed first.
    pub fn open(dir: impl AsRef<Path>, config: IndexConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        config.validate()?;
        fs::create_dir_all(&dir)?;
        cleanup_tmp_files(&dir);

        let descriptor_path = dir.join(DESCRIPTOR_FILENAME);
        let catalog = if descriptor_path.exists() {
            IndexCatalog::from_file(&descriptor_path, &config)?
        } else {
            debug!(dir = %dir.display(), "no descriptor, starting empty catalog");
            IndexCatalog::new(&config)?
        };

        Ok(Self {
            filenames: SequentialFilenames::resume(&dir),
            dir,
            descriptor_path,
            config,
            version: TableVersion::CURRENT,
            current: Arc::new(RwLock::new(Arc::new(catalog))),
        })
    }

    /// Format of the tables this writer creates.
    pub fn with_version(mut self, version: TableVersion) -> Self {
        self.version = version;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn descriptor_path(&self) -> &Path {
        &self.descriptor_path
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<IndexCatalog> {
        Arc::clone(&self.current.read())
    }

    /// A read handle that follows this writer's snapshots.
    pub fn view(&self) -> CatalogView {
        CatalogView {
            current: Arc::clone(&self.current),
        }
    }

    /// Allocates the path for a new table in this catalog's directory.
    pub fn next_table_path(&self) -> PathBuf {
        self.filenames.next_path()
    }

    fn context<'a, C>(&'a self, collaborators: &'a C) -> MergeContext<'a, C>
    where
        C: IndexCollaborators + ?Sized,
    {
        MergeContext {
            collaborators,
            filenames: &self.filenames,
            version: self.version,
            skip_verify: self.config.skip_index_verify,
            table_config: &self.config.table,
        }
    }

    /// Writes `staging` as a new level-0 table and adds it.
    ///
    /// Returns whether any merge ran.
    pub fn flush_staging<C>(
        &mut self,
        staging: &StagingTable,
        prepare_checkpoint: i64,
        commit_checkpoint: i64,
        collaborators: &C,
    ) -> Result<bool>
    where
        C: IndexCollaborators + ?Sized,
    {
        let path = self.filenames.next_path();
        let table = Arc::new(IndexTable::from_staging(
            staging,
            &path,
            self.config.skip_index_verify,
            &self.config.table,
        )?);
        let merged = self.add_table(
            Arc::clone(&table),
            prepare_checkpoint,
            commit_checkpoint,
            0,
            collaborators,
        );
        if merged.is_err() {
            // Never published, so no snapshot can reference it.
            table.mark_for_deletion();
        }
        merged
    }

    /// Adds `table` at `level`; see [`IndexCatalog::add_table`].
    pub fn add_table<C>(
        &mut self,
        table: Arc<IndexTable>,
        prepare_checkpoint: i64,
        commit_checkpoint: i64,
        level: usize,
        collaborators: &C,
    ) -> Result<bool>
    where
        C: IndexCollaborators + ?Sized,
    {
        let result = self.snapshot().add_table(
            table,
            prepare_checkpoint,
            commit_checkpoint,
            level,
            self.context(collaborators),
        )?;
        self.publish(result)
    }

    /// Runs one manual merge of the capped levels; see
    /// [`IndexCatalog::try_manual_merge`].
    pub fn try_manual_merge<C>(&mut self, collaborators: &C) -> Result<bool>
    where
        C: IndexCollaborators + ?Sized,
    {
        let result = self.snapshot().try_manual_merge(self.context(collaborators))?;
        if !result.has_merged_any {
            debug!("manual merge found nothing to merge");
            return Ok(false);
        }
        self.publish(result)
    }

    pub fn table_for_manual_merge(&self) -> (usize, Option<Arc<IndexTable>>) {
        self.snapshot().table_for_manual_merge()
    }

    /// Table files in the catalog directory not referenced by the current
    /// snapshot.
    pub fn orphaned_tables(&self) -> Result<Vec<PathBuf>> {
        self.snapshot().orphaned_tables(&self.dir)
    }

    /// Persists `result`, makes it current and retires what it replaced.
    fn publish(&mut self, result: MergeResult) -> Result<bool> {
        let MergeResult {
            catalog,
            superseded,
            has_merged_any,
            created,
        } = result;

        if let Err(e) = catalog.save_to_file(&self.descriptor_path) {
            warn!(error = %e, "descriptor save failed, discarding merge output");
            for table in &created {
                table.mark_for_deletion();
            }
            return Err(e);
        }

        *self.current.write() = Arc::new(catalog);

        for table in &superseded {
            table.mark_for_deletion();
        }
        if has_merged_any {
            info!(
                created = created.len(),
                superseded = superseded.len(),
                levels = ?self.snapshot().level_sizes(),
                "catalog updated"
            );
        }
        Ok(has_merged_any)
    }

    /// Releases every table of the current snapshot, waiting up to
    /// `timeout` per table for readers to drain.
    pub fn dispose(self, timeout: Duration) -> Result<()> {
        self.snapshot().dispose(timeout)
    }
}

/// Cheap, cloneable read handle onto a writer's current snapshot.
#[derive(Clone)]
pub struct CatalogView {
    current: Shared,
}

impl std::fmt::Debug for CatalogView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CatalogView").field(&*self.snapshot()).finish()
    }
}

impl CatalogView {
    pub fn snapshot(&self) -> Arc<IndexCatalog> {
        Arc::clone(&self.current.read())
    }

    /// Runs `lookup` on the current snapshot, retrying on a newer one if a
    /// table was torn down underneath it.
    fn with_retry<T, F>(&self, lookup: F) -> Result<T>
    where
        F: Fn(&IndexCatalog) -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            let snapshot = self.snapshot();
            match lookup(&snapshot) {
                Err(e) if e.is_table_deleted() && attempt < LOOKUP_RETRIES => {
                    attempt += 1;
                    debug!(attempt, "lookup raced with a merge, retrying");
                }
                other => return other,
            }
        }
    }

    pub fn get(&self, stream_hash: u64, event_number: i64) -> Result<Vec<IndexEntry>> {
        self.with_retry(|c| c.get(stream_hash, event_number))
    }

    pub fn latest_entry(&self, stream_hash: u64) -> Result<Option<IndexEntry>> {
        self.with_retry(|c| c.latest_entry(stream_hash))
    }

    pub fn oldest_entry(&self, stream_hash: u64) -> Result<Option<IndexEntry>> {
        self.with_retry(|c| c.oldest_entry(stream_hash))
    }

    pub fn range(&self, stream_hash: u64, from: i64, to: i64) -> Result<Vec<IndexEntry>> {
        self.with_retry(|c| c.range(stream_hash, from, to))
    }
}
