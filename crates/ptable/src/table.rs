use bloom::BloomFilter;
use config::TableConfig;
use md5::{Digest, Md5};
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::entry::{IndexEntry, TableVersion};
use crate::error::{IndexError, Result};
use crate::format::{self, DIGEST_BYTES, FOOTER_BYTES, HEADER_BYTES};
use crate::lifecycle::{Lifecycle, MarkOutcome, Teardown};
use crate::merge::{self, IndexCollaborators};
use crate::midpoints::Midpoints;
use crate::pool::ReaderPool;
use crate::reader::TableReader;
use crate::staging::StagingTable;
use crate::writer::{bloom_path, TableWriter, WriteOptions};

/// An immutable, sorted index table file.
///
/// Opening a table validates its structure (and, unless skipped, its digest),
/// samples its midpoints and opens a pool of read handles. Lookups go through
/// a [`TableReader`] lease obtained from [`acquire_reader`]; the convenience
/// methods on this type take and return one internally.
///
/// A table is retired with [`mark_for_deletion`] (the file is removed) or
/// [`mark_for_disposal`] (handles are closed, the file stays). Either way the
/// teardown waits until the last lease is returned.
///
/// [`acquire_reader`]: IndexTable::acquire_reader
/// [`mark_for_deletion`]: IndexTable::mark_for_deletion
/// [`mark_for_disposal`]: IndexTable::mark_for_disposal
#[derive(Debug)]
pub struct IndexTable {
    path: PathBuf,
    version: TableVersion,
    count: u64,
    has_digest: bool,
    pub(crate) midpoints: Midpoints,
    pub(crate) bloom: Option<BloomFilter>,
    pub(crate) pool: ReaderPool,
    pub(crate) lifecycle: Lifecycle,
}

impl IndexTable {
    /// Opens an existing table.
    ///
    /// # Errors
    ///
    /// - [`IndexError::Corrupt`] if the structure is invalid, or if
    ///   `skip_verify` is false and the digest does not match.
    /// - [`IndexError::InvalidArgument`] for an invalid `cfg`.
    pub fn open(path: impl AsRef<Path>, skip_verify: bool, cfg: &TableConfig) -> Result<Self> {
        let path = path.as_ref();
        cfg.validate()
            .map_err(|e| IndexError::InvalidArgument(e.to_string()))?;

        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let min_size = HEADER_BYTES + FOOTER_BYTES + DIGEST_BYTES;
        if file_size < min_size {
            return Err(IndexError::corrupt(
                path,
                format!("file is {} bytes, smaller than an empty table", file_size),
            ));
        }

        let header = format::read_header(&mut file).map_err(|e| structural(path, e))?;
        file.seek(SeekFrom::Start(file_size - FOOTER_BYTES - DIGEST_BYTES))?;
        let footer = format::read_footer(&mut file).map_err(|e| structural(path, e))?;

        let expected = footer
            .entry_count
            .checked_mul(header.version.entry_size())
            .and_then(|n| n.checked_add(min_size));
        if expected != Some(file_size) {
            return Err(IndexError::corrupt(
                path,
                format!(
                    "file is {} bytes but footer claims {} {} entries",
                    file_size, footer.entry_count, header.version
                ),
            ));
        }

        if skip_verify {
            debug!(path = %path.display(), "digest verification skipped");
        } else if footer.has_digest() {
            verify_digest(&mut file, path, file_size)?;
        } else {
            check_empty_digest_slot(&mut file, path, file_size)?;
            warn!(
                path = %path.display(),
                "table was written without a digest; opening unverified"
            );
        }

        let version = header.version;
        let count = footer.entry_count;
        let midpoints = {
            let mut reader = io::BufReader::new(&mut file);
            Midpoints::build(count, cfg.cache_depth, |i| {
                reader.seek(SeekFrom::Start(format::entry_offset(version, i)))?;
                format::read_entry(&mut reader, version).map_err(|e| read_failure(path, e))
            })?
        }
        .ok_or_else(|| IndexError::corrupt(path, "sampled entries are out of order"))?;

        let bloom = if cfg.use_bloom_filter && count > 0 {
            load_bloom(path, count)
        } else {
            None
        };

        let pool = ReaderPool::open(path, cfg.initial_readers, cfg.max_readers)?;

        debug!(
            path = %path.display(),
            entries = count,
            version = %version,
            midpoints = midpoints.len(),
            bloom = bloom.is_some(),
            "index table opened"
        );

        Ok(Self {
            path: path.to_path_buf(),
            version,
            count,
            has_digest: footer.has_digest(),
            midpoints,
            bloom,
            pool,
            lifecycle: Lifecycle::default(),
        })
    }

    /// Writes `staging` as a new table at `path` and opens it.
    ///
    /// The digest is computed unless `skip_verify` is set.
    ///
    /// # Errors
    ///
    /// [`IndexError::Format`] if the snapshot is empty or holds an entry the
    /// staging version cannot represent.
    pub fn from_staging(
        staging: &StagingTable,
        path: impl AsRef<Path>,
        skip_verify: bool,
        cfg: &TableConfig,
    ) -> Result<Self> {
        let path = path.as_ref();
        let entries = staging.sorted_snapshot()?;
        let opts = WriteOptions {
            version: staging.version(),
            skip_digest: skip_verify,
            write_bloom: cfg.use_bloom_filter,
            expected_count: entries.len(),
        };
        TableWriter::write(path, opts, entries.into_iter().map(Ok))?;
        // Freshly written; the digest pass would only re-read our own bytes.
        Self::open(path, true, cfg)
    }

    /// Merges `inputs` (newest first) into a new table at `path`.
    ///
    /// Dead entries are dropped, duplicates of one stream collapse to the
    /// entry from the earliest input, and collisions between streams are all
    /// kept. Older-format inputs are rehashed through `collaborators`.
    ///
    /// # Errors
    ///
    /// - [`IndexError::InvalidArgument`] if fewer than two inputs are given.
    /// - Any read error from an input; the partial output is removed.
    pub fn from_merge<T, C>(
        inputs: &[T],
        path: impl AsRef<Path>,
        collaborators: &C,
        version: TableVersion,
        skip_verify: bool,
        cfg: &TableConfig,
    ) -> Result<Self>
    where
        T: AsRef<IndexTable>,
        C: IndexCollaborators + ?Sized,
    {
        let path = path.as_ref();
        let tables: Vec<&IndexTable> = inputs.iter().map(AsRef::as_ref).collect();
        let stats = merge::merge_into(&tables, path, collaborators, version, skip_verify, cfg)?;
        info!(
            path = %path.display(),
            inputs = tables.len(),
            read = stats.entries_read,
            written = stats.entries_written,
            dropped = stats.dropped_dead,
            duplicates = stats.duplicates_removed,
            collisions = stats.collisions_kept,
            upgraded = stats.upgraded,
            "merged index tables"
        );
        Self::open(path, true, cfg)
    }

    /// Leases a read handle.
    ///
    /// # Errors
    ///
    /// [`IndexError::TableDeleted`] once the table has been torn down.
    pub fn acquire_reader(&self) -> Result<TableReader<'_>> {
        if !self.lifecycle.try_acquire() {
            return Err(IndexError::TableDeleted(self.path.clone()));
        }
        match self.pool.take() {
            Ok(handle) => Ok(TableReader::new(self, handle)),
            Err(e) => {
                self.release();
                Err(e)
            }
        }
    }

    pub(crate) fn release(&self) {
        if let Some(teardown) = self.lifecycle.release() {
            self.teardown(teardown);
        }
    }

    /// Marks the table superseded. The file (and its sidecar) are removed
    /// once the last reader lets go. Idempotent.
    pub fn mark_for_deletion(&self) {
        self.mark(true);
    }

    /// Releases the table without deleting its file, once the last reader
    /// lets go. Idempotent.
    pub fn mark_for_disposal(&self) {
        self.mark(false);
    }

    fn mark(&self, delete_file: bool) {
        match self.lifecycle.mark(delete_file) {
            MarkOutcome::TearDownNow(teardown) => self.teardown(teardown),
            MarkOutcome::Deferred => {
                debug!(
                    path = %self.path.display(),
                    readers = self.lifecycle.active_readers(),
                    delete_file,
                    "table teardown deferred until readers drain"
                );
            }
            MarkOutcome::AlreadyTornDown { needs_late_delete } => {
                if needs_late_delete {
                    self.remove_files();
                }
            }
        }
    }

    fn teardown(&self, teardown: Teardown) {
        self.pool.close();
        if teardown == Teardown::Delete {
            self.remove_files();
        }
        debug!(path = %self.path.display(), deleted = teardown == Teardown::Delete, "table destroyed");
        self.lifecycle.finish();
    }

    fn remove_files(&self) {
        for p in [self.path.clone(), bloom_path(&self.path)] {
            match fs::remove_file(&p) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %p.display(), error = %e, "failed to remove table file"),
            }
        }
    }

    /// Waits until the table has been torn down.
    ///
    /// # Errors
    ///
    /// [`IndexError::Timeout`] if readers are still active after `timeout`.
    /// The table is left untouched and the wait can be repeated.
    pub fn wait_for_destroy(&self, timeout: Duration) -> Result<()> {
        if self.lifecycle.wait_finished(timeout) {
            Ok(())
        } else {
            Err(IndexError::Timeout {
                path: self.path.clone(),
                timeout,
            })
        }
    }

    /// Re-reads the file and checks its digest.
    ///
    /// # Errors
    ///
    /// [`IndexError::Corrupt`] on mismatch, or if the table carries no digest.
    pub fn verify(&self) -> Result<()> {
        if !self.has_digest {
            return Err(IndexError::corrupt(&self.path, "table has no digest to verify"));
        }
        let mut file = File::open(&self.path)?;
        let size = file.metadata()?.len();
        verify_digest(&mut file, &self.path, size)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn version(&self) -> TableVersion {
        self.version
    }

    /// Number of entries.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn has_digest(&self) -> bool {
        self.has_digest
    }

    pub fn has_bloom_filter(&self) -> bool {
        self.bloom.is_some()
    }

    pub fn file_size(&self) -> u64 {
        format::expected_file_size(self.version, self.count)
    }

    pub fn active_readers(&self) -> u64 {
        self.lifecycle.active_readers()
    }

    pub fn is_marked(&self) -> bool {
        self.lifecycle.is_marked()
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.lifecycle.is_marked_for_deletion()
    }

    pub fn is_destroyed(&self) -> bool {
        self.lifecycle.is_torn_down()
    }

    /// Every entry stored under the exact key. More than one entry means a
    /// hash collision between streams, for the caller to resolve.
    pub fn get(&self, stream_hash: u64, event_number: i64) -> Result<Vec<IndexEntry>> {
        self.acquire_reader()?.get(stream_hash, event_number)
    }

    /// The entry with the highest event number for `stream_hash`.
    pub fn latest_entry(&self, stream_hash: u64) -> Result<Option<IndexEntry>> {
        self.acquire_reader()?.latest_entry(stream_hash)
    }

    /// The entry with the lowest event number for `stream_hash`.
    pub fn oldest_entry(&self, stream_hash: u64) -> Result<Option<IndexEntry>> {
        self.acquire_reader()?.oldest_entry(stream_hash)
    }

    /// Entries of `stream_hash` with `from <= event_number <= to`, highest
    /// event number first.
    pub fn range(&self, stream_hash: u64, from: i64, to: i64) -> Result<Vec<IndexEntry>> {
        self.acquire_reader()?.range(stream_hash, from, to)
    }
}

impl AsRef<IndexTable> for IndexTable {
    fn as_ref(&self) -> &IndexTable {
        self
    }
}

fn verify_digest(file: &mut File, path: &Path, file_size: u64) -> Result<()> {
    let body_len = file_size - DIGEST_BYTES;
    file.seek(SeekFrom::Start(0))?;
    let mut md5 = Md5::new();
    let mut body = io::BufReader::new(&mut *file).take(body_len);
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = body.read(&mut buf)?;
        if n == 0 {
            break;
        }
        md5.update(&buf[..n]);
    }
    let mut stored = [0u8; DIGEST_BYTES as usize];
    file.seek(SeekFrom::Start(body_len))?;
    file.read_exact(&mut stored)
        .map_err(|e| read_failure(path, e))?;
    if md5.finalize().as_slice() != stored.as_slice() {
        return Err(IndexError::corrupt(path, "digest mismatch"));
    }
    debug!(path = %path.display(), "digest verified");
    Ok(())
}

/// A table written without a digest leaves the slot zero-filled; anything
/// else means the footer flags themselves were damaged.
fn check_empty_digest_slot(file: &mut File, path: &Path, file_size: u64) -> Result<()> {
    let mut slot = [0u8; DIGEST_BYTES as usize];
    file.seek(SeekFrom::Start(file_size - DIGEST_BYTES))?;
    file.read_exact(&mut slot)
        .map_err(|e| read_failure(path, e))?;
    if slot.iter().any(|&b| b != 0) {
        return Err(IndexError::corrupt(
            path,
            "footer claims no digest but the digest slot is filled",
        ));
    }
    Ok(())
}

fn load_bloom(path: &Path, count: u64) -> Option<BloomFilter> {
    let sidecar = bloom_path(path);
    match BloomFilter::load(&sidecar) {
        Ok(bf) if bf.items() == count => Some(bf),
        Ok(bf) => {
            warn!(
                path = %sidecar.display(),
                sidecar_items = bf.items(),
                entries = count,
                "ignoring bloom sidecar built for other data"
            );
            None
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no bloom sidecar");
            None
        }
        Err(e) => {
            warn!(path = %sidecar.display(), error = %e, "ignoring unreadable bloom sidecar");
            None
        }
    }
}

/// Header/footer decode failures are corruption, not I/O trouble.
fn structural(path: &Path, e: io::Error) -> IndexError {
    match e.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => {
            IndexError::corrupt(path, e.to_string())
        }
        _ => IndexError::Io(e),
    }
}

/// A read that runs past the data is a truncated (corrupt) file.
pub(crate) fn read_failure(path: &Path, e: io::Error) -> IndexError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        IndexError::corrupt(path, "unexpected end of file")
    } else {
        IndexError::Io(e)
    }
}
