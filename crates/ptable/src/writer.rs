use bloom::BloomFilter;
use md5::{Digest, Md5};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::entry::{IndexEntry, TableVersion};
use crate::error::{IndexError, Result};
use crate::format::{self, Footer, DIGEST_BYTES, FLAG_HAS_DIGEST};

/// Target false positive rate of the stream-hash sidecar.
const BLOOM_FPR: f64 = 0.01;

/// Suffix of the temporary file a table is written to before the rename.
pub const TMP_SUFFIX: &str = ".tmp";

/// Suffix of the bloom filter sidecar next to a table file.
pub const BLOOM_SUFFIX: &str = ".bloom";

/// Returns `<path><suffix>` without touching the existing extension.
pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

/// Path of the bloom sidecar belonging to the table at `path`.
#[must_use]
pub fn bloom_path(path: &Path) -> PathBuf {
    with_suffix(path, BLOOM_SUFFIX)
}

/// What a finished write produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSummary {
    pub entry_count: u64,
    pub has_digest: bool,
    pub file_size: u64,
}

/// Options for a single table write.
#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
    pub version: TableVersion,
    /// Skip computing the trailing digest (the slot is zero-filled).
    pub skip_digest: bool,
    /// Also write the stream-hash bloom sidecar.
    pub write_bloom: bool,
    /// Estimated entry count, used to size the bloom filter.
    pub expected_count: usize,
}

/// `Write` adapter that feeds every byte into an MD5 state.
struct DigestWriter<W: Write> {
    inner: W,
    md5: Option<Md5>,
    written: u64,
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        if let Some(md5) = self.md5.as_mut() {
            md5.update(&buf[..n]);
        }
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Writes index tables. Stateless; see [`TableWriter::write`].
///
/// The write is crash-safe: data goes to `<path>.tmp`, is fsynced, and is
/// then atomically renamed over `path`. A crash mid-write leaves only the
/// temp file, which nothing references.
pub struct TableWriter;

impl TableWriter {
    /// Streams `entries` (already in table order) into a new table at `path`.
    ///
    /// # Errors
    ///
    /// - [`IndexError::Format`] if the entries are out of order or do not
    ///   fit `opts.version`; the temp file is removed.
    /// - Any error yielded by the iterator itself, unchanged.
    /// - I/O failures.
    pub fn write<I>(path: &Path, opts: WriteOptions, entries: I) -> Result<WriteSummary>
    where
        I: IntoIterator<Item = Result<IndexEntry>>,
    {
        let tmp_path = with_suffix(path, TMP_SUFFIX);
        let result = Self::write_tmp(&tmp_path, opts, entries);
        let (summary, bloom) = match result {
            Ok(done) => done,
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                return Err(e);
            }
        };

        // The sidecar goes first: a table without its sidecar is still fine,
        // a sidecar without its table is swept by catalog recovery.
        if let Some(bloom) = bloom {
            if let Err(e) = bloom.save(&bloom_path(path)) {
                warn!(path = %path.display(), error = %e, "failed to write bloom sidecar");
            }
        }

        fs::rename(&tmp_path, path)?;
        sync_parent_dir(path);

        debug!(
            path = %path.display(),
            entries = summary.entry_count,
            digest = summary.has_digest,
            version = %opts.version,
            "index table written"
        );
        Ok(summary)
    }

    fn write_tmp<I>(
        tmp_path: &Path,
        opts: WriteOptions,
        entries: I,
    ) -> Result<(WriteSummary, Option<BloomFilter>)>
    where
        I: IntoIterator<Item = Result<IndexEntry>>,
    {
        let raw_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(tmp_path)?;
        let mut w = DigestWriter {
            inner: BufWriter::new(raw_file),
            md5: (!opts.skip_digest).then(Md5::new),
            written: 0,
        };

        let mut bloom =
            opts.write_bloom.then(|| BloomFilter::new(opts.expected_count.max(1), BLOOM_FPR));

        format::write_header(&mut w, opts.version)?;

        let mut count: u64 = 0;
        let mut prev: Option<IndexEntry> = None;
        for entry in entries {
            let entry = entry?;
            opts.version.check_representable(&entry)?;
            if let Some(p) = prev {
                if p.table_order(&entry).is_gt() {
                    return Err(IndexError::Format(format!(
                        "entries out of order: {} written before {}",
                        p, entry
                    )));
                }
            }
            format::write_entry(&mut w, opts.version, &entry)?;
            if let Some(bf) = bloom.as_mut() {
                bf.insert(entry.stream_hash);
            }
            prev = Some(entry);
            count += 1;
        }

        let flags = if opts.skip_digest { 0 } else { FLAG_HAS_DIGEST };
        format::write_footer(
            &mut w,
            &Footer {
                entry_count: count,
                flags,
            },
        )?;

        let mut digest = [0u8; DIGEST_BYTES as usize];
        if let Some(md5) = w.md5.take() {
            digest.copy_from_slice(&md5.finalize());
        }
        w.write_all(&digest)?;

        let file_size = w.written;
        w.flush()?;
        let file: File = w.inner.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        let bloom = if count == 0 { None } else { bloom };
        Ok((
            WriteSummary {
                entry_count: count,
                has_digest: !opts.skip_digest,
                file_size,
            },
            bloom,
        ))
    }
}

/// Fsyncs the parent directory so a rename survives a crash (no-op where
/// directories cannot be opened).
pub(crate) fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}
