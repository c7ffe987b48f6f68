//! Naming of the table files a catalog creates.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Extension of index table files.
pub const TABLE_EXTENSION: &str = "ptable";

/// Hands out paths for new table files. Every call must return a path that
/// is not in use.
pub trait FilenameAllocator {
    fn next_path(&self) -> PathBuf;
}

/// `ptable-{seq:020}-{unix_ms}.ptable` inside one directory.
///
/// The sequence makes names unique within a process; the timestamp keeps
/// them unique across restarts even if the sequence is not resumed.
#[derive(Debug)]
pub struct SequentialFilenames {
    dir: PathBuf,
    next_seq: AtomicU64,
}

impl SequentialFilenames {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Continues after the highest sequence number found in `dir`.
    pub fn resume(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let highest = fs::read_dir(&dir)
            .map(|entries| {
                entries
                    .flatten()
                    .filter_map(|e| parse_seq(&e.path()))
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        Self {
            dir,
            next_seq: AtomicU64::new(highest + 1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl FilenameAllocator for SequentialFilenames {
    fn next_path(&self) -> PathBuf {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        self.dir
            .join(format!("ptable-{:020}-{}.{}", seq, ts, TABLE_EXTENSION))
    }
}

/// Returns `true` for files named like index tables.
pub fn is_table_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == TABLE_EXTENSION)
}

fn parse_seq(path: &Path) -> Option<u64> {
    if !is_table_file(path) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let rest = stem.strip_prefix("ptable-")?;
    let (seq, _ts) = rest.split_once('-')?;
    seq.parse().ok()
}
