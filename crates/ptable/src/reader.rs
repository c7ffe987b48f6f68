use std::io::{Seek, SeekFrom};

use crate::entry::IndexEntry;
use crate::error::{IndexError, Result};
use crate::format;
use crate::pool::Handle;
use crate::table::{read_failure, IndexTable};

/// Entries decoded per step when iterating backwards.
const REVERSE_CHUNK: u64 = 256;

/// A leased read handle onto one table.
///
/// While a `TableReader` is alive the table cannot be torn down. Dropping it
/// returns the handle to the pool; if the table was marked in the meantime
/// and this was the last lease, the teardown runs on drop.
pub struct TableReader<'a> {
    table: &'a IndexTable,
    handle: Option<Handle>,
}

impl<'a> TableReader<'a> {
    pub(crate) fn new(table: &'a IndexTable, handle: Handle) -> Self {
        Self {
            table,
            handle: Some(handle),
        }
    }

    pub fn table(&self) -> &'a IndexTable {
        self.table
    }

    fn handle(&mut self) -> &mut Handle {
        // Only taken in Drop.
        self.handle.as_mut().unwrap_or_else(|| unreachable!("lease used after drop"))
    }

    fn seek_to(&mut self, index: u64) -> Result<()> {
        let offset = format::entry_offset(self.table.version(), index);
        self.handle().seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    fn next_sequential(&mut self) -> Result<IndexEntry> {
        let table = self.table;
        format::read_entry(self.handle(), table.version()).map_err(|e| read_failure(table.path(), e))
    }

    /// Reads the entry at `index`.
    ///
    /// # Errors
    ///
    /// [`IndexError::InvalidArgument`] if `index` is out of range.
    pub fn read_entry(&mut self, index: u64) -> Result<IndexEntry> {
        if index >= self.table.count() {
            return Err(IndexError::InvalidArgument(format!(
                "entry {} out of range for a table of {}",
                index,
                self.table.count()
            )));
        }
        self.seek_to(index)?;
        self.next_sequential()
    }

    /// First index whose key fails `before` (see [`Midpoints::window`]).
    ///
    /// [`Midpoints::window`]: crate::midpoints::Midpoints
    fn partition_point<P>(&mut self, before: P) -> Result<u64>
    where
        P: Fn((u64, i64)) -> bool,
    {
        let count = self.table.count();
        let (mut lo, mut hi) = self.table.midpoints.window(count, &before);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if before(self.read_entry(mid)?.key()) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    fn may_contain(&self, stream_hash: u64) -> bool {
        match &self.table.bloom {
            Some(bf) => bf.may_contain(stream_hash),
            None => true,
        }
    }

    /// Collects entries from `start` while `keep` holds.
    fn scan_from<P>(&mut self, start: u64, keep: P) -> Result<Vec<IndexEntry>>
    where
        P: Fn(&IndexEntry) -> bool,
    {
        let mut out = Vec::new();
        if start >= self.table.count() {
            return Ok(out);
        }
        self.seek_to(start)?;
        for _ in start..self.table.count() {
            let entry = self.next_sequential()?;
            if !keep(&entry) {
                break;
            }
            out.push(entry);
        }
        Ok(out)
    }

    /// Every entry under the exact key; more than one is a collision.
    pub fn get(&mut self, stream_hash: u64, event_number: i64) -> Result<Vec<IndexEntry>> {
        if !self.may_contain(stream_hash) {
            return Ok(Vec::new());
        }
        let target = (stream_hash, event_number);
        let start = self.partition_point(|k| k > target)?;
        self.scan_from(start, |e| e.key() == target)
    }

    /// Highest event number stored for `stream_hash`.
    pub fn latest_entry(&mut self, stream_hash: u64) -> Result<Option<IndexEntry>> {
        if !self.may_contain(stream_hash) {
            return Ok(None);
        }
        let start = self.partition_point(|(h, _)| h > stream_hash)?;
        if start >= self.table.count() {
            return Ok(None);
        }
        let entry = self.read_entry(start)?;
        Ok((entry.stream_hash == stream_hash).then_some(entry))
    }

    /// Lowest event number stored for `stream_hash`.
    pub fn oldest_entry(&mut self, stream_hash: u64) -> Result<Option<IndexEntry>> {
        if !self.may_contain(stream_hash) {
            return Ok(None);
        }
        let end = self.partition_point(|(h, _)| h >= stream_hash)?;
        if end == 0 {
            return Ok(None);
        }
        let entry = self.read_entry(end - 1)?;
        Ok((entry.stream_hash == stream_hash).then_some(entry))
    }

    /// Entries of `stream_hash` with `from <= event_number <= to`, highest
    /// event number first. Empty when `from > to`.
    pub fn range(&mut self, stream_hash: u64, from: i64, to: i64) -> Result<Vec<IndexEntry>> {
        if from > to || !self.may_contain(stream_hash) {
            return Ok(Vec::new());
        }
        let start = self.partition_point(|k| k > (stream_hash, to))?;
        self.scan_from(start, |e| e.stream_hash == stream_hash && e.event_number >= from)
    }

    /// Iterates every entry in table order (highest key first).
    pub fn into_entries(self) -> Entries<'a> {
        Entries {
            reader: self,
            next: 0,
            positioned: false,
            prev: None,
        }
    }

    /// Iterates every entry in reverse table order (lowest key first).
    pub fn into_entries_rev(self) -> EntriesRev<'a> {
        let end = self.table.count();
        EntriesRev {
            reader: self,
            end,
            buf: Vec::new(),
        }
    }
}

impl Drop for TableReader<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.table.pool.put(handle);
        }
        self.table.release();
    }
}

/// Forward iterator over a table, see [`TableReader::into_entries`].
///
/// Entries are checked against table order as they are read, so a table
/// opened without verification reports damage here.
pub struct Entries<'a> {
    reader: TableReader<'a>,
    next: u64,
    positioned: bool,
    prev: Option<IndexEntry>,
}

impl Iterator for Entries<'_> {
    type Item = Result<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.reader.table.count() {
            return None;
        }
        if !self.positioned {
            if let Err(e) = self.reader.seek_to(self.next) {
                self.next = u64::MAX;
                return Some(Err(e));
            }
            self.positioned = true;
        }
        let item = self.reader.next_sequential().and_then(|entry| {
            if self.prev.is_some_and(|p| p.table_order(&entry).is_gt()) {
                return Err(IndexError::corrupt(
                    self.reader.table.path(),
                    format!("entry {} is out of order", self.next),
                ));
            }
            Ok(entry)
        });
        match &item {
            Ok(entry) => {
                self.prev = Some(*entry);
                self.next += 1;
            }
            // Stop after the first failure.
            Err(_) => self.next = u64::MAX,
        }
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.reader.table.count().saturating_sub(self.next) as usize;
        (left, Some(left))
    }
}

/// Backward iterator over a table, see [`TableReader::into_entries_rev`].
pub struct EntriesRev<'a> {
    reader: TableReader<'a>,
    /// Entries `[0, end)` have not been decoded yet.
    end: u64,
    /// Decoded chunk in table order; popped from the back.
    buf: Vec<IndexEntry>,
}

impl EntriesRev<'_> {
    fn refill(&mut self) -> Result<()> {
        let start = self.end.saturating_sub(REVERSE_CHUNK);
        self.reader.seek_to(start)?;
        for _ in start..self.end {
            let entry = self.reader.next_sequential()?;
            self.buf.push(entry);
        }
        self.end = start;
        Ok(())
    }
}

impl Iterator for EntriesRev<'_> {
    type Item = Result<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            if self.end == 0 {
                return None;
            }
            if let Err(e) = self.refill() {
                self.end = 0;
                self.buf.clear();
                return Some(Err(e));
            }
        }
        self.buf.pop().map(Ok)
    }
}
