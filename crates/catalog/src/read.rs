//! Lookups across every table of a catalog snapshot.
//!
//! Tables are consulted level by level, newest first. A table torn down under
//! a stale snapshot fails the lookup with `TableDeleted`; [`CatalogView`]
//! retries those on a fresh snapshot.
//!
//! [`CatalogView`]: crate::CatalogView

use std::collections::HashSet;

use ptable::IndexEntry;

use crate::error::Result;
use crate::IndexCatalog;

impl IndexCatalog {
    /// Every entry stored under the exact key, newest table first. Several
    /// entries mean the key is shared by more than one stream (or the same
    /// event was indexed twice) and the caller must check the log.
    pub fn get(&self, stream_hash: u64, event_number: i64) -> Result<Vec<IndexEntry>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for (_, table) in self.tables() {
            for entry in table.get(stream_hash, event_number)? {
                if seen.insert(entry) {
                    out.push(entry);
                }
            }
        }
        Ok(out)
    }

    /// The entry with the highest event number for `stream_hash`; on a tie
    /// the newest table wins.
    pub fn latest_entry(&self, stream_hash: u64) -> Result<Option<IndexEntry>> {
        let mut best: Option<IndexEntry> = None;
        for (_, table) in self.tables() {
            if let Some(entry) = table.latest_entry(stream_hash)? {
                if best.map_or(true, |b| entry.event_number > b.event_number) {
                    best = Some(entry);
                }
            }
        }
        Ok(best)
    }

    /// The entry with the lowest event number for `stream_hash`; on a tie
    /// the newest table wins.
    pub fn oldest_entry(&self, stream_hash: u64) -> Result<Option<IndexEntry>> {
        let mut best: Option<IndexEntry> = None;
        for (_, table) in self.tables() {
            if let Some(entry) = table.oldest_entry(stream_hash)? {
                if best.map_or(true, |b| entry.event_number < b.event_number) {
                    best = Some(entry);
                }
            }
        }
        Ok(best)
    }

    /// Entries of `stream_hash` with `from <= event_number <= to` from all
    /// tables, in table order (highest event number first).
    pub fn range(&self, stream_hash: u64, from: i64, to: i64) -> Result<Vec<IndexEntry>> {
        let mut out = Vec::new();
        for (_, table) in self.tables() {
            out.extend(table.range(stream_hash, from, to)?);
        }
        out.sort_by(IndexEntry::table_order);
        out.dedup();
        Ok(out)
    }

    /// Returns `true` if any table holds an entry for the exact key.
    pub fn contains(&self, stream_hash: u64, event_number: i64) -> Result<bool> {
        for (_, table) in self.tables() {
            if !table.get(stream_hash, event_number)?.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
