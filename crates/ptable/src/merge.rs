//! K-way merge of index tables.
//!
//! Walks N input tables in table order (highest key first) and streams the
//! union into a single new table. Per output key:
//!
//! - entries the log no longer considers live are dropped;
//! - if several entries share the key, each is resolved to its stream. Two
//!   entries of the same stream are duplicates and only the one from the
//!   earliest input (the most recent table) survives; entries of different
//!   streams are a hash collision and are all kept, adjacent to each other;
//! - entries whose record no longer exists are dropped.
//!
//! Inputs written in an older format than the output have their hashes
//! recomputed first. Those inputs are read fully into memory, rehashed and
//! re-sorted before they join the merge.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::path::Path;

use config::TableConfig;
use tracing::debug;

use crate::entry::{IndexEntry, TableVersion};
use crate::error::{IndexError, Result};
use crate::reader::Entries;
use crate::table::IndexTable;
use crate::writer::{TableWriter, WriteOptions};

/// Services the merge needs from the log.
pub trait IndexCollaborators {
    /// Identity of a stream, used to tell duplicates from collisions.
    type StreamId: Eq + Hash + Clone;

    /// Recomputes the hash of `stream` under the current format.
    fn upgrade_hash(&self, stream: &Self::StreamId, old_hash: u64) -> u64;

    /// Returns `false` if the record behind `entry` has been scavenged.
    fn is_live(&self, entry: &IndexEntry) -> bool;

    /// Reads the record behind `entry` and returns its stream, or `None` if
    /// the record does not exist.
    fn resolve_identity(&self, entry: &IndexEntry) -> Option<Self::StreamId>;
}

/// [`IndexCollaborators`] built from three closures.
pub struct FnCollaborators<S, U, L, R> {
    upgrade: U,
    live: L,
    resolve: R,
    _stream: PhantomData<fn() -> S>,
}

impl<S, U, L, R> FnCollaborators<S, U, L, R>
where
    S: Eq + Hash + Clone,
    U: Fn(&S, u64) -> u64,
    L: Fn(&IndexEntry) -> bool,
    R: Fn(&IndexEntry) -> Option<S>,
{
    pub fn new(upgrade: U, live: L, resolve: R) -> Self {
        Self {
            upgrade,
            live,
            resolve,
            _stream: PhantomData,
        }
    }
}

impl<S, U, L, R> IndexCollaborators for FnCollaborators<S, U, L, R>
where
    S: Eq + Hash + Clone,
    U: Fn(&S, u64) -> u64,
    L: Fn(&IndexEntry) -> bool,
    R: Fn(&IndexEntry) -> Option<S>,
{
    type StreamId = S;

    fn upgrade_hash(&self, stream: &S, old_hash: u64) -> u64 {
        (self.upgrade)(stream, old_hash)
    }

    fn is_live(&self, entry: &IndexEntry) -> bool {
        (self.live)(entry)
    }

    fn resolve_identity(&self, entry: &IndexEntry) -> Option<S> {
        (self.resolve)(entry)
    }
}

impl<S, U, L, R> fmt::Debug for FnCollaborators<S, U, L, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnCollaborators")
    }
}

/// Counters reported by a finished merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub entries_read: u64,
    pub entries_written: u64,
    /// Dropped because the record is gone (not live, or unresolvable).
    pub dropped_dead: u64,
    pub duplicates_removed: u64,
    /// Extra entries kept under a key already written (hash collisions).
    pub collisions_kept: u64,
    /// Entries whose hash was recomputed.
    pub upgraded: u64,
}

enum Cursor<'a> {
    Table(Entries<'a>),
    Upgraded(std::vec::IntoIter<IndexEntry>),
}

impl Iterator for Cursor<'_> {
    type Item = Result<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Cursor::Table(it) => it.next(),
            Cursor::Upgraded(it) => it.next().map(Ok),
        }
    }
}

/// Head of one input; the heap pops the entry that comes first in table
/// order, and the earlier input on an exact tie.
struct HeapEntry {
    entry: IndexEntry,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .entry
            .table_order(&self.entry)
            .then_with(|| other.source.cmp(&self.source))
    }
}

struct MergeIter<'a, 'c, C: IndexCollaborators + ?Sized> {
    cursors: Vec<Cursor<'a>>,
    heap: BinaryHeap<HeapEntry>,
    collaborators: &'c C,
    /// Survivors of the current key, in table order.
    pending: std::vec::IntoIter<IndexEntry>,
    stats: MergeStats,
    failed: bool,
}

impl<C: IndexCollaborators + ?Sized> MergeIter<'_, '_, C> {
    fn advance(&mut self, source: usize) -> Result<()> {
        if let Some(next) = self.cursors[source].next() {
            let entry = next?;
            self.heap.push(HeapEntry { entry, source });
        }
        Ok(())
    }

    /// Pops every head sharing the next key and resolves them to the
    /// entries to write.
    fn next_group(&mut self) -> Result<Option<Vec<IndexEntry>>> {
        let Some(first) = self.heap.pop() else {
            return Ok(None);
        };
        let key = first.entry.key();
        let mut group = vec![first];
        self.advance(group[0].source)?;
        while self.heap.peek().is_some_and(|h| h.entry.key() == key) {
            if let Some(h) = self.heap.pop() {
                let source = h.source;
                group.push(h);
                self.advance(source)?;
            }
        }

        let before = group.len() as u64;
        group.retain(|h| self.collaborators.is_live(&h.entry));
        self.stats.dropped_dead += before - group.len() as u64;

        if group.len() <= 1 {
            return Ok(Some(group.into_iter().map(|h| h.entry).collect()));
        }

        // Earliest input first, so the most recent table wins a duplicate.
        group.sort_by_key(|h| h.source);
        let mut seen = HashSet::with_capacity(group.len());
        let mut kept = Vec::with_capacity(group.len());
        for h in group {
            match self.collaborators.resolve_identity(&h.entry) {
                None => self.stats.dropped_dead += 1,
                Some(stream) => {
                    if seen.insert(stream) {
                        kept.push(h.entry);
                    } else {
                        self.stats.duplicates_removed += 1;
                    }
                }
            }
        }
        if kept.len() > 1 {
            self.stats.collisions_kept += kept.len() as u64 - 1;
            debug!(
                stream_hash = key.0,
                event_number = key.1,
                streams = kept.len(),
                "hash collision retained"
            );
        }
        kept.sort_by(IndexEntry::table_order);
        Ok(Some(kept))
    }
}

impl<C: IndexCollaborators + ?Sized> Iterator for MergeIter<'_, '_, C> {
    type Item = Result<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.pending.next() {
                self.stats.entries_written += 1;
                return Some(Ok(entry));
            }
            if self.failed {
                return None;
            }
            match self.next_group() {
                Ok(Some(group)) => self.pending = group.into_iter(),
                Ok(None) => return None,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Reads a table written in an older format, rehashes every entry whose
/// record still exists and returns them in table order.
fn upgrade_input<C>(
    table: &IndexTable,
    collaborators: &C,
    stats: &mut MergeStats,
) -> Result<Vec<IndexEntry>>
where
    C: IndexCollaborators + ?Sized,
{
    let mut out = Vec::with_capacity(table.count() as usize);
    for entry in table.acquire_reader()?.into_entries() {
        let entry = entry?;
        match collaborators.resolve_identity(&entry) {
            Some(stream) => {
                let stream_hash = collaborators.upgrade_hash(&stream, entry.stream_hash);
                out.push(IndexEntry { stream_hash, ..entry });
            }
            None => stats.dropped_dead += 1,
        }
    }
    stats.upgraded += out.len() as u64;
    out.sort_by(IndexEntry::table_order);
    Ok(out)
}

/// Merges `inputs` (newest first) into a new table file at `path`.
pub(crate) fn merge_into<C>(
    inputs: &[&IndexTable],
    path: &Path,
    collaborators: &C,
    version: TableVersion,
    skip_verify: bool,
    cfg: &TableConfig,
) -> Result<MergeStats>
where
    C: IndexCollaborators + ?Sized,
{
    if inputs.len() < 2 {
        return Err(IndexError::InvalidArgument(format!(
            "a merge needs at least two tables, got {}",
            inputs.len()
        )));
    }
    if let Some(t) = inputs.iter().find(|t| t.version() > version) {
        return Err(IndexError::InvalidArgument(format!(
            "cannot merge {} table {} into a {} table",
            t.version(),
            t.path().display(),
            version
        )));
    }

    let expected_count: u64 = inputs.iter().map(|t| t.count()).sum();
    let mut stats = MergeStats {
        entries_read: expected_count,
        ..MergeStats::default()
    };
    let mut cursors = Vec::with_capacity(inputs.len());
    for table in inputs {
        let cursor = if table.version().needs_hash_upgrade(version) {
            debug!(path = %table.path().display(), from = %table.version(), to = %version, "upgrading table hashes");
            let upgraded = upgrade_input(table, collaborators, &mut stats)?;
            Cursor::Upgraded(upgraded.into_iter())
        } else {
            Cursor::Table(table.acquire_reader()?.into_entries())
        };
        cursors.push(cursor);
    }

    let mut iter = MergeIter {
        cursors,
        heap: BinaryHeap::with_capacity(inputs.len()),
        collaborators,
        pending: Vec::new().into_iter(),
        stats,
        failed: false,
    };
    for source in 0..iter.cursors.len() {
        iter.advance(source)?;
    }

    let opts = WriteOptions {
        version,
        skip_digest: skip_verify,
        write_bloom: cfg.use_bloom_filter,
        expected_count: expected_count as usize,
    };
    TableWriter::write(path, opts, &mut iter)?;
    Ok(iter.stats)
}
