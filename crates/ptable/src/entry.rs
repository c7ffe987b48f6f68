//! Index entries and table format versions.

use std::cmp::Ordering;
use std::fmt;

use crate::error::{IndexError, Result};

/// One `(stream_hash, event_number) -> log_position` mapping.
///
/// Tables store entries in **descending** key order; see [`IndexEntry::key`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexEntry {
    pub stream_hash: u64,
    pub event_number: i64,
    pub log_position: i64,
}

impl IndexEntry {
    pub fn new(stream_hash: u64, event_number: i64, log_position: i64) -> Self {
        Self {
            stream_hash,
            event_number,
            log_position,
        }
    }

    /// The lookup key. Two entries with the same key are either duplicates
    /// of one event or a genuine hash collision between streams.
    #[must_use]
    pub fn key(&self) -> (u64, i64) {
        (self.stream_hash, self.event_number)
    }

    /// Table order: descending by key, then descending by log position so
    /// entries sharing a key sit next to each other deterministically.
    #[must_use]
    pub fn table_order(&self, other: &Self) -> Ordering {
        other
            .key()
            .cmp(&self.key())
            .then_with(|| other.log_position.cmp(&self.log_position))
    }
}

impl fmt::Display for IndexEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#018x}:{}@{}",
            self.stream_hash, self.event_number, self.log_position
        )
    }
}

/// On-disk table format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TableVersion {
    /// Legacy layout: 32-bit stream hash and 32-bit event number.
    V1,
    /// 64-bit stream hash and 64-bit event number.
    V2,
}

impl TableVersion {
    /// The version new tables are written with.
    pub const CURRENT: TableVersion = TableVersion::V2;

    /// Bytes per entry in the entry section.
    #[must_use]
    pub fn entry_size(self) -> u64 {
        match self {
            TableVersion::V1 => 4 + 4 + 8,
            TableVersion::V2 => 8 + 8 + 8,
        }
    }

    #[must_use]
    pub fn as_byte(self) -> u8 {
        match self {
            TableVersion::V1 => 1,
            TableVersion::V2 => 2,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(TableVersion::V1),
            2 => Some(TableVersion::V2),
            _ => None,
        }
    }

    /// Returns `true` if entries of this version carry hashes that must be
    /// recomputed when written as `target`.
    #[must_use]
    pub fn needs_hash_upgrade(self, target: TableVersion) -> bool {
        self == TableVersion::V1 && target > TableVersion::V1
    }

    /// Checks that `entry` fits in this version's fixed-width fields.
    pub fn check_representable(self, entry: &IndexEntry) -> Result<()> {
        if self == TableVersion::V1 {
            if entry.stream_hash > u64::from(u32::MAX) {
                return Err(IndexError::Format(format!(
                    "entry {} has a hash wider than 32 bits (v1 table)",
                    entry
                )));
            }
            if i32::try_from(entry.event_number).is_err() {
                return Err(IndexError::Format(format!(
                    "entry {} has an event number outside i32 (v1 table)",
                    entry
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for TableVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.as_byte())
    }
}
