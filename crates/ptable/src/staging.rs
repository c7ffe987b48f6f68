//! In-memory staging snapshot handed to [`IndexTable::from_staging`].
//!
//! The real staging table lives with the log writer; this is the minimal
//! value it hands over on flush: a target format version plus the entries
//! accumulated since the previous flush, in any order.
//!
//! [`IndexTable::from_staging`]: crate::IndexTable::from_staging

use crate::entry::{IndexEntry, TableVersion};
use crate::error::{IndexError, Result};

#[derive(Debug, Clone)]
pub struct StagingTable {
    version: TableVersion,
    entries: Vec<IndexEntry>,
}

impl StagingTable {
    pub fn new(version: TableVersion) -> Self {
        Self {
            version,
            entries: Vec::new(),
        }
    }

    pub fn from_entries(version: TableVersion, entries: Vec<IndexEntry>) -> Self {
        Self { version, entries }
    }

    /// Records one mapping.
    pub fn add(&mut self, stream_hash: u64, event_number: i64, log_position: i64) {
        self.entries
            .push(IndexEntry::new(stream_hash, event_number, log_position));
    }

    pub fn version(&self) -> TableVersion {
        self.version
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the entries in table order after checking the snapshot is
    /// writable: non-empty, and every entry fits the target version.
    pub fn sorted_snapshot(&self) -> Result<Vec<IndexEntry>> {
        if self.entries.is_empty() {
            return Err(IndexError::Format(
                "refusing to write a table from an empty staging snapshot".to_string(),
            ));
        }
        for entry in &self.entries {
            self.version.check_representable(entry)?;
        }
        let mut sorted = self.entries.clone();
        sorted.sort_by(IndexEntry::table_order);
        sorted.dedup();
        Ok(sorted)
    }
}
