use std::path::Path;

use anyhow::Result;
use config::TableConfig;

use crate::{IndexEntry, IndexTable, StagingTable, TableVersion};

/// Small pools and a shallow midpoint cache so tests exercise the on-disk
/// binary search instead of landing on a sampled key.
pub fn test_config() -> TableConfig {
    TableConfig {
        initial_readers: 1,
        max_readers: 4,
        cache_depth: 2,
        use_bloom_filter: true,
    }
}

pub fn staging(version: TableVersion, entries: &[(u64, i64, i64)]) -> StagingTable {
    let mut s = StagingTable::new(version);
    for &(hash, number, position) in entries {
        s.add(hash, number, position);
    }
    s
}

pub fn write_table(dir: &Path, name: &str, entries: &[(u64, i64, i64)]) -> Result<IndexTable> {
    write_versioned(dir, name, TableVersion::V2, entries)
}

pub fn write_versioned(
    dir: &Path,
    name: &str,
    version: TableVersion,
    entries: &[(u64, i64, i64)],
) -> Result<IndexTable> {
    let path = dir.join(name);
    Ok(IndexTable::from_staging(
        &staging(version, entries),
        &path,
        false,
        &test_config(),
    )?)
}

pub fn all_entries(table: &IndexTable) -> Result<Vec<IndexEntry>> {
    Ok(table
        .acquire_reader()?
        .into_entries()
        .collect::<crate::Result<Vec<_>>>()?)
}

pub fn e(hash: u64, number: i64, position: i64) -> IndexEntry {
    IndexEntry::new(hash, number, position)
}
