//! # ptable - immutable index tables
//!
//! An index table maps `(stream_hash, event_number)` to the byte position of
//! the event in the log. Tables are written once (from a flushed staging
//! snapshot, or as the merge of older tables) and never modified.
//!
//! ## File layout
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ HEADER (16 B)                                                  │
//! │ magic (u32 LE) "IXTB" | version (u8) | reserved [u8; 11]       │
//! ├───────────────────────────────────────────────────────────────┤
//! │ ENTRIES, descending by (hash, event_number), then position     │
//! │                                                               │
//! │ v1: hash (u32) | event_number (i32) | log_position (i64)       │
//! │ v2: hash (u64) | event_number (i64) | log_position (i64)       │
//! ├───────────────────────────────────────────────────────────────┤
//! │ FOOTER (16 B)                                                  │
//! │ entry_count (u64) | flags (u32) | magic (u32) "IXTF"           │
//! ├───────────────────────────────────────────────────────────────┤
//! │ DIGEST (16 B)                                                  │
//! │ MD5 of all preceding bytes; zero when written unverified       │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! A bloom filter over the stream hashes is kept next to the table in
//! `<table>.bloom`. It only speeds up negative lookups; a table opens fine
//! without it.
//!
//! ## Lifecycle
//!
//! Reads lease a handle with [`IndexTable::acquire_reader`]. A superseded
//! table is [marked for deletion](IndexTable::mark_for_deletion) and removed
//! from disk once the last lease is dropped.

mod entry;
mod error;
mod format;
mod lifecycle;
mod merge;
mod midpoints;
mod pool;
mod reader;
mod staging;
mod table;
mod writer;

pub use entry::{IndexEntry, TableVersion};
pub use error::{IndexError, Result};
pub use format::{expected_file_size, DIGEST_BYTES, FOOTER_BYTES, FOOTER_MAGIC, HEADER_BYTES, TABLE_MAGIC};
pub use merge::{FnCollaborators, IndexCollaborators};
pub use reader::{Entries, EntriesRev, TableReader};
pub use staging::StagingTable;
pub use table::IndexTable;
pub use writer::{bloom_path, TableWriter, WriteOptions, WriteSummary, BLOOM_SUFFIX, TMP_SUFFIX};

#[cfg(test)]
mod tests;
