use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use catalog::{CatalogWriter, IndexCatalog, DESCRIPTOR_FILENAME};
use config::IndexConfig;
use ptable::{FnCollaborators, IndexCollaborators, IndexEntry, IndexTable, TableVersion};
use tracing::info;

/// How long to wait for our own readers when closing tables.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

pub enum Query {
    Latest,
    Exact(i64),
    Range(i64, i64),
}

/// Collaborators for merges without a log: nothing is known to be dead and
/// only byte-identical entries count as duplicates.
fn offline() -> impl IndexCollaborators<StreamId = i64> {
    FnCollaborators::new(
        |_: &i64, old_hash| old_hash,
        |_: &IndexEntry| true,
        |entry: &IndexEntry| Some(entry.log_position),
    )
}

fn open_table(path: &Path, skip_verify: bool, config: &IndexConfig) -> Result<IndexTable> {
    IndexTable::open(path, skip_verify, &config.table)
        .with_context(|| format!("opening {}", path.display()))
}

fn open_catalog(dir: &Path, config: &IndexConfig) -> Result<IndexCatalog> {
    let descriptor = dir.join(DESCRIPTOR_FILENAME);
    if !descriptor.exists() {
        bail!("no catalog in {} (missing {})", dir.display(), DESCRIPTOR_FILENAME);
    }
    IndexCatalog::from_file(&descriptor, config)
        .with_context(|| format!("loading {}", descriptor.display()))
}

pub fn inspect(path: &Path, skip_verify: bool, config: &IndexConfig) -> Result<()> {
    let table = open_table(path, skip_verify, config)?;
    let digest = match (table.has_digest(), skip_verify) {
        (false, _) => "absent",
        (true, true) => "not checked",
        (true, false) => "ok",
    };
    println!("path:      {}", table.path().display());
    println!("version:   {}", table.version());
    println!("entries:   {}", table.count());
    println!("file size: {} bytes", table.file_size());
    println!("digest:    {}", digest);
    println!(
        "bloom:     {}",
        if table.has_bloom_filter() { "loaded" } else { "none" }
    );
    if !table.is_empty() {
        let mut reader = table.acquire_reader()?;
        let first = reader.read_entry(0)?;
        let last = reader.read_entry(table.count() - 1)?;
        println!("highest:   {}", first);
        println!("lowest:    {}", last);
    }
    table.mark_for_disposal();
    Ok(())
}

pub fn dump(path: &Path, reverse: bool, limit: Option<usize>, config: &IndexConfig) -> Result<()> {
    let table = open_table(path, config.skip_index_verify, config)?;
    let limit = limit.unwrap_or(usize::MAX);
    let mut printed = 0;
    {
        let reader = table.acquire_reader()?;
        let entries: Box<dyn Iterator<Item = ptable::Result<IndexEntry>> + '_> = if reverse {
            Box::new(reader.into_entries_rev())
        } else {
            Box::new(reader.into_entries())
        };
        for entry in entries.take(limit) {
            let entry = entry?;
            println!("{:#018x} {} {}", entry.stream_hash, entry.event_number, entry.log_position);
            printed += 1;
        }
    }
    println!("({} of {} entries)", printed, table.count());
    table.mark_for_disposal();
    Ok(())
}

pub fn levels(dir: &Path, config: &IndexConfig) -> Result<()> {
    let catalog = open_catalog(dir, config)?;
    println!(
        "checkpoint: prepare={} commit={}",
        catalog.prepare_checkpoint(),
        catalog.commit_checkpoint()
    );
    println!(
        "fan-out: {}  ceiling: {}",
        catalog.max_tables_per_level(),
        catalog.max_auto_merge_level()
    );
    for level in 0..catalog.level_count() {
        let tables = catalog.level(level);
        if tables.is_empty() {
            continue;
        }
        println!("L{:<3}{} table(s)", level, tables.len());
        for t in tables {
            let name = t.path().file_name().map(|n| n.to_string_lossy().into_owned());
            println!(
                "    {}  entries={}",
                name.unwrap_or_else(|| t.path().display().to_string()),
                t.count()
            );
        }
    }
    println!(
        "total: {} table(s), {} entries",
        catalog.table_count(),
        catalog.entry_count()
    );
    for orphan in catalog.orphaned_tables(dir)? {
        println!("orphan: {}", orphan.display());
    }
    catalog.dispose(CLOSE_TIMEOUT)?;
    Ok(())
}

pub fn lookup(dir: &Path, hash: u64, query: Query, config: &IndexConfig) -> Result<()> {
    let catalog = open_catalog(dir, config)?;
    let found = match query {
        Query::Latest => catalog.latest_entry(hash)?.into_iter().collect(),
        Query::Exact(event) => catalog.get(hash, event)?,
        Query::Range(from, to) => catalog.range(hash, from, to)?,
    };
    if found.is_empty() {
        println!("(not found)");
    }
    for entry in &found {
        println!("{}", entry);
    }
    catalog.dispose(CLOSE_TIMEOUT)?;
    Ok(())
}

pub fn merge(dir: &Path, config: IndexConfig) -> Result<()> {
    let descriptor = dir.join(DESCRIPTOR_FILENAME);
    if !descriptor.exists() {
        bail!("no catalog in {} (missing {})", dir.display(), DESCRIPTOR_FILENAME);
    }
    let mut writer = CatalogWriter::open(dir, config)?;
    let snapshot = writer.snapshot();
    if let Some((_, legacy)) = snapshot
        .tables()
        .find(|(_, t)| t.version() != TableVersion::CURRENT)
    {
        bail!(
            "{} is a {} table; upgrading hashes needs the log, refusing an offline merge",
            legacy.path().display(),
            legacy.version()
        );
    }
    let before = snapshot.level_sizes();
    drop(snapshot);

    if writer.try_manual_merge(&offline())? {
        let after = writer.snapshot().level_sizes();
        info!(?before, ?after, "offline manual merge done");
        println!("merged: {:?} -> {:?}", before, after);
    } else {
        println!("nothing to merge: {:?}", before);
    }
    writer.dispose(CLOSE_TIMEOUT)?;
    Ok(())
}
