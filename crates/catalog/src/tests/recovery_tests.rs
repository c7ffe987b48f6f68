use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::time::Duration;

use anyhow::Result;
use tempfile::tempdir;

use super::helpers::*;
use crate::recovery::cleanup_tmp_files;
use crate::*;

const DRAIN: Duration = Duration::from_secs(5);

/// Builds a catalog of `adds` single-entry tables under F=2, C=3 and saves
/// its descriptor.
fn saved_catalog(dir: &std::path::Path, adds: usize) -> Result<IndexCatalog> {
    let collab = keep_all();
    let mut fx = Fixture::new(dir);
    let mut catalog = IndexCatalog::new(&config(2, 3))?;
    for _ in 0..adds {
        catalog = apply(fx.add_one(&catalog, &collab)?);
    }
    catalog.save_to_file(&dir.join(DESCRIPTOR_FILENAME))?;
    Ok(catalog)
}

#[test]
fn save_and_reload_keeps_levels_and_checkpoints() -> Result<()> {
    let dir = tempdir()?;
    let original = saved_catalog(dir.path(), 5)?;
    let paths: Vec<_> = original
        .tables()
        .map(|(level, t)| (level, t.path().to_path_buf()))
        .collect();
    original.dispose(DRAIN)?;

    let loaded = IndexCatalog::from_file(&dir.path().join(DESCRIPTOR_FILENAME), &config(2, 3))?;
    // 5 = 0b101
    assert_eq!(loaded.level_sizes(), vec![1, 0, 1]);
    assert_eq!(loaded.prepare_checkpoint(), 50);
    assert_eq!(loaded.commit_checkpoint(), 50);
    let reloaded: Vec<_> = loaded
        .tables()
        .map(|(level, t)| (level, t.path().to_path_buf()))
        .collect();
    assert_eq!(reloaded, paths);
    assert_readable(&loaded, 1..=5)?;
    Ok(())
}

#[test]
fn empty_catalog_round_trips() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join(DESCRIPTOR_FILENAME);
    IndexCatalog::new(&config(2, 2))?.save_to_file(&path)?;

    let loaded = IndexCatalog::from_file(&path, &config(4, 1))?;
    assert_eq!(loaded.table_count(), 0);
    assert_eq!(loaded.prepare_checkpoint(), NO_CHECKPOINT);
    assert_eq!(loaded.max_tables_per_level(), 4);
    assert_eq!(loaded.max_auto_merge_level(), 1);
    Ok(())
}

#[test]
fn missing_table_fails_the_load() -> Result<()> {
    let dir = tempdir()?;
    let catalog = saved_catalog(dir.path(), 3)?;
    let victim = catalog.level(0)[0].path().to_path_buf();
    catalog.dispose(DRAIN)?;
    fs::remove_file(&victim)?;

    let err = IndexCatalog::from_file(&dir.path().join(DESCRIPTOR_FILENAME), &config(2, 3)).unwrap_err();
    match err {
        CatalogError::MissingTable(path) => assert_eq!(path, victim),
        other => panic!("expected MissingTable, got {other}"),
    }
    Ok(())
}

#[test]
fn corrupt_table_fails_unless_verification_is_skipped() -> Result<()> {
    let dir = tempdir()?;
    let catalog = saved_catalog(dir.path(), 1)?;
    let victim = catalog.level(0)[0].path().to_path_buf();
    catalog.dispose(DRAIN)?;

    // Flip the log position of the only entry; sizes stay intact.
    let mut f = OpenOptions::new().write(true).open(&victim)?;
    f.seek(SeekFrom::Start(ptable::HEADER_BYTES + 20))?;
    f.write_all(&[0x7f])?;
    drop(f);

    let descriptor = dir.path().join(DESCRIPTOR_FILENAME);
    let err = IndexCatalog::from_file(&descriptor, &config(2, 3)).unwrap_err();
    assert!(
        matches!(&err, CatalogError::Index(e) if e.is_corruption()),
        "{err}"
    );

    let mut cfg = config(2, 3);
    cfg.skip_index_verify = true;
    let loaded = IndexCatalog::from_file(&descriptor, &cfg)?;
    assert_eq!(loaded.table_count(), 1);
    Ok(())
}

#[test]
fn tampered_descriptor_fails_the_load() -> Result<()> {
    let dir = tempdir()?;
    saved_catalog(dir.path(), 2)?.dispose(DRAIN)?;
    let path = dir.path().join(DESCRIPTOR_FILENAME);
    let text = fs::read_to_string(&path)?;
    fs::write(&path, text.replace("checkpoint:20/20", "checkpoint:30/30"))?;

    let err = IndexCatalog::from_file(&path, &config(2, 3)).unwrap_err();
    assert!(matches!(err, CatalogError::CorruptDescriptor { .. }), "{err}");
    Ok(())
}

#[test]
fn invalid_config_is_rejected_before_reading() -> Result<()> {
    let dir = tempdir()?;
    let err = IndexCatalog::from_file(&dir.path().join("absent"), &config(1, 3)).unwrap_err();
    assert!(matches!(err, CatalogError::Config(_)), "{err}");
    Ok(())
}

#[test]
fn orphaned_tables_lists_unreferenced_files_only() -> Result<()> {
    let dir = tempdir()?;
    let catalog = saved_catalog(dir.path(), 2)?;
    assert!(catalog.orphaned_tables(dir.path())?.is_empty());

    let stray = dir.path().join("ptable-00000000000000009999-1.ptable");
    fs::write(&stray, b"not a table")?;
    fs::write(dir.path().join("notes.txt"), b"ignored")?;
    assert_eq!(catalog.orphaned_tables(dir.path())?, vec![stray]);
    Ok(())
}

#[test]
fn sidecar_without_its_table_is_an_orphan() -> Result<()> {
    let dir = tempdir()?;
    let catalog = saved_catalog(dir.path(), 2)?;
    let sidecar = dir.path().join("ptable-00000000000000009999-1.ptable.bloom");
    fs::write(&sidecar, b"left behind")?;
    assert_eq!(catalog.orphaned_tables(dir.path())?, vec![sidecar.clone()]);

    // Sidecars of live tables are not stranded.
    for (_, table) in catalog.tables() {
        assert!(ptable::bloom_path(table.path()).exists());
    }
    assert_eq!(cleanup_tmp_files(dir.path()), 1);
    assert!(!sidecar.exists());
    assert!(catalog.orphaned_tables(dir.path())?.is_empty());
    for (_, table) in catalog.tables() {
        assert!(ptable::bloom_path(table.path()).exists());
    }
    Ok(())
}

#[test]
fn cleanup_removes_only_temp_files() -> Result<()> {
    let dir = tempdir()?;
    fs::write(dir.path().join("ptable-1-1.ptable.tmp"), b"partial")?;
    fs::write(dir.path().join("indexmap.tmp"), b"partial")?;
    fs::write(dir.path().join("ptable-2-1.ptable"), b"keep")?;
    fs::write(dir.path().join("ptable-2-1.ptable.bloom.tmp"), b"partial")?;
    fs::write(dir.path().join("ptable-3-1.ptable.bloom"), b"stranded")?;

    assert_eq!(cleanup_tmp_files(dir.path()), 4);
    let left: Vec<_> = fs::read_dir(dir.path())?
        .map(|e| e.map(|e| e.file_name()))
        .collect::<std::io::Result<_>>()?;
    assert_eq!(left, vec![std::ffi::OsString::from("ptable-2-1.ptable")]);
    assert_eq!(cleanup_tmp_files(&dir.path().join("missing")), 0);
    Ok(())
}

#[test]
fn checkpoint_ahead_of_the_log_is_detected() -> Result<()> {
    let dir = tempdir()?;
    let catalog = saved_catalog(dir.path(), 3)?;
    assert!(catalog.ensure_within(30).is_ok());
    assert!(catalog.ensure_within(100).is_ok());
    match catalog.ensure_within(29) {
        Err(CatalogError::CheckpointAhead { catalog, log }) => {
            assert_eq!((catalog, log), (30, 29));
        }
        other => panic!("expected CheckpointAhead, got {other:?}"),
    }
    Ok(())
}

#[test]
fn dispose_keeps_files_and_waits_for_readers() -> Result<()> {
    let dir = tempdir()?;
    let catalog = saved_catalog(dir.path(), 3)?;
    let busy = std::sync::Arc::clone(&catalog.level(0)[0]);
    let reader = busy.acquire_reader()?;

    let err = catalog.dispose(Duration::from_millis(50)).unwrap_err();
    assert!(
        matches!(err, CatalogError::DrainTimeout { pending: 1, .. }),
        "{err}"
    );
    assert!(!busy.is_destroyed());

    drop(reader);
    assert!(busy.is_destroyed());
    for (_, t) in catalog.tables() {
        assert!(t.is_destroyed());
        assert!(t.path().exists());
    }
    Ok(())
}

#[test]
fn dispose_accepts_an_unbounded_timeout() -> Result<()> {
    let dir = tempdir()?;
    let catalog = saved_catalog(dir.path(), 3)?;
    catalog.dispose(Duration::MAX)?;
    for (_, t) in catalog.tables() {
        assert!(t.is_destroyed());
    }
    // Already disposed: the second wait returns at once.
    catalog.dispose(Duration::MAX)?;
    Ok(())
}
