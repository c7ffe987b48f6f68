use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use tempfile::tempdir;

use super::helpers::*;
use crate::*;

#[test]
fn deletion_waits_for_the_last_reader() -> Result<()> {
    let dir = tempdir()?;
    let table = write_table(dir.path(), "d.ptable", &[(1, 0, 10), (2, 0, 20)])?;
    let path = table.path().to_path_buf();

    let reader = table.acquire_reader()?;
    table.mark_for_deletion();
    assert!(table.is_marked_for_deletion());
    assert!(path.exists());

    let err = table.wait_for_destroy(Duration::from_millis(20)).unwrap_err();
    assert!(err.is_timeout());
    // The table is still fully usable after a timed-out wait.
    assert_eq!(table.active_readers(), 1);
    assert!(path.exists());

    drop(reader);
    table.wait_for_destroy(Duration::from_secs(5))?;
    assert!(table.is_destroyed());
    assert!(!path.exists());
    assert!(!bloom_path(&path).exists());
    Ok(())
}

#[test]
fn unbounded_wait_returns_once_destroyed() -> Result<()> {
    let dir = tempdir()?;
    let table = write_table(dir.path(), "w.ptable", &[(1, 0, 10)])?;
    table.mark_for_deletion();
    table.wait_for_destroy(Duration::MAX)?;
    assert!(table.is_destroyed());
    // Repeating the wait on a destroyed table is immediate.
    table.wait_for_destroy(Duration::MAX)?;
    Ok(())
}

#[test]
fn no_new_readers_after_destruction() -> Result<()> {
    let dir = tempdir()?;
    let table = write_table(dir.path(), "n.ptable", &[(1, 0, 10)])?;
    table.mark_for_deletion();
    table.wait_for_destroy(Duration::from_secs(1))?;
    assert!(matches!(
        table.acquire_reader(),
        Err(IndexError::TableDeleted(_))
    ));
    assert!(matches!(table.get(1, 0), Err(IndexError::TableDeleted(_))));
    Ok(())
}

#[test]
fn marked_table_still_serves_new_readers_until_drained() -> Result<()> {
    let dir = tempdir()?;
    let table = write_table(dir.path(), "m.ptable", &[(1, 0, 10)])?;
    let first = table.acquire_reader()?;
    table.mark_for_deletion();
    // Teardown has not started, so a racing lookup still succeeds.
    assert_eq!(table.get(1, 0)?, vec![e(1, 0, 10)]);
    drop(first);
    table.wait_for_destroy(Duration::from_secs(1))?;
    Ok(())
}

#[test]
fn disposal_keeps_the_file() -> Result<()> {
    let dir = tempdir()?;
    let table = write_table(dir.path(), "k.ptable", &[(1, 0, 10)])?;
    let path = table.path().to_path_buf();
    table.mark_for_disposal();
    table.wait_for_destroy(Duration::from_secs(1))?;
    assert!(table.is_destroyed());
    assert!(path.exists());

    // Superseding a table that was already released still removes it.
    table.mark_for_deletion();
    assert!(!path.exists());
    assert!(!bloom_path(&path).exists());
    Ok(())
}

#[test]
fn marking_is_idempotent() -> Result<()> {
    let dir = tempdir()?;
    let table = write_table(dir.path(), "i.ptable", &[(1, 0, 10)])?;
    table.mark_for_deletion();
    table.mark_for_deletion();
    table.mark_for_disposal();
    table.wait_for_destroy(Duration::from_secs(1))?;
    assert!(!table.path().exists());
    Ok(())
}

#[test]
fn iterator_holds_the_lease() -> Result<()> {
    let dir = tempdir()?;
    let table = write_table(dir.path(), "it.ptable", &[(3, 0, 1), (2, 0, 2), (1, 0, 3)])?;
    let mut iter = table.acquire_reader()?.into_entries();
    assert_eq!(iter.next().transpose()?, Some(e(3, 0, 1)));

    table.mark_for_deletion();
    assert!(table.path().exists());
    assert_eq!(iter.next().transpose()?, Some(e(2, 0, 2)));
    drop(iter);
    assert!(!table.path().exists());
    Ok(())
}

#[test]
fn concurrent_readers_and_deletion() -> Result<()> {
    let dir = tempdir()?;
    let table = Arc::new(write_table(
        dir.path(),
        "race.ptable",
        &[(1, 0, 10), (2, 0, 20), (3, 0, 30)],
    )?);
    let path = table.path().to_path_buf();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let table = Arc::clone(&table);
        handles.push(thread::spawn(move || {
            let mut ok = 0;
            for _ in 0..200 {
                match table.get(2, 0) {
                    Ok(found) => {
                        assert_eq!(found, vec![IndexEntry::new(2, 0, 20)]);
                        ok += 1;
                    }
                    Err(IndexError::TableDeleted(_)) => break,
                    Err(other) => panic!("unexpected error: {}", other),
                }
            }
            ok
        }));
    }
    thread::sleep(Duration::from_millis(5));
    table.mark_for_deletion();
    for h in handles {
        h.join().unwrap();
    }
    table.wait_for_destroy(Duration::from_secs(5))?;
    assert!(!path.exists());
    Ok(())
}
