use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tempfile::tempdir;

use super::helpers::*;
use crate::*;

/// Collaborators for a log where every entry is live and the stream of an
/// entry is looked up by log position.
fn log_with_streams(
    streams: HashMap<i64, &'static str>,
) -> impl IndexCollaborators<StreamId = &'static str> {
    FnCollaborators::new(
        |stream: &&'static str, _old| 0xAB00 + stream.len() as u64,
        |_: &IndexEntry| true,
        move |entry: &IndexEntry| streams.get(&entry.log_position).copied(),
    )
}

fn keep_everything() -> impl IndexCollaborators<StreamId = i64> {
    FnCollaborators::new(
        |_: &i64, old| old,
        |_: &IndexEntry| true,
        |entry: &IndexEntry| Some(entry.log_position),
    )
}

// -------------------- Basic merge --------------------

#[test]
fn merge_produces_ordered_union() -> Result<()> {
    let dir = tempdir()?;
    let a = write_table(dir.path(), "a.ptable", &[(1, 0, 10), (3, 0, 30)])?;
    let b = write_table(dir.path(), "b.ptable", &[(2, 0, 20), (4, 0, 40)])?;

    let merged = IndexTable::from_merge(
        &[a, b],
        dir.path().join("m.ptable"),
        &keep_everything(),
        TableVersion::V2,
        false,
        &test_config(),
    )?;
    assert!(merged.has_digest());
    assert_eq!(
        all_entries(&merged)?,
        vec![e(4, 0, 40), e(3, 0, 30), e(2, 0, 20), e(1, 0, 10)]
    );
    Ok(())
}

#[test]
fn merge_needs_two_inputs() -> Result<()> {
    let dir = tempdir()?;
    let a = write_table(dir.path(), "a.ptable", &[(1, 0, 10)])?;
    let err = IndexTable::from_merge(
        &[a],
        dir.path().join("m.ptable"),
        &keep_everything(),
        TableVersion::V2,
        false,
        &test_config(),
    )
    .unwrap_err();
    assert!(matches!(err, IndexError::InvalidArgument(_)));
    Ok(())
}

#[test]
fn dead_entries_are_dropped() -> Result<()> {
    let dir = tempdir()?;
    let a = write_table(dir.path(), "a.ptable", &[(1, 0, 10), (1, 1, 11)])?;
    let b = write_table(dir.path(), "b.ptable", &[(2, 0, 5), (2, 1, 12)])?;

    // Everything before position 11 has been scavenged.
    let collab = FnCollaborators::new(
        |_: &i64, old| old,
        |entry: &IndexEntry| entry.log_position >= 11,
        |entry: &IndexEntry| Some(entry.log_position),
    );
    let merged = IndexTable::from_merge(
        &[a, b],
        dir.path().join("m.ptable"),
        &collab,
        TableVersion::V2,
        false,
        &test_config(),
    )?;
    assert_eq!(all_entries(&merged)?, vec![e(2, 1, 12), e(1, 1, 11)]);
    Ok(())
}

#[test]
fn nothing_live_gives_an_empty_table() -> Result<()> {
    let dir = tempdir()?;
    let a = write_table(dir.path(), "a.ptable", &[(1, 0, 10)])?;
    let b = write_table(dir.path(), "b.ptable", &[(2, 0, 20)])?;
    let collab = FnCollaborators::new(
        |_: &i64, old| old,
        |_: &IndexEntry| false,
        |entry: &IndexEntry| Some(entry.log_position),
    );
    let merged = IndexTable::from_merge(
        &[a, b],
        dir.path().join("m.ptable"),
        &collab,
        TableVersion::V2,
        false,
        &test_config(),
    )?;
    assert!(merged.is_empty());
    assert!(merged.get(1, 0)?.is_empty());
    Ok(())
}

// -------------------- Duplicates & collisions --------------------

#[test]
fn duplicates_keep_the_newest_input() -> Result<()> {
    let dir = tempdir()?;
    // Same stream re-indexed at a new position in the newer table.
    let newer = write_table(dir.path(), "new.ptable", &[(7, 3, 700)])?;
    let older = write_table(dir.path(), "old.ptable", &[(7, 3, 300)])?;

    let collab = log_with_streams(HashMap::from([(700, "orders"), (300, "orders")]));
    let merged = IndexTable::from_merge(
        &[newer, older],
        dir.path().join("m.ptable"),
        &collab,
        TableVersion::V2,
        false,
        &test_config(),
    )?;
    assert_eq!(merged.get(7, 3)?, vec![e(7, 3, 700)]);
    Ok(())
}

#[test]
fn collisions_are_all_retained() -> Result<()> {
    let dir = tempdir()?;
    let a = write_table(dir.path(), "a.ptable", &[(7, 3, 100), (5, 0, 50)])?;
    let b = write_table(dir.path(), "b.ptable", &[(7, 3, 200)])?;

    let collab = log_with_streams(HashMap::from([(100, "orders"), (200, "users")]));
    let merged = IndexTable::from_merge(
        &[a, b],
        dir.path().join("m.ptable"),
        &collab,
        TableVersion::V2,
        false,
        &test_config(),
    )?;
    assert_eq!(merged.get(7, 3)?, vec![e(7, 3, 200), e(7, 3, 100)]);
    assert_eq!(merged.count(), 3);
    Ok(())
}

#[test]
fn unresolvable_colliding_entries_are_dropped() -> Result<()> {
    let dir = tempdir()?;
    let a = write_table(dir.path(), "a.ptable", &[(7, 3, 100)])?;
    let b = write_table(dir.path(), "b.ptable", &[(7, 3, 200)])?;

    // Position 200 no longer holds a record.
    let collab = log_with_streams(HashMap::from([(100, "orders")]));
    let merged = IndexTable::from_merge(
        &[a, b],
        dir.path().join("m.ptable"),
        &collab,
        TableVersion::V2,
        false,
        &test_config(),
    )?;
    assert_eq!(all_entries(&merged)?, vec![e(7, 3, 100)]);
    Ok(())
}

#[test]
fn merge_is_order_sensitive_only_for_duplicates() -> Result<()> {
    let dir = tempdir()?;
    let collab = log_with_streams(HashMap::from([(1, "s"), (2, "s")]));

    let x = Arc::new(write_table(dir.path(), "x.ptable", &[(9, 0, 1)])?);
    let y = Arc::new(write_table(dir.path(), "y.ptable", &[(9, 0, 2)])?);

    let xy = IndexTable::from_merge(
        &[Arc::clone(&x), Arc::clone(&y)],
        dir.path().join("xy.ptable"),
        &collab,
        TableVersion::V2,
        false,
        &test_config(),
    )?;
    let yx = IndexTable::from_merge(
        &[y, x],
        dir.path().join("yx.ptable"),
        &collab,
        TableVersion::V2,
        false,
        &test_config(),
    )?;
    assert_eq!(all_entries(&xy)?, vec![e(9, 0, 1)]);
    assert_eq!(all_entries(&yx)?, vec![e(9, 0, 2)]);
    Ok(())
}

// -------------------- Format upgrade --------------------

#[test]
fn v1_inputs_are_rehashed_and_resorted() -> Result<()> {
    let dir = tempdir()?;
    let v1 = write_versioned(
        dir.path(),
        "v1.ptable",
        TableVersion::V1,
        &[(5, 0, 10), (5, 1, 11), (9, 0, 12)],
    )?;
    let v2 = write_table(dir.path(), "v2.ptable", &[(0x1_0000_0000, 0, 13)])?;

    let streams: HashMap<i64, &'static str> =
        HashMap::from([(10, "alpha"), (11, "alpha"), (12, "b")]);
    let collab = FnCollaborators::new(
        |stream: &&'static str, _old| match *stream {
            "alpha" => 1,
            _ => 0xFFFF_FFFF_FFFF,
        },
        |_: &IndexEntry| true,
        move |entry: &IndexEntry| streams.get(&entry.log_position).copied(),
    );
    let merged = IndexTable::from_merge(
        &[v2, v1],
        dir.path().join("m.ptable"),
        &collab,
        TableVersion::V2,
        false,
        &test_config(),
    )?;
    assert_eq!(merged.version(), TableVersion::V2);
    assert_eq!(
        all_entries(&merged)?,
        vec![
            e(0xFFFF_FFFF_FFFF, 0, 12),
            e(0x1_0000_0000, 0, 13),
            e(1, 1, 11),
            e(1, 0, 10),
        ]
    );
    Ok(())
}

#[test]
fn upgrade_drops_records_that_no_longer_exist() -> Result<()> {
    let dir = tempdir()?;
    let v1 = write_versioned(dir.path(), "v1.ptable", TableVersion::V1, &[(5, 0, 10), (6, 0, 20)])?;
    let v1b = write_versioned(dir.path(), "v1b.ptable", TableVersion::V1, &[(7, 0, 30)])?;
    let collab = log_with_streams(HashMap::from([(10, "abc"), (30, "abcd")]));
    let merged = IndexTable::from_merge(
        &[v1, v1b],
        dir.path().join("m.ptable"),
        &collab,
        TableVersion::V2,
        false,
        &test_config(),
    )?;
    // "abcd" and "abc" rehash to 0xAB04 and 0xAB03; position 20 is gone.
    assert_eq!(all_entries(&merged)?, vec![e(0xAB04, 0, 30), e(0xAB03, 0, 10)]);
    Ok(())
}

#[test]
fn v2_inputs_cannot_be_downgraded() -> Result<()> {
    let dir = tempdir()?;
    let a = write_table(dir.path(), "a.ptable", &[(1, 0, 10)])?;
    let b = write_table(dir.path(), "b.ptable", &[(2, 0, 20)])?;
    let err = IndexTable::from_merge(
        &[a, b],
        dir.path().join("m.ptable"),
        &keep_everything(),
        TableVersion::V1,
        false,
        &test_config(),
    )
    .unwrap_err();
    assert!(matches!(err, IndexError::InvalidArgument(_)));
    assert!(!dir.path().join("m.ptable").exists());
    Ok(())
}

#[test]
fn merge_inputs_stay_readable_and_unleased() -> Result<()> {
    let dir = tempdir()?;
    let a = Arc::new(write_table(dir.path(), "a.ptable", &[(1, 0, 10)])?);
    let b = Arc::new(write_table(dir.path(), "b.ptable", &[(2, 0, 20)])?);
    let inputs = vec![Arc::clone(&a), Arc::clone(&b)];
    let merged = IndexTable::from_merge(
        &inputs,
        dir.path().join("m.ptable"),
        &keep_everything(),
        TableVersion::V2,
        true,
        &test_config(),
    )?;
    assert!(!merged.has_digest());
    assert_eq!(a.active_readers(), 0);
    assert_eq!(b.active_readers(), 0);
    assert_eq!(a.get(1, 0)?, vec![e(1, 0, 10)]);
    Ok(())
}
