use std::path::Path;

use anyhow::Result;
use md5::{Digest, Md5};
use tempfile::tempdir;

use crate::descriptor::{Descriptor, TableMeta};
use crate::CatalogError;

fn sample() -> Descriptor {
    Descriptor {
        prepare_checkpoint: 4096,
        commit_checkpoint: 4000,
        tables: vec![
            TableMeta {
                level: 0,
                filename: "ptable-00000000000000000012-1.ptable".to_string(),
            },
            TableMeta {
                level: 0,
                filename: "ptable-00000000000000000011-1.ptable".to_string(),
            },
            TableMeta {
                level: 3,
                filename: "/elsewhere/ptable-00000000000000000004-1.ptable".to_string(),
            },
        ],
    }
}

fn assert_corrupt(text: &str) {
    match Descriptor::parse(Path::new("indexmap"), text) {
        Err(CatalogError::CorruptDescriptor { .. }) => {}
        other => panic!("expected a corrupt descriptor, got {other:?}"),
    }
}

/// Appends a freshly computed digest to `body`.
fn sealed(body: &str) -> String {
    let digest: String = Md5::digest(body.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();
    format!("{body}digest:{digest}\n")
}

#[test]
fn render_then_parse_round_trips() -> Result<()> {
    let d = sample();
    let parsed = Descriptor::parse(Path::new("indexmap"), &d.render())?;
    assert_eq!(parsed, d);
    Ok(())
}

#[test]
fn rendered_text_is_readable() {
    let text = sample().render();
    assert!(text.contains("version:1\n"));
    assert!(text.contains("checkpoint:4096/4000\n"));
    assert!(text.contains("L3:/elsewhere/ptable-00000000000000000004-1.ptable\n"));
    assert!(text.lines().last().is_some_and(|l| l.starts_with("digest:")));
}

#[test]
fn save_and_load_through_disk() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("indexmap");
    sample().save(&path)?;
    assert_eq!(Descriptor::load(&path)?, sample());
    assert!(!dir.path().join("indexmap.tmp").exists());

    // Overwrite is atomic and complete.
    let empty = Descriptor {
        prepare_checkpoint: 1,
        commit_checkpoint: 1,
        tables: Vec::new(),
    };
    empty.save(&path)?;
    assert_eq!(Descriptor::load(&path)?, empty);
    Ok(())
}

#[test]
fn any_edit_breaks_the_digest() {
    let text = sample().render();
    assert_corrupt(&text.replace("checkpoint:4096/4000", "checkpoint:4097/4000"));
    assert_corrupt(&text.replace("L3:", "L2:"));
}

#[test]
fn missing_digest_is_corrupt() {
    let text = sample().render();
    let without: String = text
        .lines()
        .filter(|l| !l.starts_with("digest:"))
        .map(|l| format!("{l}\n"))
        .collect();
    assert_corrupt(&without);
    assert_corrupt("");
}

#[test]
fn digest_alone_does_not_make_garbage_valid() {
    assert_corrupt(&sealed("version:1\n"));
    assert_corrupt(&sealed("checkpoint:1/1\n"));
    assert_corrupt(&sealed("version:2\ncheckpoint:1/1\n"));
    assert_corrupt(&sealed("version:1\ncheckpoint:1\n"));
    assert_corrupt(&sealed("version:1\ncheckpoint:1/1\nL65:x.ptable\n"));
    assert_corrupt(&sealed("version:1\ncheckpoint:1/1\nLx:x.ptable\n"));
    assert_corrupt(&sealed("version:1\ncheckpoint:1/1\nL0:\n"));
    assert_corrupt(&sealed("version:1\ncheckpoint:1/1\nbogus:1\n"));
    assert_corrupt(&sealed("version:1\ncheckpoint:1/1\nno separator\n"));
}

#[test]
fn comments_and_blank_lines_are_ignored() -> Result<()> {
    let text = sealed("# hand written\n\nversion:1\ncheckpoint:-1/-1\n\nL2:b.ptable\nL0:a.ptable\n");
    let d = Descriptor::parse(Path::new("indexmap"), &text)?;
    assert_eq!(d.prepare_checkpoint, -1);
    // Sorted by level, order within a level kept.
    let levels: Vec<usize> = d.tables.iter().map(|t| t.level).collect();
    assert_eq!(levels, vec![0, 2]);
    Ok(())
}

#[test]
fn table_references_are_relative_inside_the_directory() {
    let dir = Path::new("/data/index");
    assert_eq!(
        Descriptor::table_reference(dir, Path::new("/data/index/a.ptable")),
        "a.ptable"
    );
    assert_eq!(
        Descriptor::table_reference(dir, Path::new("/other/b.ptable")),
        "/other/b.ptable"
    );
    assert_eq!(
        Descriptor::table_path(dir, "a.ptable"),
        Path::new("/data/index/a.ptable")
    );
    assert_eq!(
        Descriptor::table_path(dir, "/other/b.ptable"),
        Path::new("/other/b.ptable")
    );
}
