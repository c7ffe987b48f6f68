//! # Descriptor - persisted catalog state
//!
//! Records the checkpoints and which table file sits on which level, so the
//! catalog can be rebuilt after a restart.
//!
//! ## File Format
//!
//! A small text file, one table per line, newest first within a level:
//!
//! ```text
//! # index catalog descriptor
//! version:1
//! checkpoint:4096/4096
//! L0:ptable-00000000000000000012-1708600002000.ptable
//! L1:ptable-00000000000000000009-1708600001000.ptable
//! L2:ptable-00000000000000000004-1708600000000.ptable
//! digest:9e107d9d372bb6826bd81d3542a419d6
//! ```
//!
//! Lines starting with `#` and empty lines are ignored. The last line is the
//! MD5 of every byte before it; any edit without updating it makes the
//! descriptor unreadable. Table names are relative to the descriptor's
//! directory unless written as absolute paths.
//!
//! ## Crash Safety
//!
//! The descriptor is rewritten atomically: write to a `.tmp` file, fsync,
//! then rename over the existing one.

use md5::{Digest, Md5};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{CatalogError, Result};

/// Default descriptor name inside a catalog directory.
pub const DESCRIPTOR_FILENAME: &str = "indexmap";

/// Highest level a descriptor may reference.
pub const MAX_LEVEL: usize = 64;

const FORMAT_VERSION: u32 = 1;

/// One table reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMeta {
    pub level: usize,
    /// As written in the descriptor: a bare name or an absolute path.
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Descriptor {
    pub prepare_checkpoint: i64,
    pub commit_checkpoint: i64,
    /// Ordered by level, newest first within a level.
    pub tables: Vec<TableMeta>,
}

impl Descriptor {
    /// Resolves a table reference against the descriptor's directory.
    pub fn table_path(dir: &Path, filename: &str) -> PathBuf {
        let p = Path::new(filename);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            dir.join(p)
        }
    }

    /// How a table at `table_path` is referenced from a descriptor in `dir`.
    pub fn table_reference(dir: &Path, table_path: &Path) -> String {
        match (table_path.parent(), table_path.file_name()) {
            (Some(parent), Some(name)) if parent == dir => name.to_string_lossy().into_owned(),
            _ => table_path.display().to_string(),
        }
    }

    pub fn render(&self) -> String {
        let mut body = String::new();
        body.push_str("# index catalog descriptor\n");
        body.push_str("# Format: L<level>:<filename>, newest first\n");
        body.push_str(&format!("version:{}\n", FORMAT_VERSION));
        body.push_str(&format!(
            "checkpoint:{}/{}\n",
            self.prepare_checkpoint, self.commit_checkpoint
        ));
        for t in &self.tables {
            body.push_str(&format!("L{}:{}\n", t.level, t.filename));
        }
        let digest = hex(&Md5::digest(body.as_bytes()));
        body.push_str(&format!("digest:{}\n", digest));
        body
    }

    /// Parses descriptor text. `path` is only used in error messages.
    pub fn parse(path: &Path, text: &str) -> Result<Self> {
        let body_end = text
            .trim_end_matches('\n')
            .rfind('\n')
            .map(|i| i + 1)
            .unwrap_or(0);
        let (body, last) = text.split_at(body_end);
        let stored = last
            .trim()
            .strip_prefix("digest:")
            .ok_or_else(|| CatalogError::corrupt(path, "missing digest line"))?;
        if stored != hex(&Md5::digest(body.as_bytes())) {
            return Err(CatalogError::corrupt(path, "digest mismatch"));
        }

        let mut version = None;
        let mut checkpoints = None;
        let mut tables = Vec::new();
        for (line_num, line) in body.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let bad = |what: &str| {
                CatalogError::corrupt(
                    path,
                    format!("line {}: {}: {}", line_num + 1, what, trimmed),
                )
            };
            let (tag, value) = trimmed
                .split_once(':')
                .ok_or_else(|| bad("expected '<tag>:<value>'"))?;
            match tag {
                "version" => {
                    let v: u32 = value.parse().map_err(|_| bad("bad version"))?;
                    if v != FORMAT_VERSION {
                        return Err(bad("unsupported descriptor version"));
                    }
                    version = Some(v);
                }
                "checkpoint" => {
                    let (p, c) = value
                        .split_once('/')
                        .ok_or_else(|| bad("expected '<prepare>/<commit>'"))?;
                    let p: i64 = p.parse().map_err(|_| bad("bad prepare checkpoint"))?;
                    let c: i64 = c.parse().map_err(|_| bad("bad commit checkpoint"))?;
                    checkpoints = Some((p, c));
                }
                level if level.starts_with('L') => {
                    let level: usize = level[1..].parse().map_err(|_| bad("bad level"))?;
                    if level > MAX_LEVEL {
                        return Err(bad("level out of range"));
                    }
                    if value.is_empty() {
                        return Err(bad("empty filename"));
                    }
                    tables.push(TableMeta {
                        level,
                        filename: value.to_string(),
                    });
                }
                _ => return Err(bad("unknown tag")),
            }
        }

        if version.is_none() {
            return Err(CatalogError::corrupt(path, "missing version line"));
        }
        let (prepare_checkpoint, commit_checkpoint) =
            checkpoints.ok_or_else(|| CatalogError::corrupt(path, "missing checkpoint line"))?;
        tables.sort_by_key(|t| t.level);
        Ok(Self {
            prepare_checkpoint,
            commit_checkpoint,
            tables,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let descriptor = Self::parse(path, &text)?;
        debug!(
            path = %path.display(),
            tables = descriptor.tables.len(),
            "catalog descriptor loaded"
        );
        Ok(descriptor)
    }

    /// Writes the descriptor atomically (temp file, fsync, rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            f.write_all(self.render().as_bytes())?;
            f.sync_all()?;
        }
        if let Err(e) = fs::rename(&tmp_path, path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        debug!(path = %path.display(), tables = self.tables.len(), "catalog descriptor saved");
        Ok(())
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
