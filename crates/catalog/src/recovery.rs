use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use config::IndexConfig;
use ptable::{IndexTable, BLOOM_SUFFIX, TMP_SUFFIX};
use tracing::{info, warn};

use crate::descriptor::{Descriptor, TableMeta};
use crate::error::{CatalogError, Result};
use crate::filenames::is_table_file;
use crate::IndexCatalog;

impl IndexCatalog {
    /// Writes the descriptor for this snapshot to `path`.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new(""));
        let tables = self
            .tables()
            .map(|(level, t)| TableMeta {
                level,
                filename: Descriptor::table_reference(dir, t.path()),
            })
            .collect();
        Descriptor {
            prepare_checkpoint: self.prepare_checkpoint,
            commit_checkpoint: self.commit_checkpoint,
            tables,
        }
        .save(path)
    }

    /// Loads the catalog described by the descriptor at `path` and opens
    /// every table it references.
    ///
    /// Fan-out and ceiling come from `config`, not from the file: tables keep
    /// their recorded levels, and the next mutation cascades them under the
    /// new rules. Digests are verified unless `config.skip_index_verify`.
    ///
    /// # Errors
    ///
    /// - [`CatalogError::CorruptDescriptor`] if the descriptor is damaged.
    /// - [`CatalogError::MissingTable`] if a referenced file is gone.
    /// - Any table open error, e.g. a corrupt table.
    pub fn from_file(path: &Path, config: &IndexConfig) -> Result<Self> {
        config.validate()?;
        let descriptor = Descriptor::load(path)?;
        let dir = path.parent().unwrap_or_else(|| Path::new(""));

        let mut catalog = Self::new(config)?;
        catalog.prepare_checkpoint = descriptor.prepare_checkpoint;
        catalog.commit_checkpoint = descriptor.commit_checkpoint;

        for meta in &descriptor.tables {
            let table_path = Descriptor::table_path(dir, &meta.filename);
            let table = match IndexTable::open(&table_path, config.skip_index_verify, &config.table) {
                Ok(t) => t,
                Err(e) => {
                    // Close what was opened so far.
                    for (_, t) in catalog.tables() {
                        t.mark_for_disposal();
                    }
                    return Err(match e {
                        ptable::IndexError::Io(io) if io.kind() == io::ErrorKind::NotFound => {
                            CatalogError::MissingTable(table_path)
                        }
                        other => other.into(),
                    });
                }
            };
            if catalog.levels.len() <= meta.level {
                catalog.levels.resize_with(meta.level + 1, Vec::new);
            }
            catalog.levels[meta.level].push(Arc::new(table));
        }
        while catalog.levels.last().is_some_and(Vec::is_empty) {
            catalog.levels.pop();
        }

        info!(
            path = %path.display(),
            tables = catalog.table_count(),
            levels = ?catalog.level_sizes(),
            verified = !config.skip_index_verify,
            "catalog loaded"
        );
        Ok(catalog)
    }

    /// Table files in `dir` that this catalog does not reference, plus bloom
    /// sidecars whose table is missing. They are never deleted here.
    pub fn orphaned_tables(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let referenced: HashSet<PathBuf> = self
            .tables()
            .map(|(_, t)| t.path().to_path_buf())
            .collect();
        let mut orphans: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                (is_table_file(p) && !referenced.contains(p)) || stranded_sidecar(p).is_some()
            })
            .collect();
        orphans.sort();
        Ok(orphans)
    }
}

/// The table a bloom sidecar at `path` belongs to, if that table is missing.
/// A crash between saving the sidecar and renaming the table leaves one.
fn stranded_sidecar(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    let table = path.with_file_name(name.strip_suffix(BLOOM_SUFFIX)?);
    (is_table_file(&table) && !table.exists()).then_some(table)
}

/// Removes leftover `*.tmp` files from interrupted table or descriptor
/// writes, and bloom sidecars whose table never appeared. Returns how many
/// were removed.
pub(crate) fn cleanup_tmp_files(dir: &Path) -> usize {
    let mut removed = 0;
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let p = entry.path();
            let is_tmp = p
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(TMP_SUFFIX));
            if !is_tmp && stranded_sidecar(&p).is_none() {
                continue;
            }
            match fs::remove_file(&p) {
                Ok(()) => {
                    info!(path = %p.display(), "removed leftover temp file");
                    removed += 1;
                }
                Err(e) => warn!(path = %p.display(), error = %e, "failed to remove temp file"),
            }
        }
    }
    removed
}
