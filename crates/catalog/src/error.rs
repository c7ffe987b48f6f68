//! Errors raised by catalog operations.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use config::ConfigError;
use ptable::IndexError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    /// A table could not be written, opened or read.
    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The descriptor failed to parse or its digest does not match.
    #[error("corrupt catalog descriptor {}: {reason}", .path.display())]
    CorruptDescriptor { path: PathBuf, reason: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The descriptor references a table file that does not exist.
    #[error("table {} referenced by the catalog is missing", .0.display())]
    MissingTable(PathBuf),

    /// The catalog claims to index more of the log than the log holds.
    #[error("catalog checkpoint {catalog} is ahead of the log checkpoint {log}")]
    CheckpointAhead { catalog: i64, log: i64 },

    /// Some tables still had readers when the dispose wait expired.
    #[error("{pending} table(s) still had active readers after {timeout:?}")]
    DrainTimeout { pending: usize, timeout: Duration },
}

impl CatalogError {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CorruptDescriptor {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` if a lookup hit a table torn down under it, which a
    /// retry on a newer snapshot resolves.
    #[must_use]
    pub fn is_table_deleted(&self) -> bool {
        matches!(self, Self::Index(IndexError::TableDeleted(_)))
    }
}

pub type Result<T, E = CatalogError> = std::result::Result<T, E>;
