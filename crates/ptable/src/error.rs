//! Error type shared by every index table operation.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while writing, opening, reading or retiring an index table.
#[derive(Debug, Error)]
pub enum IndexError {
    /// An underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The file does not match what was written: digest mismatch, bad magic,
    /// unexpected size, or a read that ran off the end of the data.
    #[error("corrupt index table {}: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },

    /// Input that cannot be turned into a table (e.g. an empty staging
    /// snapshot, or an entry the target version cannot represent).
    #[error("invalid table input: {0}")]
    Format(String),

    /// A caller-supplied argument was rejected before any work happened.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A reader was requested after the table's file was released.
    #[error("index table {} has been destroyed", .0.display())]
    TableDeleted(PathBuf),

    /// Readers did not drain within the allotted time. The table is intact.
    #[error("timed out after {timeout:?} waiting for readers of {} to drain", .path.display())]
    Timeout { path: PathBuf, timeout: Duration },
}

impl IndexError {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` for integrity failures (as opposed to I/O or usage errors).
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }

    /// Returns `true` if the error only reports an expired drain wait.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = IndexError> = std::result::Result<T, E>;
