//! Bounded pool of read handles onto one table file.
//!
//! A table is read concurrently by many lookups. Each lookup takes one
//! buffered handle out of the pool, seeks freely, and puts it back. The pool
//! opens `initial` handles eagerly and keeps up to `max`. Past that, callers
//! get a transient handle that is closed when returned, so a thread already
//! holding leases can always take another.

use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{IndexError, Result};

/// A buffered read handle, either owned by the pool or opened past its bound.
#[derive(Debug)]
pub(crate) struct Handle {
    reader: BufReader<File>,
    transient: bool,
}

impl Handle {
    fn open(path: &Path, transient: bool) -> io::Result<Self> {
        Ok(Self {
            reader: BufReader::new(File::open(path)?),
            transient,
        })
    }
}

impl Read for Handle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for Handle {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.reader.seek(pos)
    }
}

#[derive(Debug)]
struct PoolState {
    free: Vec<Handle>,
    /// Pooled handles currently alive (free or checked out).
    opened: usize,
    closed: bool,
}

#[derive(Debug)]
pub(crate) struct ReaderPool {
    path: PathBuf,
    max: usize,
    state: Mutex<PoolState>,
}

impl ReaderPool {
    pub(crate) fn open(path: &Path, initial: usize, max: usize) -> Result<Self> {
        let max = max.max(1);
        let initial = initial.clamp(1, max);
        let mut free = Vec::with_capacity(initial);
        for _ in 0..initial {
            free.push(Handle::open(path, false)?);
        }
        Ok(Self {
            path: path.to_path_buf(),
            max,
            state: Mutex::new(PoolState {
                free,
                opened: initial,
                closed: false,
            }),
        })
    }

    /// Takes a handle: an idle one, a new pooled one while under `max`, or
    /// a transient one. Never waits for another lease to be returned.
    pub(crate) fn take(&self) -> Result<Handle> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(IndexError::TableDeleted(self.path.clone()));
        }
        if let Some(h) = state.free.pop() {
            return Ok(h);
        }
        let transient = state.opened >= self.max;
        if !transient {
            // Reserve the slot before dropping the lock for the open.
            state.opened += 1;
        }
        drop(state);
        Handle::open(&self.path, transient).map_err(|e| {
            if !transient {
                self.state.lock().opened -= 1;
            }
            e.into()
        })
    }

    /// Returns a handle. Transient handles, and every handle after
    /// [`close`](Self::close), are dropped instead.
    pub(crate) fn put(&self, handle: Handle) {
        if handle.transient {
            return;
        }
        let mut state = self.state.lock();
        if state.closed {
            state.opened = state.opened.saturating_sub(1);
            return;
        }
        state.free.push(handle);
    }

    /// Closes every idle handle and refuses further checkouts.
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        let idle = state.free.len();
        state.free.clear();
        state.opened = state.opened.saturating_sub(idle);
    }

    #[cfg(test)]
    pub(crate) fn opened(&self) -> usize {
        self.state.lock().opened
    }
}
