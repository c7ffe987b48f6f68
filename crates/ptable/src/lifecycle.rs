//! Reference counting and deferred teardown for a single table.
//!
//! All coordination between readers and the retiring side goes through one
//! atomic word, so releasing a reader never contends with marking a table:
//!
//! ```text
//! bit 63  MARKED       teardown requested (dispose or delete)
//! bit 62  DELETE_FILE  teardown also removes the file
//! bit 61  DESTROYED    teardown has started; no new readers
//! 0..=60  readers      active reader count
//! ```
//!
//! Teardown begins on whichever side observes `MARKED` with zero readers
//! first, and the `DESTROYED` bit is claimed with a compare-exchange so it
//! runs exactly once.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const MARKED: u64 = 1 << 63;
const DELETE_FILE: u64 = 1 << 62;
const DESTROYED: u64 = 1 << 61;
const COUNT_MASK: u64 = DESTROYED - 1;

/// What the caller that won the teardown race must do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Teardown {
    /// Close handles only.
    Close,
    /// Close handles and remove the file.
    Delete,
}

#[derive(Debug, Default)]
pub(crate) struct Lifecycle {
    state: AtomicU64,
    finished: Mutex<bool>,
    finished_cv: Condvar,
}

impl Lifecycle {
    /// Registers a reader. Fails once teardown has started.
    pub(crate) fn try_acquire(&self) -> bool {
        let prev = self.state.fetch_add(1, Ordering::AcqRel);
        if prev & DESTROYED != 0 {
            self.state.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Drops a reader; returns the teardown to run if this was the last
    /// reader of a marked table.
    pub(crate) fn release(&self) -> Option<Teardown> {
        let prev = self.state.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev & COUNT_MASK > 0, "release without acquire");
        if prev & MARKED != 0 && prev & COUNT_MASK == 1 {
            self.try_begin_teardown()
        } else {
            None
        }
    }

    /// Requests teardown. Idempotent; a later `delete_file = true` upgrades
    /// an earlier close-only request as long as teardown has not started.
    pub(crate) fn mark(&self, delete_file: bool) -> MarkOutcome {
        let bits = if delete_file { MARKED | DELETE_FILE } else { MARKED };
        let prev = self.state.fetch_or(bits, Ordering::AcqRel);
        if prev & DESTROYED != 0 {
            let deleted_already = prev & DELETE_FILE != 0;
            return MarkOutcome::AlreadyTornDown {
                needs_late_delete: delete_file && !deleted_already,
            };
        }
        match self.try_begin_teardown() {
            Some(t) => MarkOutcome::TearDownNow(t),
            None => MarkOutcome::Deferred,
        }
    }

    fn try_begin_teardown(&self) -> Option<Teardown> {
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            if cur & MARKED == 0 || cur & DESTROYED != 0 || cur & COUNT_MASK != 0 {
                return None;
            }
            match self.state.compare_exchange_weak(
                cur,
                cur | DESTROYED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(if cur & DELETE_FILE != 0 {
                        Teardown::Delete
                    } else {
                        Teardown::Close
                    });
                }
                Err(actual) => cur = actual,
            }
        }
    }

    /// Signals waiters that teardown completed.
    pub(crate) fn finish(&self) {
        let mut done = self.finished.lock();
        *done = true;
        self.finished_cv.notify_all();
    }

    /// Blocks until [`finish`](Self::finish) ran or `timeout` elapsed.
    /// A timeout too large to express as a deadline waits without one.
    pub(crate) fn wait_finished(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut done = self.finished.lock();
        while !*done {
            match deadline {
                Some(deadline) => {
                    if self.finished_cv.wait_until(&mut done, deadline).timed_out() {
                        return *done;
                    }
                }
                None => self.finished_cv.wait(&mut done),
            }
        }
        true
    }

    pub(crate) fn active_readers(&self) -> u64 {
        let state = self.state.load(Ordering::Acquire);
        if state & DESTROYED != 0 {
            0
        } else {
            state & COUNT_MASK
        }
    }

    pub(crate) fn is_marked(&self) -> bool {
        self.state.load(Ordering::Acquire) & MARKED != 0
    }

    pub(crate) fn is_marked_for_deletion(&self) -> bool {
        self.state.load(Ordering::Acquire) & DELETE_FILE != 0
    }

    pub(crate) fn is_torn_down(&self) -> bool {
        self.state.load(Ordering::Acquire) & DESTROYED != 0
    }
}

/// Result of [`Lifecycle::mark`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MarkOutcome {
    /// No readers: the caller must run the teardown now.
    TearDownNow(Teardown),
    /// Readers are active; the last one out runs the teardown.
    Deferred,
    /// Teardown already happened. If it only closed the file and deletion
    /// is now requested, the caller must remove the file itself.
    AlreadyTornDown { needs_late_delete: bool },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn mark_without_readers_tears_down_immediately() {
        let lc = Lifecycle::default();
        assert_eq!(lc.mark(true), MarkOutcome::TearDownNow(Teardown::Delete));
        assert!(lc.is_torn_down());
        assert!(!lc.try_acquire());
    }

    #[test]
    fn last_reader_runs_teardown() {
        let lc = Lifecycle::default();
        assert!(lc.try_acquire());
        assert!(lc.try_acquire());
        assert_eq!(lc.mark(false), MarkOutcome::Deferred);
        assert_eq!(lc.release(), None);
        assert_eq!(lc.release(), Some(Teardown::Close));
        assert!(lc.is_torn_down());
    }

    #[test]
    fn mark_is_idempotent_and_can_upgrade_to_delete() {
        let lc = Lifecycle::default();
        assert!(lc.try_acquire());
        assert_eq!(lc.mark(false), MarkOutcome::Deferred);
        assert_eq!(lc.mark(true), MarkOutcome::Deferred);
        assert_eq!(lc.release(), Some(Teardown::Delete));
        assert_eq!(
            lc.mark(true),
            MarkOutcome::AlreadyTornDown {
                needs_late_delete: false
            }
        );
    }

    #[test]
    fn delete_after_close_needs_late_delete() {
        let lc = Lifecycle::default();
        assert_eq!(lc.mark(false), MarkOutcome::TearDownNow(Teardown::Close));
        assert_eq!(
            lc.mark(true),
            MarkOutcome::AlreadyTornDown {
                needs_late_delete: true
            }
        );
    }

    #[test]
    fn wait_times_out_then_succeeds() {
        let lc = Lifecycle::default();
        assert!(!lc.wait_finished(Duration::from_millis(10)));
        lc.finish();
        assert!(lc.wait_finished(Duration::from_millis(10)));
    }

    #[test]
    fn unbounded_wait_does_not_overflow() {
        let lc = Arc::new(Lifecycle::default());
        lc.finish();
        assert!(lc.wait_finished(Duration::MAX));

        let pending = Arc::new(Lifecycle::default());
        let waiter = {
            let pending = Arc::clone(&pending);
            thread::spawn(move || pending.wait_finished(Duration::MAX))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        pending.finish();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn teardown_runs_once_under_contention() {
        let lc = Arc::new(Lifecycle::default());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lc = Arc::clone(&lc);
            handles.push(thread::spawn(move || {
                let mut teardowns = 0;
                for _ in 0..1000 {
                    if lc.try_acquire() && lc.release().is_some() {
                        teardowns += 1;
                    }
                }
                teardowns
            }));
        }
        let from_mark = matches!(lc.mark(true), MarkOutcome::TearDownNow(_)) as usize;
        let from_readers: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(from_mark + from_readers, 1);
        assert!(lc.is_torn_down());
    }
}
