//! Cancellable context for the cache's `gc` task (`spec.md` §5's
//! "only the cache gc task is cancellable" and §9's "commented-out
//! waitgroup" Open Question — resolved here: `reset()` blocks until the
//! in-flight `gc` cycle has settled, via a generation counter and
//! `parking_lot::Condvar` rather than a waitgroup).

use core::sync::atomic::{AtomicBool, AtomicU64};
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use parking_lot::{Condvar, Mutex};

pub(crate) struct CancelToken {
    cancelled: AtomicBool,
    generation: AtomicU64,
    settle: Mutex<()>,
    settled: Condvar,
}

impl CancelToken {
    pub(crate) fn new() -> Self {
        CancelToken {
            cancelled: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            settle: Mutex::new(()),
            settled: Condvar::new(),
        }
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Release);
    }

    pub(crate) fn uncancel(&self) {
        self.cancelled.store(false, Release);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Acquire)
    }

    /// Current settle generation; `reset()` snapshots this before
    /// cancelling so it knows which future bump to wait for.
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Acquire)
    }

    /// Called by the gc task once a cycle (cancelled or not) has fully
    /// stopped touching shared state.
    pub(crate) fn mark_settled(&self) {
        let guard = self.settle.lock();
        self.generation.fetch_add(1, Relaxed);
        self.settled.notify_all();
        drop(guard);
    }

    /// Blocks until [`mark_settled`](Self::mark_settled) has been called
    /// at least once since `since`.
    pub(crate) fn wait_settled_past(&self, since: u64) {
        let mut guard = self.settle.lock();
        while self.generation.load(Acquire) <= since {
            self.settled.wait(&mut guard);
        }
    }
}
