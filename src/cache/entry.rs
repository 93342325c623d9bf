//! A cache slot: a user record plus the bookkeeping LRU/LFU needs
//! (`spec.md` §4.4).

use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};

/// Which reference-count discipline [`super::Cache::gc`] applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// No eviction bookkeeping; `gc` still reclaims once capacity is
    /// exceeded, oldest (list-front) first.
    None,
    /// `ref = 2` on touch; `gc` pass 2 resets untouched entries' `ref` to
    /// `0` in place rather than moving them.
    Lru,
    /// `ref += 1` on touch (saturating); `gc` pass 2 decrements every
    /// entry and gives survivors a second chance at the list tail.
    Lfu,
}

/// How a retired node's allocation is handled (`spec.md` §4.4's
/// construction option "choice of pool implementation").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// Every purge reclaims its node's allocation immediately (deferred
    /// only by the epoch guard, never retained); every new entry
    /// allocates fresh. Simpler, costs an allocation per churned entry.
    SyncPool,
    /// Purged nodes are kept, unreclaimed, in a free list and their
    /// allocation is recycled in place by the next `setLazy` that needs
    /// one (`spec.md` §4.4's `list-pool`, recycling "spliced directly
    /// from the list tail"). The default: avoids an allocation per churn
    /// at the cost of retaining up to `2 * max` nodes' worth of memory.
    ListPool,
}

impl Default for PoolKind {
    fn default() -> Self {
        PoolKind::ListPool
    }
}

/// The payload [`super::Cache`] actually stores in its [`crate::list::OrderedList`]:
/// the caller's record plus a reference count gc reads and mutates.
/// `registered` distinguishes "live in the key map" from "sitting
/// unclaimed in the pool, or mid-reset" (`spec.md` §4.4's `Reset`).
pub(crate) struct CacheEntry<T> {
    pub(crate) value: T,
    pub(crate) ref_count: AtomicU32,
    pub(crate) registered: core::sync::atomic::AtomicBool,
}

impl<T> CacheEntry<T> {
    pub(crate) fn new(value: T, initial_ref: u32) -> Self {
        CacheEntry {
            value,
            ref_count: AtomicU32::new(initial_ref),
            registered: core::sync::atomic::AtomicBool::new(true),
        }
    }

    /// Applies the "touch" reference-count bump a `Set`/`Get` hit
    /// performs (`spec.md` §4.4 step 1): LRU pins `ref = 2`, LFU
    /// increments (saturating so a hot key can't wrap `ref` to `0`).
    pub(crate) fn touch(&self, algorithm: Algorithm) {
        match algorithm {
            Algorithm::Lru => self.ref_count.store(2, Release),
            Algorithm::Lfu => {
                let mut cur = self.ref_count.load(Acquire);
                loop {
                    let next = cur.saturating_add(1);
                    match self.ref_count.compare_exchange_weak(cur, next, Release, Acquire) {
                        Ok(_) => break,
                        Err(observed) => cur = observed,
                    }
                }
            }
            Algorithm::None => {}
        }
    }

    pub(crate) fn is_reclaimable(&self) -> bool {
        self.ref_count.load(Acquire) == 0
    }

    pub(crate) fn mark_unregistered(&self) {
        self.registered.store(false, Relaxed);
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.registered.load(Acquire)
    }
}
