//! Swaps every atomic/cell type used by the lock-free primitives for its
//! `loom` equivalent when run under `--cfg loom`. Everything outside this
//! module imports atomics from here, never from `core`/`std` directly, so
//! that a single build of `node.rs`/`list.rs`/`retry.rs` can be exercised
//! both by real threads and by `loom::model`.

cfg_if::cfg_if! {
    if #[cfg(loom)] {
        pub(crate) use loom::cell::Cell;
        pub(crate) use loom::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize};
        pub(crate) use loom::thread;
    } else {
        pub(crate) use core::cell::Cell;
        pub(crate) use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize};
        pub(crate) use std::thread;
    }
}

/// Pins an epoch guard for safe deferred reclamation of purged nodes.
///
/// Under `loom` there is no epoch machinery to model-check (it lives in
/// `crossbeam-epoch`, outside this crate), so purge runs its destructor
/// immediately instead of deferring it. Loom is checking the interleavings
/// of our own CAS sequences, not the soundness of `crossbeam-epoch`'s
/// reclamation, which is validated upstream.
#[cfg(not(loom))]
pub(crate) fn pin() -> crossbeam_epoch::Guard {
    crossbeam_epoch::pin()
}
