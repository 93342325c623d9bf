//! Node header and mark/CAS primitives (`spec.md` §4.1).
//!
//! The deletion mark lives in the low bit of `next`, mirrored onto `prev`
//! during `mark_for_delete` (`spec.md` §4.2 step 2). Every pointer that
//! will be dereferenced is masked first; every write that publishes a new
//! pointer uses `Release`, every read that will be dereferenced uses
//! `Acquire`, matching the teacher crate's ordering discipline around its
//! own intrusive lists in `real/parking_lot.rs`.

use crate::error::ErrorKind;
use crate::loom::AtomicPtr;
use core::mem::MaybeUninit;
use core::ptr;
use core::sync::atomic::Ordering::{AcqRel, Acquire, Release};

const MARK_BIT: usize = 1;

#[inline]
pub(crate) fn is_marked<T>(ptr: *mut Node<T>) -> bool {
    (ptr as usize) & MARK_BIT != 0
}

#[inline]
pub(crate) fn unmark<T>(ptr: *mut Node<T>) -> *mut Node<T> {
    ((ptr as usize) & !MARK_BIT) as *mut Node<T>
}

#[inline]
fn mark_of<T>(ptr: *mut Node<T>) -> *mut Node<T> {
    ((ptr as usize) | MARK_BIT) as *mut Node<T>
}

/// Discriminates a node carrying a live `T` from a bucket/list sentinel
/// carrying none. Sentinels are allocated once and never read as `T`.
pub(crate) struct Node<T> {
    pub(crate) next: AtomicPtr<Node<T>>,
    pub(crate) prev: AtomicPtr<Node<T>>,
    value: MaybeUninit<T>,
    sentinel: bool,
}

impl<T> Node<T> {
    /// Allocates an unlinked node in the "single" state: both pointers
    /// self-loop, satisfying `spec.md` §3's "empty node" contract without
    /// the two private per-node sentinels the original implementation
    /// used (an implementation detail the address-identity contract does
    /// not require — see `DESIGN.md`).
    pub(crate) fn new_boxed(value: T) -> *mut Node<T> {
        Self::alloc(MaybeUninit::new(value), false)
    }

    pub(crate) fn new_sentinel() -> *mut Node<T> {
        Self::alloc(MaybeUninit::uninit(), true)
    }

    fn alloc(value: MaybeUninit<T>, sentinel: bool) -> *mut Node<T> {
        let boxed = Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            prev: AtomicPtr::new(ptr::null_mut()),
            value,
            sentinel,
        });
        let raw = Box::into_raw(boxed);
        unsafe {
            (*raw).next = AtomicPtr::new(raw);
            (*raw).prev = AtomicPtr::new(raw);
        }
        raw
    }

    pub(crate) fn is_sentinel(&self) -> bool {
        self.sentinel
    }

    /// # Safety
    /// The node must carry a live `T` (`is_sentinel() == false`).
    pub(crate) unsafe fn value(&self) -> &T {
        self.value.assume_init_ref()
    }

    /// # Safety
    /// `raw` must point at a live, uniquely-owned allocation produced by
    /// [`Node::new_boxed`] or [`Node::new_sentinel`], not otherwise
    /// reachable.
    pub(crate) unsafe fn reclaim(raw: *mut Node<T>) {
        let mut boxed = Box::from_raw(raw);
        if !boxed.sentinel {
            boxed.value.assume_init_drop();
        }
    }

    /// Overwrites an already-allocated, exclusively-held node's payload in
    /// place and returns the value it held, without freeing or
    /// reallocating the node (`spec.md` §4.4's list-pool recycling, which
    /// exists specifically to avoid the allocation a free-then-reallocate
    /// cycle would cost).
    ///
    /// # Safety
    /// `raw` must be a live, non-sentinel node no other thread holds a
    /// reference to (e.g. just popped off an exclusively-owned pool).
    pub(crate) unsafe fn replace_value(raw: *mut Node<T>, new: T) -> T {
        let node = &mut *raw;
        debug_assert!(!node.sentinel);
        ptr::replace(node.value.as_mut_ptr(), new)
    }

    pub(crate) fn is_marked(&self) -> bool {
        is_marked(self.next.load(Acquire))
    }

    /// Attempts the `next: p → p|1` CAS of `spec.md` §4.1's `mark`
    /// primitive. Returns [`ErrorKind::Marked`] if already marked,
    /// [`ErrorKind::CasConflictOnMark`] if a concurrent mutation changed
    /// `next` first.
    pub(crate) fn mark_next(&self) -> Result<(), ErrorKind> {
        let p = self.next.load(Acquire);
        if is_marked(p) {
            return Err(ErrorKind::Marked);
        }
        self.next
            .compare_exchange(p, mark_of(p), AcqRel, Acquire)
            .map(|_| ())
            .map_err(|_| ErrorKind::CasConflictOnMark)
    }

    /// Mirrors the mark onto `prev`, per `spec.md` §4.2 step 2. Unlike
    /// `mark_next`, a concurrent reader may have already advanced `prev`
    /// past this node, so a conflicting CAS here is tolerated by the
    /// caller rather than being fatal.
    pub(crate) fn mark_prev(&self) -> Result<(), ErrorKind> {
        let p = self.prev.load(Acquire);
        if is_marked(p) {
            return Err(ErrorKind::Marked);
        }
        self.prev
            .compare_exchange(p, mark_of(p), AcqRel, Acquire)
            .map(|_| ())
            .map_err(|_| ErrorKind::CasConflictOnMark)
    }

    pub(crate) fn load_next(&self) -> *mut Node<T> {
        self.next.load(Acquire)
    }

    pub(crate) fn load_prev(&self) -> *mut Node<T> {
        self.prev.load(Acquire)
    }

    pub(crate) fn next_unmasked(&self) -> *mut Node<T> {
        unmark(self.load_next())
    }

    pub(crate) fn prev_unmasked(&self) -> *mut Node<T> {
        unmark(self.load_prev())
    }

    pub(crate) fn cas_next(
        &self,
        old: *mut Node<T>,
        new: *mut Node<T>,
    ) -> Result<(), ErrorKind> {
        self.next
            .compare_exchange(old, new, AcqRel, Acquire)
            .map(|_| ())
            .map_err(|_| ErrorKind::CasConflictOnAdd)
    }

    pub(crate) fn cas_prev(
        &self,
        old: *mut Node<T>,
        new: *mut Node<T>,
    ) -> Result<(), ErrorKind> {
        self.prev
            .compare_exchange(old, new, AcqRel, Acquire)
            .map(|_| ())
            .map_err(|_| ErrorKind::CasConflictOnAdd)
    }

    pub(crate) fn store_next(&self, new: *mut Node<T>) {
        self.next.store(new, Release);
    }

    pub(crate) fn store_prev(&self, new: *mut Node<T>) {
        self.prev.store(new, Release);
    }
}

/// Follows `next` pointers, masking the mark bit, until an unmarked node
/// is observed. Bounded by `limit` chain hops; sentinels are never marked
/// (`mark_for_delete` on a sentinel is a precondition violation) so a
/// well-formed list always terminates within a handful of hops.
///
/// # Safety
/// Every pointer walked must point at a live `Node<T>` for the duration of
/// the call (the caller holds an epoch guard pinning them).
pub(crate) unsafe fn next_no_mark<T>(start: *mut Node<T>, limit: u32) -> Option<*mut Node<T>> {
    let mut cur = unmark(start);
    for _ in 0..limit {
        let n = (*cur).load_next();
        if !is_marked(n) {
            return Some(unmark(n));
        }
        cur = unmark(n);
    }
    None
}

/// Dual of [`next_no_mark`], following `prev`.
///
/// # Safety
/// Same as [`next_no_mark`].
pub(crate) unsafe fn prev_no_mark<T>(start: *mut Node<T>, limit: u32) -> Option<*mut Node<T>> {
    let mut cur = unmark(start);
    for _ in 0..limit {
        let p = (*cur).load_prev();
        if !is_marked(p) {
            return Some(unmark(p));
        }
        cur = unmark(p);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_node_is_single() {
        let raw = Node::new_boxed(42u32);
        unsafe {
            assert_eq!((*raw).load_next(), raw);
            assert_eq!((*raw).load_prev(), raw);
            assert!(!(*raw).is_marked());
            assert_eq!(*(*raw).value(), 42);
            Node::reclaim(raw);
        }
    }

    #[test]
    fn mark_next_then_conflict() {
        let raw = Node::new_boxed(1u32);
        unsafe {
            assert!((*raw).mark_next().is_ok());
            assert!((*raw).is_marked());
            assert_eq!((*raw).mark_next(), Err(ErrorKind::Marked));
            Node::reclaim(raw);
        }
    }
}
