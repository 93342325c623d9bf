//! Hash-map entries: items and bucket sentinels (`spec.md` §3, §4.3).

use crate::loom::AtomicPtr;
use crate::node::Node;
use core::ptr;
use core::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};
use crossbeam_epoch::Guard;

/// A value slot updated via a plain atomic pointer swap, so concurrent
/// `set`s on the same key linearise at one store and readers never
/// observe a torn value (`spec.md` §5's hash-map value-update guarantee).
/// The previous value is reclaimed only once the epoch guarantees no
/// reader can still be holding a reference to it.
pub(crate) struct ValueSlot<V> {
    ptr: AtomicPtr<V>,
}

impl<V> ValueSlot<V> {
    pub(crate) fn new(value: V) -> Self {
        ValueSlot {
            ptr: AtomicPtr::new(Box::into_raw(Box::new(value))),
        }
    }

    pub(crate) fn load<'g>(&self, _guard: &'g Guard) -> &'g V {
        unsafe { &*self.ptr.load(Acquire) }
    }

    pub(crate) fn store(&self, value: V, guard: &Guard) {
        let new = Box::into_raw(Box::new(value));
        let old = self.ptr.swap(new, AcqRel);
        let old_addr = old as usize;
        unsafe {
            guard.defer_unchecked(move || drop(Box::from_raw(old_addr as *mut V)));
        }
    }
}

impl<V> Drop for ValueSlot<V> {
    fn drop(&mut self) {
        let p = self.ptr.load(Relaxed);
        if !p.is_null() {
            unsafe { drop(Box::from_raw(p)) };
        }
    }
}

unsafe impl<V: Send> Send for ValueSlot<V> {}
unsafe impl<V: Send> Sync for ValueSlot<V> {}

/// Per-level doubly-linked bucket list pointers, distinct from the
/// entry's main-list `prev`/`next` (`spec.md` §3's bucket sentinel
/// fields `level_header`). A bucket participates in two lists at once:
/// the main entry list (via [`Node`]'s own links) and its level's bucket
/// list (via these).
pub(crate) struct BucketMeta<K, V> {
    pub(crate) level: u8,
    pub(crate) length: core::sync::atomic::AtomicUsize,
    pub(crate) level_prev: AtomicPtr<Node<Entry<K, V>>>,
    pub(crate) level_next: AtomicPtr<Node<Entry<K, V>>>,
}

impl<K, V> BucketMeta<K, V> {
    fn new(level: u8) -> Self {
        BucketMeta {
            level,
            length: core::sync::atomic::AtomicUsize::new(0),
            level_prev: AtomicPtr::new(ptr::null_mut()),
            level_next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

/// An entry in the split-ordered list: either a live item or a keyless
/// bucket sentinel (`spec.md` §3).
pub(crate) enum EntryBody<K, V> {
    Item {
        key: K,
        conflict: u64,
        value: ValueSlot<V>,
    },
    Bucket(BucketMeta<K, V>),
}

pub(crate) struct Entry<K, V> {
    /// `bitreverse64(primary_hash)`, the main list's sort key.
    pub(crate) reverse: u64,
    pub(crate) body: EntryBody<K, V>,
}

impl<K, V> Entry<K, V> {
    pub(crate) fn item(reverse: u64, key: K, conflict: u64, value: V) -> Self {
        Entry {
            reverse,
            body: EntryBody::Item {
                key,
                conflict,
                value: ValueSlot::new(value),
            },
        }
    }

    pub(crate) fn bucket(reverse: u64, level: u8) -> Self {
        Entry {
            reverse,
            body: EntryBody::Bucket(BucketMeta::new(level)),
        }
    }

    pub(crate) fn is_bucket(&self) -> bool {
        matches!(self.body, EntryBody::Bucket(_))
    }

    pub(crate) fn as_bucket(&self) -> Option<&BucketMeta<K, V>> {
        match &self.body {
            EntryBody::Bucket(b) => Some(b),
            EntryBody::Item { .. } => None,
        }
    }

    pub(crate) fn as_item(&self) -> Option<(&K, u64, &ValueSlot<V>)> {
        match &self.body {
            EntryBody::Item {
                key,
                conflict,
                value,
            } => Some((key, *conflict, value)),
            EntryBody::Bucket(_) => None,
        }
    }
}
