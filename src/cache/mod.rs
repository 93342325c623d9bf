//! LRU/LFU cache built on [`crate::list::OrderedList`] (`spec.md` §4.4).
//!
//! A [`Cache`] keeps live records in list order (oldest at the front,
//! most-recently-appended at the back) and a [`parking_lot::RwLock`]-
//! guarded key→node map for lookup. Writes are write-behind: [`Cache::set`]
//! only enqueues; a small pool of worker threads drains the queue via
//! `setLazy`. A single background task runs `gc`, cancellable only during
//! [`Cache::reset`].

mod cancel;
mod entry;

/// Eviction discipline a [`Cache`] applies on `gc`.
pub use entry::Algorithm;
/// Choice of free-node pool implementation a [`Cache`] recycles through.
pub use entry::PoolKind;

use crate::constants::{DIRTY_QUEUE_FACTOR, GC_HIGH_WATER_FACTOR, MAX_DIRTY_HANDLERS};
use crate::keyed::Keyed;
use crate::list::{OrderedList, TraverseMode};
use crate::node::Node;
use cancel::CancelToken;
use crossbeam_channel::{bounded, Receiver, Sender};
use entry::CacheEntry;
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::Arc;
use std::thread;

/// Construction options for [`Cache`].
pub struct CacheOptions<S = RandomState> {
    /// Capacity past which `gc` starts evicting (`spec.md` §4.4).
    pub max: usize,
    /// Eviction discipline.
    pub algorithm: Algorithm,
    /// Free-node pool implementation. Default [`PoolKind::ListPool`].
    pub pool: PoolKind,
    /// `BuildHasher` for the key→node map.
    pub hasher: S,
}

impl Default for CacheOptions<RandomState> {
    fn default() -> Self {
        CacheOptions {
            max: 1024,
            algorithm: Algorithm::Lru,
            pool: PoolKind::default(),
            hasher: RandomState::default(),
        }
    }
}

enum Work<T> {
    Item(T),
    Shutdown,
}

/// A concurrent, write-behind LRU/LFU cache (`spec.md` §4.4). Cheap to
/// clone: clones share the same underlying store and worker threads, like
/// a database connection pool handle.
pub struct Cache<T: Keyed, S = RandomState>(Arc<Inner<T, S>>);

impl<T: Keyed, S> Clone for Cache<T, S> {
    fn clone(&self) -> Self {
        Cache(Arc::clone(&self.0))
    }
}

struct Inner<T: Keyed, S> {
    list: OrderedList<CacheEntry<T>>,
    map: RwLock<HashMap<T::Key, usize, S>>,
    pool: Mutex<Vec<usize>>,
    count: AtomicUsize,
    pooled: AtomicUsize,
    max: usize,
    algorithm: Algorithm,
    pool_kind: PoolKind,
    tx: Sender<Work<T>>,
    gc_tx: Sender<()>,
    gc_mutex: Mutex<()>,
    cancel: Arc<CancelToken>,
    shutdown: Arc<AtomicBool>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    gc_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

unsafe impl<T: Keyed + Send, S: Send> Send for Inner<T, S> {}
unsafe impl<T: Keyed + Send + Sync, S: Send + Sync> Sync for Inner<T, S> {}

impl<T> Cache<T, RandomState>
where
    T: Keyed + Send + Sync + 'static,
    T::Key: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// A new cache with the default hasher.
    pub fn new(max: usize, algorithm: Algorithm) -> Self {
        Self::with_options(CacheOptions {
            max,
            algorithm,
            pool: PoolKind::default(),
            hasher: RandomState::default(),
        })
    }
}

impl<T, S> Cache<T, S>
where
    T: Keyed + Send + Sync + 'static,
    T::Key: Eq + Hash + Clone + Send + Sync + 'static,
    S: BuildHasher + Send + Sync + 'static,
{
    /// A new cache. Spawns [`crate::constants::MAX_DIRTY_HANDLERS`] write
    /// workers and one `gc` task, all owned by this handle (and every
    /// clone of it) until the last clone drops.
    pub fn with_options(options: CacheOptions<S>) -> Self {
        let (tx, rx) = bounded(DIRTY_QUEUE_FACTOR * MAX_DIRTY_HANDLERS);
        let (gc_tx, gc_rx) = bounded(1);

        let inner = Arc::new(Inner {
            list: OrderedList::new(),
            map: RwLock::new(HashMap::with_hasher(options.hasher)),
            pool: Mutex::new(Vec::new()),
            count: AtomicUsize::new(0),
            pooled: AtomicUsize::new(0),
            max: options.max,
            algorithm: options.algorithm,
            pool_kind: options.pool,
            tx,
            gc_tx,
            gc_mutex: Mutex::new(()),
            cancel: Arc::new(CancelToken::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
            gc_handle: Mutex::new(None),
        });

        let mut workers = Vec::with_capacity(MAX_DIRTY_HANDLERS);
        for _ in 0..MAX_DIRTY_HANDLERS {
            let inner = Arc::clone(&inner);
            let rx = rx.clone();
            workers.push(thread::spawn(move || worker_loop(inner, rx)));
        }
        *inner.workers.lock() = workers;

        let gc_handle = {
            let inner = Arc::clone(&inner);
            thread::spawn(move || gc_loop(inner, gc_rx))
        };
        *inner.gc_handle.lock() = Some(gc_handle);

        Cache(inner)
    }

    /// Enqueues `record` for write-behind insertion (`spec.md` §4.4's
    /// `Set`). Returns `false` if the dirty queue is full and the write
    /// was dropped rather than applied — callers needing a guarantee
    /// should retry.
    pub fn set(&self, record: T) -> bool {
        self.0.tx.try_send(Work::Item(record)).is_ok()
    }

    /// Looks up `key`, touching its reference info on a hit.
    pub fn get(&self, key: &T::Key) -> Option<T>
    where
        T: Clone,
    {
        let guard = crossbeam_epoch::pin();
        let addr = *self.0.map.read().get(key)?;
        let node = addr as *mut Node<CacheEntry<T>>;
        unsafe {
            let entry = (*node).value();
            if !entry.is_registered() {
                return None;
            }
            entry.touch(self.0.algorithm);
            let _ = &guard;
            Some(entry.value.clone())
        }
    }

    /// Number of live, registered entries.
    pub fn len(&self) -> usize {
        self.0.count.load(Acquire)
    }

    /// Whether the cache holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live, registered entries (`spec.md` §6's `Cache.size()`;
    /// identical to [`len`](Self::len), kept as its own method since
    /// `spec.md` names both on the external interface).
    pub fn size(&self) -> usize {
        self.len()
    }

    /// A snapshot of every key currently bound to a live entry
    /// (`spec.md` §6's `Cache.keys()`). Reflects the key→node map at the
    /// instant of the call; entries set or evicted concurrently may or
    /// may not be included.
    pub fn keys(&self) -> Vec<T::Key> {
        self.0.map.read().keys().cloned().collect()
    }

    /// Visits every live, registered entry tail-to-front — the cache's
    /// own LRU/LFU ordering, most-recently-appended (or most recently
    /// given a "second chance") first (`spec.md` §6's
    /// `Cache.reverse_each`).
    pub fn reverse_each(&self, mut f: impl FnMut(&T)) {
        let inner = &self.0;
        let guard = crossbeam_epoch::pin();
        let mut cur = match inner.list.back(&guard) {
            Ok(c) => c,
            Err(_) => return,
        };
        loop {
            let prev = inner.list.prev(cur, TraverseMode::SkipMark, &guard).ok();
            if let Some(entry) = cur.value() {
                if entry.is_registered() {
                    f(&entry.value);
                }
            }
            match prev {
                Some(p) if p.ptr != inner.list.root(&guard).ptr => cur = p,
                _ => break,
            }
        }
    }

    /// Cancels any in-flight `gc` cycle, waits for it to settle, expires
    /// every entry back to the pool, then resumes `gc` (`spec.md` §4.4's
    /// `Reset`).
    pub fn reset(&self) {
        let inner = &self.0;
        let since = inner.cancel.generation();
        inner.cancel.cancel();
        let _ = inner.gc_tx.try_send(());
        inner.cancel.wait_settled_past(since);

        let _gc_guard = inner.gc_mutex.lock();
        let guard = crossbeam_epoch::pin();
        inner.map.write().clear();
        loop {
            let front = match inner.list.front(&guard) {
                Ok(c) => c,
                Err(_) => break,
            };
            let entry = front
                .value()
                .expect("non-root cursor always carries an entry");
            entry.ref_count.store(0, Relaxed);
            entry.mark_unregistered();
            match inner.list.purge(front, &guard) {
                Ok(purged) => match inner.pool_kind {
                    PoolKind::ListPool => inner.pool.lock().push(purged.ptr as usize),
                    PoolKind::SyncPool => unsafe { inner.list.destroy(purged, &guard) },
                },
                Err(_) => break,
            }
        }
        inner.count.store(0, Release);
        inner
            .pooled
            .store(inner.pool.lock().len(), Release);
        inner.cancel.uncancel();
    }
}

fn worker_loop<T, S>(inner: Arc<Inner<T, S>>, rx: Receiver<Work<T>>)
where
    T: Keyed + Send + Sync + 'static,
    T::Key: Eq + Hash + Clone + Send + Sync + 'static,
    S: BuildHasher + Send + Sync + 'static,
{
    loop {
        match rx.recv() {
            Ok(Work::Item(record)) => set_lazy(&inner, record),
            Ok(Work::Shutdown) | Err(_) => break,
        }
    }
}

/// `spec.md` §4.4's `setLazy`.
fn set_lazy<T, S>(inner: &Inner<T, S>, record: T)
where
    T: Keyed + Send + Sync + 'static,
    T::Key: Eq + Hash + Clone + Send + Sync + 'static,
    S: BuildHasher,
{
    let guard = crossbeam_epoch::pin();
    let key = record.key().clone();

    {
        let map = inner.map.read();
        if let Some(&addr) = map.get(&key) {
            let node = addr as *mut Node<CacheEntry<T>>;
            unsafe {
                let entry = (*node).value();
                if entry.is_registered() {
                    entry.touch(inner.algorithm);
                    return;
                }
            }
        }
    }

    let recycled = match inner.pool_kind {
        PoolKind::ListPool => inner.pool.lock().pop(),
        PoolKind::SyncPool => None,
    };
    let root = inner.list.root(&guard);
    let appended = if let Some(addr) = recycled {
        inner.pooled.fetch_sub(1, AcqRel);
        let raw = addr as *mut Node<CacheEntry<T>>;
        let initial_ref = initial_ref(inner.algorithm);
        unsafe {
            Node::replace_value(raw, CacheEntry::new(record, initial_ref));
        }
        unsafe { inner.list.splice_after(root, raw) }
    } else {
        inner
            .list
            .insert_before(root, CacheEntry::new(record, initial_ref(inner.algorithm)), &guard)
    };

    let inserted = match appended {
        Ok(c) => c,
        Err(_) => return,
    };
    inner.map.write().insert(key, inserted.ptr as usize);
    inner.count.fetch_add(1, AcqRel);
    let _ = inner.gc_tx.try_send(());
}

fn initial_ref(algorithm: Algorithm) -> u32 {
    match algorithm {
        Algorithm::Lru => 2,
        Algorithm::Lfu => 1,
        Algorithm::None => 0,
    }
}

fn gc_loop<T, S>(inner: Arc<Inner<T, S>>, rx: Receiver<()>)
where
    T: Keyed + Send + Sync + 'static,
    T::Key: Eq + Hash + Clone + Send + Sync + 'static,
    S: BuildHasher,
{
    loop {
        match rx.recv() {
            Ok(()) => {}
            Err(_) => break,
        }
        if inner.shutdown.load(Acquire) {
            break;
        }
        if inner.cancel.is_cancelled() {
            inner.cancel.mark_settled();
            continue;
        }
        let total = inner.count.load(Acquire) + inner.pooled.load(Acquire);
        if total > GC_HIGH_WATER_FACTOR * inner.max {
            let _guard = inner.gc_mutex.lock();
            run_gc_cycle(&inner);
        }
        inner.cancel.mark_settled();
    }
}

/// `spec.md` §4.4's `_gc`: pass 1 evicts unreferenced nodes from the tail,
/// pass 2 ages or (LFU only) gives survivors a second chance.
fn run_gc_cycle<T, S>(inner: &Inner<T, S>)
where
    T: Keyed + Send + Sync + 'static,
    T::Key: Eq + Hash + Clone + Send + Sync + 'static,
    S: BuildHasher,
{
    let guard = crossbeam_epoch::pin();

    let mut cur = match inner.list.back(&guard) {
        Ok(c) => c,
        Err(_) => return,
    };
    loop {
        if inner.cancel.is_cancelled() {
            return;
        }
        let total = inner.count.load(Acquire) + inner.pooled.load(Acquire);
        if total <= GC_HIGH_WATER_FACTOR * inner.max {
            break;
        }
        let prev = inner.list.prev(cur, TraverseMode::SkipMark, &guard).ok();
        if let Some(entry) = cur.value() {
            if entry.is_reclaimable() {
                inner.map.write().remove(entry.value.key());
                entry.mark_unregistered();
                if let Ok(purged) = inner.list.purge(cur, &guard) {
                    inner.count.fetch_sub(1, AcqRel);
                    match inner.pool_kind {
                        PoolKind::ListPool => {
                            inner.pooled.fetch_add(1, AcqRel);
                            inner.pool.lock().push(purged.ptr as usize);
                        }
                        PoolKind::SyncPool => unsafe { inner.list.destroy(purged, &guard) },
                    }
                }
            }
        }
        match prev {
            Some(p) if p.ptr != inner.list.root(&guard).ptr => cur = p,
            _ => break,
        }
    }

    let mut cur = match inner.list.front(&guard) {
        Ok(c) => c,
        Err(_) => return,
    };
    loop {
        if inner.cancel.is_cancelled() {
            return;
        }
        let next = inner.list.next(cur, TraverseMode::SkipMark, &guard).ok();
        let advance_to = next.filter(|n| n.ptr != inner.list.root(&guard).ptr);

        if let Some(entry) = cur.value() {
            match inner.algorithm {
                Algorithm::Lfu => {
                    let prev_ref = entry.ref_count.fetch_update(AcqRel, Acquire, |r| {
                        Some(r.saturating_sub(1))
                    });
                    let became_zero = matches!(prev_ref, Ok(r) if r <= 1);
                    if became_zero {
                        let key = entry.value.key().clone();
                        if let Ok(purged) = inner.list.purge(cur, &guard) {
                            // Second chance: reset the reference count and
                            // re-splice this same node at the tail instead
                            // of moving its value out and freeing it.
                            // `purge` detaches but never deallocates, so
                            // `purged` is still a live, valid node to reuse.
                            entry.ref_count.store(1, Release);
                            let root = inner.list.root(&guard);
                            let reinserted =
                                unsafe { inner.list.splice_before(root, purged.ptr) };
                            match reinserted {
                                Ok(c) => {
                                    inner.map.write().insert(key, c.ptr as usize);
                                }
                                Err(_) => {
                                    inner.map.write().remove(&key);
                                    inner.count.fetch_sub(1, AcqRel);
                                    match inner.pool_kind {
                                        PoolKind::ListPool => {
                                            inner.pooled.fetch_add(1, AcqRel);
                                            inner.pool.lock().push(purged.ptr as usize);
                                        }
                                        PoolKind::SyncPool => unsafe {
                                            inner.list.destroy(purged, &guard)
                                        },
                                    }
                                }
                            }
                        }
                    }
                }
                Algorithm::Lru | Algorithm::None => {
                    entry.ref_count.store(0, Release);
                }
            }
        }

        match advance_to {
            Some(n) => cur = n,
            None => break,
        }
    }
}

impl<T: Keyed, S> Drop for Inner<T, S> {
    fn drop(&mut self) {
        for _ in self.workers.get_mut().iter() {
            let _ = self.tx.send(Work::Shutdown);
        }
        for h in self.workers.get_mut().drain(..) {
            let _ = h.join();
        }
        self.shutdown.store(true, Release);
        let _ = self.gc_tx.try_send(());
        if let Some(h) = self.gc_handle.get_mut().take() {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Rec {
        id: u32,
        payload: &'static str,
    }

    impl Keyed for Rec {
        type Key = u32;
        fn key(&self) -> &u32 {
            &self.id
        }
    }

    fn wait_drained<T: Keyed, S>(cache: &Cache<T, S>)
    where
        T: Send + Sync + 'static,
        T::Key: Eq + Hash + Clone + Send + Sync + 'static,
        S: BuildHasher + Send + Sync + 'static,
    {
        // the test-only single-threaded-ish path: give worker threads a
        // moment to drain the bounded channel.
        for _ in 0..200 {
            if cache.0.tx.is_empty() {
                break;
            }
            thread::yield_now();
        }
        thread::sleep(std::time::Duration::from_millis(20));
    }

    #[test]
    fn set_then_get_lru() {
        let cache: Cache<Rec> = Cache::new(8, Algorithm::Lru);
        cache.set(Rec { id: 1, payload: "a" });
        wait_drained(&cache);
        assert_eq!(
            cache.get(&1),
            Some(Rec {
                id: 1,
                payload: "a"
            })
        );
        assert_eq!(cache.get(&2), None);
    }

    #[test]
    fn gc_evicts_past_capacity() {
        let cache: Cache<Rec> = Cache::new(4, Algorithm::Lru);
        for i in 0..50u32 {
            cache.set(Rec {
                id: i,
                payload: "x",
            });
            wait_drained(&cache);
        }
        assert!(cache.len() <= 2 * 4);
    }

    #[test]
    fn sync_pool_never_retains_purged_nodes() {
        let cache: Cache<Rec> = Cache::with_options(CacheOptions {
            max: 4,
            algorithm: Algorithm::Lru,
            pool: PoolKind::SyncPool,
            hasher: RandomState::default(),
        });
        for i in 0..50u32 {
            cache.set(Rec {
                id: i,
                payload: "x",
            });
            wait_drained(&cache);
        }
        assert!(cache.len() <= 2 * 4);
        assert_eq!(cache.0.pooled.load(Acquire), 0);
    }

    #[test]
    fn reset_clears_everything() {
        let cache: Cache<Rec> = Cache::new(8, Algorithm::Lru);
        for i in 0..10u32 {
            cache.set(Rec {
                id: i,
                payload: "x",
            });
        }
        wait_drained(&cache);
        cache.reset();
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.get(&0), None);
    }
}
