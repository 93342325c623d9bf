//! Tunables shared by the list, hash map and cache, collected once instead
//! of scattered as magic numbers (mirrors the teacher crate centralising
//! `BUCKET_BITS`/`BUCKET_COUNT` in `real/parking_lot.rs`).

/// Default retry budget for most CAS-loop mutators (`spec.md` §4.6).
pub const DEFAULT_RETRY_BUDGET: u32 = 100;

/// Retry budget for particularly contended paths, namely bucket
/// initialisation (`spec.md` §4.6).
pub const BUCKET_INIT_RETRY_BUDGET: u32 = 10;

/// Default maximum entries a hash map bucket holds before it is
/// subdivided (`spec.md` §6).
pub const DEFAULT_MAX_PER_BUCKET: usize = 32;

/// Number of bucket hierarchy levels; one per hex nibble of a 64-bit hash
/// (`spec.md` §4.3 glossary).
pub const MAX_LEVELS: u8 = 16;

/// Size of a worker pool draining the cache's dirty queue (`spec.md` §6).
pub const MAX_DIRTY_HANDLERS: usize = 10;

/// Number of background gc tasks the cache runs (`spec.md` §6).
pub const MAX_GC: usize = 1;

/// Capacity of the cache's dirty-write channel, expressed as a multiple of
/// [`MAX_DIRTY_HANDLERS`] (`spec.md` §4.4).
pub const DIRTY_QUEUE_FACTOR: usize = 10;

/// `_gc` runs whenever live-plus-pooled node count exceeds this multiple
/// of the cache's configured capacity (`spec.md` §4.4).
pub const GC_HIGH_WATER_FACTOR: usize = 2;
