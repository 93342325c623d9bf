//! Error taxonomy for the list, hash map and cache (`spec.md` §6–§7).

use core::fmt;

/// The closed set of error kinds a retry loop (§4.6) can observe while
/// retrying a CAS sequence. Kept as a fixed-size enum (not a string or a
/// boxed error) so [`RetryStats`] can be a flat counter array instead of a
/// heap map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A CAS on `next` during `mark_for_delete` lost a race.
    CasConflictOnMark,
    /// A CAS publishing a new node's neighbour pointer lost a race.
    CasConflictOnAdd,
    /// The node a mutator targeted was already logically deleted.
    Marked,
    /// A traversal in `WaitNoMark` mode observed a marked successor past
    /// its retry budget.
    NextMarked,
    /// The first node reached during an append attempt was marked.
    FirstMarked,
    /// An append could not find an appendable predecessor.
    NotAppend,
}

impl ErrorKind {
    const COUNT: usize = 6;

    const fn index(self) -> usize {
        match self {
            ErrorKind::CasConflictOnMark => 0,
            ErrorKind::CasConflictOnAdd => 1,
            ErrorKind::Marked => 2,
            ErrorKind::NextMarked => 3,
            ErrorKind::FirstMarked => 4,
            ErrorKind::NotAppend => 5,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::CasConflictOnMark => "cas conflict on mark",
            ErrorKind::CasConflictOnAdd => "cas conflict on add",
            ErrorKind::Marked => "marked",
            ErrorKind::NextMarked => "next marked",
            ErrorKind::FirstMarked => "first marked",
            ErrorKind::NotAppend => "not append",
        };
        f.write_str(s)
    }
}

/// A histogram of [`ErrorKind`]s observed by a retry loop before it gave
/// up. Carried by [`ListError::OverRetry`] so callers can log or assert on
/// which inner error dominated the contention.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryStats {
    counts: [u32; ErrorKind::COUNT],
}

impl RetryStats {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&mut self, kind: ErrorKind) {
        self.counts[kind.index()] += 1;
    }

    /// Number of times `kind` was observed.
    pub fn count(&self, kind: ErrorKind) -> u32 {
        self.counts[kind.index()]
    }

    /// Total number of retries recorded across all kinds.
    pub fn total(&self) -> u32 {
        self.counts.iter().sum()
    }
}

impl fmt::Display for RetryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "retry stats: [")?;
        for (i, count) in self.counts.iter().enumerate() {
            if *count == 0 {
                continue;
            }
            write!(f, "{}={count} ", ErrorKind::from_index(i))?;
        }
        write!(f, "]")
    }
}

impl ErrorKind {
    fn from_index(i: usize) -> Self {
        [
            ErrorKind::CasConflictOnMark,
            ErrorKind::CasConflictOnAdd,
            ErrorKind::Marked,
            ErrorKind::NextMarked,
            ErrorKind::FirstMarked,
            ErrorKind::NotAppend,
        ][i]
    }
}

/// Errors returned by [`crate::list::OrderedList`] operations.
///
/// Precondition violations (`DeleteFirst`, `ListNil`, `Empty`) are fatal to
/// the caller and are never retried internally. Transient CAS conflicts
/// and observed marked state are retried in-loop and only surface here as
/// [`ListError::OverRetry`] once the retry budget (§4.6) is exhausted.
#[derive(Debug, thiserror::Error)]
pub enum ListError {
    /// Attempted to mark the front sentinel for deletion.
    #[error("cannot delete the list's front sentinel")]
    DeleteFirst,
    /// Operated on a node that is not part of any list.
    #[error("node is not linked into a list")]
    ListNil,
    /// The list held only sentinels when a non-empty result was required.
    #[error("list is empty")]
    Empty,
    /// The target node was observed already marked for deletion.
    #[error("node is marked for deletion")]
    Marked,
    /// A `WaitNoMark` traversal observed a marked successor too many times.
    #[error("successor is marked")]
    NextMarked,
    /// The node could not be appended after its predecessor.
    #[error("predecessor does not accept appends")]
    NotAppend,
    /// Attempted to unlink a node that was never marked.
    #[error("node is not marked for deletion")]
    NotMarked,
    /// The CAS publishing the deletion mark on `next` lost a race.
    #[error("cas conflict marking node for deletion")]
    CasConflictOnMark,
    /// The first node reached while appending was marked.
    #[error("first node reached is marked")]
    FirstMarked,
    /// The CAS linking a new node into the list lost a race.
    #[error("cas conflict adding node")]
    CasConflictOnAdd,
    /// A retry loop exhausted its budget; `stats` is a histogram of the
    /// inner errors it observed along the way.
    #[error("retry budget exhausted after {attempts} attempts ({stats})")]
    OverRetry {
        /// Number of attempts made before giving up.
        attempts: u32,
        /// Histogram of the inner error kinds observed.
        stats: RetryStats,
    },
    /// `purge` found the node's neighbours in an unsafe state to
    /// re-initialise it for reuse.
    #[error("node's neighbours are not in a safe state to purge")]
    NoSafety,
    /// `validate` found a break in the `prev`/`next` chain.
    #[error("list is not continuously linked")]
    NoContinuous,
}

/// Errors surfaced by [`crate::hashmap::HMap`].
#[derive(Debug, thiserror::Error)]
pub enum HMapError {
    /// No entry exists for the requested key.
    #[error("key not found")]
    NotFound,
    /// The underlying list operation failed.
    #[error(transparent)]
    List(#[from] ListError),
}

/// Errors surfaced by [`crate::cache::Cache`].
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// No entry exists for the requested key.
    #[error("key not found")]
    NotFound,
    /// The cache was not given a key-extraction function for its value
    /// type before use.
    #[error("no key function defined for this cache's value type")]
    NotDefinedKeyFn,
    /// The configured allocator function failed to produce a node.
    #[error("allocator failed to produce a node")]
    AllocatorFailed,
    /// The underlying list operation failed.
    #[error(transparent)]
    List(#[from] ListError),
}
