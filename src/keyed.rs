//! Embedder glue (`spec.md` §4.5).
//!
//! The source recovers a user record from a node pointer via offset
//! arithmetic from an embedded header. This reimplementation instead
//! takes the alternative the design notes explicitly bless (`spec.md` §9,
//! "embedded header vs. wrapper"): nodes own their payload directly, and
//! the embedder contract narrows to the one operation the list, hash map
//! and cache actually need from a payload — reading its key.

/// A value that can report the key it is stored under. The hash map and
/// cache's only contract with a user's payload (`spec.md` §4.5) — they
/// never otherwise interpret it.
pub trait Keyed {
    /// The key type entries of this payload are indexed by.
    type Key: Eq + core::hash::Hash;

    /// Returns a reference to this value's key.
    fn key(&self) -> &Self::Key;
}
