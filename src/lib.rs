#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

mod constants;
mod error;
mod hash;
mod keyed;
mod loom;
mod node;
mod retry;

pub mod cache;
pub mod hashmap;
pub mod list;

pub use cache::{Algorithm, Cache, CacheOptions, PoolKind};
pub use error::{CacheError, ErrorKind, HMapError, ListError, RetryStats};
pub use hash::{KeyHasher, SipKeyHasher};
pub use hashmap::{HMap, HMapOptions};
pub use keyed::Keyed;
pub use list::{Cursor, OrderedList, TraverseMode};
