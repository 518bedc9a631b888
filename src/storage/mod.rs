//! Storage engine: byte-bounded write-back LRU cache fronting per-cell
//! sstable files, with row-lock enforcement.

mod cache;
mod store;

pub use store::{Store, LOCK_BYPASS, NO_LOCK};

pub(crate) use cache::{CachePut, LruCache, ENTRY_HEADER_SIZE};
