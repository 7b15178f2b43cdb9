//! Caching pass-through filesystem.
//!
//! Mirrors a target directory under a mountpoint and shadows the bytes of
//! every regular file read or written through it into sparse files under a
//! local cache root. Reads that fall inside previously observed byte
//! ranges come from the shadow files; everything else goes to the target
//! and is folded into the cache on the way back.
//!
//! The crate is split the way the data flows: [`meta`] holds the persisted
//! relations (nodes, path bindings, known blocks), [`range`] answers and
//! mutates per-node coverage questions, [`file_cache`] ties a node to its
//! shadow file for one open handle, and [`fs`] adapts the FUSE callback set
//! onto the target directory plus those handles.

#![warn(missing_debug_implementations, rust_2018_idioms)]

pub mod error;
pub mod file_cache;
pub mod fs;
pub mod meta;
pub mod mount_options;
pub mod range;

pub use crate::error::{CacheError, CacheResult};
pub use crate::file_cache::FileDataCache;
pub use crate::fs::CacheFs;
pub use crate::meta::{Block, MetaStore, SharedStore};
pub use crate::range::RangeIndex;
