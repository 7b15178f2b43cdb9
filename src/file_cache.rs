//! Per-open-file cache handle.
//!
//! A `FileDataCache` binds one virtual path to its node, its shadow file and
//! a [`RangeIndex`] over the node's blocks. The shadow file lives under
//! `<cache root>/file_data/` mirroring the virtual tree; it is sparse, and
//! its populated ranges are exactly the node's blocks.

use std::cmp::min;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;

use crate::error::{CacheError, CacheResult};
use crate::meta::SharedStore;
use crate::range::RangeIndex;

/// Location of the shadow file for a virtual path.
pub fn shadow_path(cache_root: &Path, path: &str) -> PathBuf {
    cache_root
        .join("file_data")
        .join(path.trim_start_matches('/'))
}

/// Move a shadow body (file or directory subtree) and rebind every path
/// under `old` to `new`. Used for renames, whether or not a handle is open.
pub fn relocate(
    store: &SharedStore,
    cache_root: &Path,
    old: &str,
    new: &str,
) -> CacheResult<()> {
    let old_shadow = shadow_path(cache_root, old);
    let new_shadow = shadow_path(cache_root, new);
    if old_shadow.exists() {
        if let Some(parent) = new_shadow.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&old_shadow, &new_shadow)?;
    }
    store.lock().rebind_path(old, new)
}

/// Remove a path binding along with its shadow file, cascading the node's
/// blocks when no alias remains.
pub fn forget_path(store: &SharedStore, cache_root: &Path, path: &str) -> CacheResult<()> {
    match fs::remove_file(shadow_path(cache_root, path)) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    store.lock().unlink_path(path)
}

pub(crate) fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// One open file's view of the cache.
#[derive(Debug)]
pub struct FileDataCache {
    store: SharedStore,
    cache_root: PathBuf,
    path: String,
    shadow_path: PathBuf,
    shadow: File,
    index: RangeIndex,
    hit_bytes: u64,
    misses: u64,
}

impl FileDataCache {
    /// Bind `path` to a node and open its shadow file.
    ///
    /// With `node_id` (from a stat of the target) the node and binding are
    /// created or refreshed. Without it the node is looked up by path, and
    /// any failure to resolve one (including a store failure) surfaces as
    /// [`CacheError::NotCached`] so the caller can treat the open as fresh.
    ///
    /// When the shadow file is absent but a sibling binding of the same
    /// node has one, the sibling's shadow is hard-linked into place so a
    /// single kernel inode backs every alias of the node.
    pub fn open(
        store: SharedStore,
        cache_root: &Path,
        path: &str,
        node_id: Option<u64>,
        truncate: bool,
    ) -> CacheResult<FileDataCache> {
        let node = match node_id {
            Some(id) => {
                let meta = store.lock();
                meta.upsert_node(id, now_secs())?;
                meta.upsert_path(path, id)?;
                id
            }
            None => match store.lock().node_for_path(path) {
                Ok(Some(id)) => id,
                Ok(None) | Err(_) => return Err(CacheError::NotCached),
            },
        };
        store.lock().touch_node(node, now_secs())?;

        let shadow_path = shadow_path(cache_root, path);
        if let Some(parent) = shadow_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if !shadow_path.exists() {
            let siblings = store.lock().sibling_paths(node, path)?;
            for sibling in siblings {
                let other = self::shadow_path(cache_root, &sibling);
                if other.exists() {
                    debug!("linking shadow of {sibling} into {path}");
                    fs::hard_link(&other, &shadow_path)?;
                    break;
                }
            }
        }
        let shadow = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&shadow_path)?;

        let mut cache = FileDataCache {
            index: RangeIndex::new(store.clone(), node),
            store,
            cache_root: cache_root.to_path_buf(),
            path: path.to_string(),
            shadow_path,
            shadow,
            hit_bytes: 0,
            misses: 0,
        };
        if truncate {
            cache.truncate(0)?;
        }
        Ok(cache)
    }

    pub fn node(&self) -> u64 {
        self.index.node()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn index(&self) -> &RangeIndex {
        &self.index
    }

    /// Bytes served from the shadow file so far.
    pub fn hit_bytes(&self) -> u64 {
        self.hit_bytes
    }

    /// Number of reads that had to go to the target.
    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Serve `read(size, offset)` from the shadow file.
    ///
    /// Returns up to `size` bytes; fewer only when a last-block-tagged
    /// block bounds the request at EOF. [`CacheError::Miss`] means the
    /// range is not known and must come from the target.
    pub fn read(&mut self, size: u32, offset: u64) -> CacheResult<Vec<u8>> {
        let block = match self.index.hit(offset, size)? {
            Some(block) => block,
            None => {
                self.misses += 1;
                return Err(CacheError::Miss);
            }
        };
        let want = min(u64::from(size), block.end - offset) as usize;
        let mut buf = vec![0u8; want];
        self.shadow.read_exact_at(&mut buf, offset)?;
        self.hit_bytes += buf.len() as u64;
        Ok(buf)
    }

    /// Store `buf` at `offset` and fold the range into the index. `last`
    /// asserts that the range ends at the file's logical end.
    pub fn update(&mut self, buf: &[u8], offset: u64, last: bool) -> CacheResult<()> {
        if buf.is_empty() {
            return Ok(());
        }
        self.shadow.write_all_at(buf, offset)?;
        self.index.insert(offset, buf.len() as u64, last)
    }

    /// Shrink (or logically extend) the cached content to `len` bytes.
    pub fn truncate(&mut self, len: u64) -> CacheResult<()> {
        self.shadow.set_len(len)?;
        self.index.truncate(len)
    }

    /// Drop this path from the cache: shadow file, binding, and, when this
    /// was the last alias, the node and its blocks.
    pub fn unlink(self) -> CacheResult<()> {
        forget_path(&self.store, &self.cache_root, &self.path)
    }

    /// Move the shadow body and rebind the path. The node is unchanged.
    pub fn rename(&mut self, new_path: &str) -> CacheResult<()> {
        relocate(&self.store, &self.cache_root, &self.path, new_path)?;
        self.follow_rename(new_path);
        Ok(())
    }

    /// Adjust in-memory state after the facade relocated this path (or one
    /// of its parent directories) on our behalf.
    pub fn follow_rename(&mut self, new_path: &str) {
        self.path = new_path.to_string();
        self.shadow_path = shadow_path(&self.cache_root, new_path);
    }

    /// Push shadow file bytes to disk. Metadata is persisted per mutation.
    pub fn sync(&self) -> CacheResult<()> {
        self.shadow.sync_data()?;
        Ok(())
    }

    /// Flush the shadow file and drop the handle.
    pub fn close(self) -> CacheResult<()> {
        self.sync()
    }
}
