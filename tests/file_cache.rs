//! Handle-level behavior: node aliasing across paths, unlink, rename.

use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

use tempfile::TempDir;

use cachefs::file_cache::{self, shadow_path};
use cachefs::{CacheError, FileDataCache, MetaStore, SharedStore};

struct CacheDir {
    root: PathBuf,
    store: SharedStore,
    _dir: TempDir,
}

impl CacheDir {
    fn new() -> CacheDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let store = MetaStore::open(&root.join("metadata.db"))
            .unwrap()
            .into_shared();
        CacheDir {
            root,
            store,
            _dir: dir,
        }
    }

    fn open(&self, path: &str, node: Option<u64>) -> cachefs::CacheResult<FileDataCache> {
        FileDataCache::open(self.store.clone(), &self.root, path, node, false)
    }
}

#[test]
fn open_unknown_path_without_node_fails() {
    let dir = CacheDir::new();
    match dir.open("/nope", None) {
        Err(CacheError::NotCached) => {}
        other => panic!("expected NotCached, got {other:?}"),
    }
}

#[test]
fn open_with_truncate_clears_previous_content() {
    let dir = CacheDir::new();
    let mut cache = dir.open("/f", Some(1)).unwrap();
    cache.update(b"stale data", 0, true).unwrap();
    drop(cache);

    let mut cache =
        FileDataCache::open(dir.store.clone(), &dir.root, "/f", Some(1), true).unwrap();
    assert!(cache.index().known_ranges().unwrap().is_empty());
    assert!(matches!(cache.read(1, 0), Err(CacheError::Miss)));
}

#[test]
fn aliases_share_one_shadow_inode() {
    let dir = CacheDir::new();
    let mut first = dir.open("/a", Some(7)).unwrap();
    first.update(b"shared bytes", 0, true).unwrap();
    first.close().unwrap();

    // Second path for the same backing inode, as after link() or rename().
    let mut second = dir.open("/b", Some(7)).unwrap();
    assert_eq!(second.read(12, 0).unwrap(), b"shared bytes");

    let ino_a = std::fs::metadata(shadow_path(&dir.root, "/a")).unwrap().ino();
    let ino_b = std::fs::metadata(shadow_path(&dir.root, "/b")).unwrap().ino();
    assert_eq!(ino_a, ino_b);
}

#[test]
fn write_through_one_alias_is_seen_by_the_other() {
    let dir = CacheDir::new();
    let mut a = dir.open("/a", Some(7)).unwrap();
    let mut b = dir.open("/b", Some(7)).unwrap();
    a.update(b"from a", 0, true).unwrap();
    assert_eq!(b.read(6, 0).unwrap(), b"from a");
}

#[test]
fn unlink_of_one_alias_keeps_the_node() {
    let dir = CacheDir::new();
    let mut a = dir.open("/a", Some(7)).unwrap();
    a.update(b"payload", 0, true).unwrap();
    a.close().unwrap();
    dir.open("/b", Some(7)).unwrap().close().unwrap();

    file_cache::forget_path(&dir.store, &dir.root, "/a").unwrap();
    assert!(!shadow_path(&dir.root, "/a").exists());

    // The other alias still resolves without a fresh stat.
    let mut b = dir.open("/b", None).unwrap();
    assert_eq!(b.read(7, 0).unwrap(), b"payload");
}

#[test]
fn unlink_of_last_alias_drops_node_and_blocks() {
    let dir = CacheDir::new();
    let mut a = dir.open("/a", Some(7)).unwrap();
    a.update(b"payload", 0, true).unwrap();
    a.unlink().unwrap();

    assert!(!shadow_path(&dir.root, "/a").exists());
    assert!(matches!(dir.open("/a", None), Err(CacheError::NotCached)));

    // Recreating the path with the same inode starts cold.
    let mut fresh = dir.open("/a", Some(7)).unwrap();
    assert!(matches!(fresh.read(1, 0), Err(CacheError::Miss)));
}

#[test]
fn rename_carries_cache_content() {
    let dir = CacheDir::new();
    let mut cache = dir.open("/old", Some(3)).unwrap();
    cache.update(b"survives rename", 0, true).unwrap();
    cache.rename("/new").unwrap();

    assert!(!shadow_path(&dir.root, "/old").exists());
    assert!(shadow_path(&dir.root, "/new").exists());
    assert_eq!(cache.read(15, 0).unwrap(), b"survives rename");
    drop(cache);

    // The binding moved rather than being duplicated.
    assert!(matches!(dir.open("/old", None), Err(CacheError::NotCached)));
    let mut reopened = dir.open("/new", None).unwrap();
    assert_eq!(reopened.read(15, 0).unwrap(), b"survives rename");
    assert_eq!(reopened.node(), 3);
}

#[test]
fn directory_relocate_rebinds_children() {
    let dir = CacheDir::new();
    let mut child = dir.open("/dir/child", Some(4)).unwrap();
    child.update(b"deep bytes", 0, true).unwrap();
    child.close().unwrap();

    file_cache::relocate(&dir.store, &dir.root, "/dir", "/moved").unwrap();
    assert!(shadow_path(&dir.root, "/moved/child").exists());
    assert!(!shadow_path(&dir.root, "/dir/child").exists());

    let mut reopened = dir.open("/moved/child", None).unwrap();
    assert_eq!(reopened.read(10, 0).unwrap(), b"deep bytes");
}

#[test]
fn nested_paths_get_shadow_directories() {
    let dir = CacheDir::new();
    let mut cache = dir.open("/a/b/c/file", Some(5)).unwrap();
    cache.update(b"x", 0, true).unwrap();
    assert!(shadow_path(&dir.root, "/a/b/c/file").is_file());
}
