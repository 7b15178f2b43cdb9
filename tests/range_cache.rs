//! Range-cache behavior: hit/miss decisions, merging, truncation.

use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

use tempfile::TempDir;

use cachefs::file_cache::shadow_path;
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

    fn open(&self, path: &str, node: u64) -> FileDataCache {
        FileDataCache::open(self.store.clone(), &self.root, path, Some(node), false).unwrap()
    }
}

/// Apply a sequence of writes to an in-memory image, so expectations come
/// from the sequence itself rather than hand-blended strings.
fn overlay(writes: &[(&[u8], u64)]) -> Vec<u8> {
    let mut image = Vec::new();
    for (data, offset) in writes {
        let end = *offset as usize + data.len();
        if image.len() < end {
            image.resize(end, 0);
        }
        image[*offset as usize..end].copy_from_slice(data);
    }
    image
}

fn ranges(cache: &FileDataCache) -> Vec<(u64, u64)> {
    cache
        .index()
        .known_ranges()
        .unwrap()
        .iter()
        .map(|b| (b.offset, b.end))
        .collect()
}

#[test]
fn fresh_cache_misses() {
    let dir = CacheDir::new();
    let mut cache = dir.open("/f", 1);
    assert!(matches!(cache.read(1, 0), Err(CacheError::Miss)));
    assert_eq!(cache.misses(), 1);
}

#[test]
fn read_after_write() {
    let dir = CacheDir::new();
    let mut cache = dir.open("/f", 1);
    let data = b"\x01\x02\x03\x04\x05";
    cache.update(data, 0, false).unwrap();
    cache.update(data, data.len() as u64, false).unwrap();
    assert_eq!(cache.read(5, 0).unwrap(), data);
    assert_eq!(cache.read(5, 5).unwrap(), data);
    assert_eq!(cache.hit_bytes(), 10);
}

#[test]
fn inner_read_within_block() {
    let dir = CacheDir::new();
    let mut cache = dir.open("/f", 1);
    let data: Vec<u8> = (0u8..10).collect();
    cache.update(&data, 0, false).unwrap();
    assert_eq!(cache.read(9, 1).unwrap(), &data[1..]);
}

#[test]
fn partial_coverage_is_a_miss() {
    let dir = CacheDir::new();
    let mut cache = dir.open("/f", 1);
    cache.update(&[7u8; 10], 0, false).unwrap();
    assert!(matches!(cache.read(20, 0), Err(CacheError::Miss)));
}

#[test]
fn last_block_allows_short_read_at_eof() {
    let dir = CacheDir::new();
    let mut cache = dir.open("/f", 1);
    cache.update(b"0123456789", 0, true).unwrap();
    // More than the file holds: a hit, bounded by the tagged block.
    assert_eq!(cache.read(20, 0).unwrap(), b"0123456789");
    assert_eq!(cache.read(20, 4).unwrap(), b"456789");
    // Starting past the end is still a miss.
    assert!(matches!(cache.read(1, 10), Err(CacheError::Miss)));
}

#[test]
fn backward_extension_merges() {
    let dir = CacheDir::new();
    let mut cache = dir.open("/f", 1);
    cache.update(b"1234567890", 10, false).unwrap();
    cache.update(b"1234567890", 5, false).unwrap();
    assert_eq!(ranges(&cache), vec![(5, 20)]);
    assert_eq!(cache.read(15, 5).unwrap(), b"123456789067890");
}

#[test]
fn overwrite_within_block() {
    let dir = CacheDir::new();
    let mut cache = dir.open("/f", 1);
    cache.update(b"1234567890", 0, false).unwrap();
    cache.update(b"54321", 5, false).unwrap();
    assert_eq!(ranges(&cache), vec![(0, 10)]);
    assert_eq!(cache.read(10, 0).unwrap(), b"1234554321");
}

#[test]
fn disjoint_blocks_stay_apart() {
    let dir = CacheDir::new();
    let mut cache = dir.open("/f", 1);
    let writes: [(&[u8], u64); 3] = [(b"1234567890", 0), (b"54321", 17), (b"54321", 10)];
    for (data, offset) in writes {
        cache.update(data, offset, false).unwrap();
    }
    // [10, 15) touches the first block but not the one at 17.
    assert_eq!(ranges(&cache), vec![(0, 15), (17, 22)]);
    assert_eq!(cache.read(15, 0).unwrap(), b"123456789054321");
    assert_eq!(cache.read(5, 17).unwrap(), b"54321");
}

#[test]
fn bridging_write_joins_blocks() {
    let dir = CacheDir::new();
    let mut cache = dir.open("/f", 1);
    let writes: [(&[u8], u64); 3] = [(b"54321", 0), (b"54321", 15), (b"1234567890", 5)];
    for (data, offset) in writes {
        cache.update(data, offset, false).unwrap();
    }
    assert_eq!(ranges(&cache), vec![(0, 20)]);
    assert_eq!(cache.read(20, 0).unwrap(), overlay(&writes));
}

#[test]
fn insert_order_is_immaterial() {
    let writes: [(&[u8], u64); 3] = [(b"54321", 0), (b"54321", 13), (b"abcdefghi", 4)];
    let mut seen: Option<Vec<(u64, u64)>> = None;
    for order in [[0, 1, 2], [2, 0, 1], [1, 2, 0]] {
        let dir = CacheDir::new();
        let mut cache = dir.open("/f", 1);
        for i in order {
            let (data, offset) = writes[i];
            cache.update(data, offset, false).unwrap();
        }
        let got = ranges(&cache);
        match &seen {
            None => seen = Some(got),
            Some(want) => assert_eq!(&got, want),
        }
    }
    assert_eq!(seen.unwrap(), vec![(0, 18)]);
}

#[test]
fn repeated_insert_changes_nothing() {
    let dir = CacheDir::new();
    let mut cache = dir.open("/f", 1);
    cache.update(b"1234567890", 3, false).unwrap();
    let once = ranges(&cache);
    cache.update(b"1234567890", 3, false).unwrap();
    assert_eq!(ranges(&cache), once);
}

#[test]
fn truncate_cuts_blocks_and_bytes() {
    let dir = CacheDir::new();
    let mut cache = dir.open("/f", 1);
    let writes: [(&[u8], u64); 3] = [
        (b"54321", 0),
        (b"54321", 13),
        (b"12345678901234567890", 4),
    ];
    for (data, offset) in writes {
        cache.update(data, offset, false).unwrap();
    }
    cache.truncate(12).unwrap();
    assert_eq!(ranges(&cache), vec![(0, 12)]);
    assert_eq!(cache.read(12, 0).unwrap(), b"543212345678");
    // The bytes above the cut are gone even if re-covered later.
    assert!(matches!(cache.read(1, 12), Err(CacheError::Miss)));
}

#[test]
fn truncate_between_blocks_keeps_lower_ones() {
    let dir = CacheDir::new();
    let mut cache = dir.open("/f", 1);
    cache.update(b"54321", 0, false).unwrap();
    cache.update(b"54321", 13, false).unwrap();
    cache.truncate(6).unwrap();
    assert_eq!(ranges(&cache), vec![(0, 5)]);
    assert_eq!(cache.read(5, 0).unwrap(), b"54321");

    // Truncating above everything is a no-op.
    cache.truncate(100).unwrap();
    assert_eq!(ranges(&cache), vec![(0, 5)]);
}

#[test]
fn shadow_file_stays_sparse() {
    let dir = CacheDir::new();
    let mut cache = dir.open("/f", 1);
    let far = 1_000_000_000_000u64;
    cache.update(b"1234567890", far, false).unwrap();
    cache.sync().unwrap();
    assert_eq!(cache.read(10, far).unwrap(), b"1234567890");

    let meta = std::fs::metadata(shadow_path(&dir.root, "/f")).unwrap();
    assert!(meta.size() >= far);
    assert!(meta.blocks() * 512 < far);
}

#[test]
fn metadata_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().to_path_buf();
    {
        let store = MetaStore::open(&root.join("metadata.db"))
            .unwrap()
            .into_shared();
        let mut cache = FileDataCache::open(store, &root, "/f", Some(9), false).unwrap();
        cache.update(b"persisted", 0, true).unwrap();
        cache.close().unwrap();
    }
    // A second mount sees the same store and shadow file.
    let store = MetaStore::open(&root.join("metadata.db"))
        .unwrap()
        .into_shared();
    let mut cache = FileDataCache::open(store, &root, "/f", None, false).unwrap();
    assert_eq!(cache.read(9, 0).unwrap(), b"persisted");
}
