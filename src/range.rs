//! Per-node view over the `blocks` relation.
//!
//! A `RangeIndex` owns no state beyond the node id; every query and
//! mutation goes through the shared store, so all open handles on the same
//! node observe one consistent block set.

use crate::error::{CacheError, CacheResult};
use crate::meta::{Block, SharedStore};

#[derive(Debug, Clone)]
pub struct RangeIndex {
    store: SharedStore,
    node: u64,
}

impl RangeIndex {
    pub fn new(store: SharedStore, node: u64) -> RangeIndex {
        RangeIndex { store, node }
    }

    pub fn node(&self) -> u64 {
        self.node
    }

    /// The block that satisfies `read(size, offset)`, or `None` on a miss.
    ///
    /// A hit requires a single block containing the whole request, or a
    /// last-block-tagged one containing its start (the short-read-at-EOF
    /// case). The returned block bounds how many bytes the hit may serve.
    pub fn hit(&self, offset: u64, size: u32) -> CacheResult<Option<Block>> {
        self.store.lock().covering_block(self.node, offset, size)
    }

    /// Record `[offset, offset + len)` as present, merging away any blocks
    /// the new range overlaps or touches. Zero-length inserts are no-ops.
    pub fn insert(&self, offset: u64, len: u64, last: bool) -> CacheResult<()> {
        if len == 0 {
            return Ok(());
        }
        let end = offset
            .checked_add(len)
            .ok_or_else(|| CacheError::InvalidArgument(format!("range overflow at {offset}")))?;
        self.store.lock().merge_block(self.node, offset, end, last)
    }

    /// Forget everything at or above `len`.
    pub fn truncate(&self, len: u64) -> CacheResult<()> {
        self.store.lock().truncate_blocks(self.node, len)
    }

    /// Snapshot of the node's blocks, ordered by offset.
    pub fn known_ranges(&self) -> CacheResult<Vec<Block>> {
        self.store.lock().blocks_for_node(self.node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::MetaStore;

    fn index() -> RangeIndex {
        let store = MetaStore::open_in_memory().unwrap().into_shared();
        store.lock().upsert_node(1, 0).unwrap();
        RangeIndex::new(store, 1)
    }

    fn ranges(ix: &RangeIndex) -> Vec<(u64, u64)> {
        ix.known_ranges()
            .unwrap()
            .iter()
            .map(|b| (b.offset, b.end))
            .collect()
    }

    #[test]
    fn zero_length_insert_is_noop() {
        let ix = index();
        ix.insert(5, 0, true).unwrap();
        assert!(ranges(&ix).is_empty());
        assert!(ix.hit(5, 1).unwrap().is_none());
    }

    #[test]
    fn insert_order_does_not_matter() {
        let pieces: [(u64, u64); 3] = [(0, 5), (9, 4), (3, 8)];
        let mut expected: Option<Vec<(u64, u64)>> = None;
        // All six orders of the same inserts settle on the same block set.
        for perm in [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ] {
            let ix = index();
            for i in perm {
                let (offset, len) = pieces[i];
                ix.insert(offset, len, false).unwrap();
            }
            let got = ranges(&ix);
            match &expected {
                None => expected = Some(got),
                Some(want) => assert_eq!(&got, want),
            }
        }
        assert_eq!(expected.unwrap(), vec![(0, 13)]);
    }

    #[test]
    fn insert_is_idempotent() {
        let ix = index();
        ix.insert(10, 10, false).unwrap();
        let once = ranges(&ix);
        ix.insert(10, 10, false).unwrap();
        assert_eq!(ranges(&ix), once);
    }

    #[test]
    fn blocks_never_overlap_or_touch() {
        let ix = index();
        for (offset, len, last) in [
            (0u64, 5u64, false),
            (13, 5, false),
            (4, 20, true),
            (30, 2, false),
            (24, 6, false),
        ] {
            ix.insert(offset, len, last).unwrap();
            let blocks = ix.known_ranges().unwrap();
            for pair in blocks.windows(2) {
                assert!(pair[0].end < pair[1].offset, "touching blocks: {blocks:?}");
            }
            assert!(blocks.iter().filter(|b| b.last).count() <= 1);
            if let Some(tagged) = blocks.iter().find(|b| b.last) {
                let max_end = blocks.iter().map(|b| b.end).max().unwrap();
                assert_eq!(tagged.end, max_end);
            }
        }
    }

    #[test]
    fn truncate_into_block_clamps() {
        let ix = index();
        ix.insert(0, 5, false).unwrap();
        ix.insert(13, 5, true).unwrap();
        ix.truncate(14).unwrap();
        assert_eq!(ranges(&ix), vec![(0, 5), (13, 14)]);
        assert!(ix.known_ranges().unwrap().iter().all(|b| !b.last));
        // Truncating past the end changes nothing.
        ix.truncate(100).unwrap();
        assert_eq!(ranges(&ix), vec![(0, 5), (13, 14)]);
    }
}
