//! Embedded metadata store for the cache.
//!
//! Three relations live in a single SQLite file at the cache root:
//! `nodes` (one row per backing inode ever cached), `paths` (virtual path to
//! node), and `blocks` (the known byte ranges per node). Everything in here
//! is reconstructible from the target, so the store runs with journaling and
//! syncing off.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::CacheResult;

/// Shared handle to the store. The FUSE session loop is single-threaded, so
/// the mutex is uncontended; it exists so file handles and the facade can
/// hold the store at the same time.
pub type SharedStore = Arc<Mutex<MetaStore>>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS nodes (
    id       INTEGER PRIMARY KEY,
    last_use INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS paths (
    path    TEXT PRIMARY KEY,
    node_id INTEGER NOT NULL REFERENCES nodes(id)
);
CREATE TABLE IF NOT EXISTS blocks (
    node_id    INTEGER NOT NULL REFERENCES nodes(id),
    "offset"   INTEGER NOT NULL,
    "end"      INTEGER NOT NULL,
    last_block INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS blocks_by_node ON blocks(node_id, "offset");
"#;

/// One known byte range `[offset, end)` of a node's content.
///
/// `last` records that `end` coincided with the file's logical end when the
/// range was stored, which lets a short read at EOF count as a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub offset: u64,
    pub end: u64,
    pub last: bool,
}

impl Block {
    pub fn len(&self) -> u64 {
        self.end - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.offset >= self.end
    }
}

/// Wrapper around the SQLite connection holding the three relations.
#[derive(Debug)]
pub struct MetaStore {
    conn: Connection,
}

impl MetaStore {
    /// Open (creating if absent) the store at `path` and apply the schema.
    pub fn open(path: &Path) -> CacheResult<MetaStore> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory store, for tests.
    pub fn open_in_memory() -> CacheResult<MetaStore> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> CacheResult<MetaStore> {
        // The whole store is a reconstructible cache, so durability is
        // traded away wholesale.
        conn.pragma_update(None, "synchronous", "OFF")?;
        conn.query_row("PRAGMA journal_mode = OFF", [], |_| Ok(()))?;
        conn.execute_batch(SCHEMA)?;
        Ok(MetaStore { conn })
    }

    /// Shared handle around a freshly opened store.
    pub fn into_shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }

    /// Create the node row, or refresh `last_use` if it already exists.
    pub fn upsert_node(&self, id: u64, now: i64) -> CacheResult<()> {
        self.conn.execute(
            "INSERT INTO nodes (id, last_use) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET last_use = excluded.last_use",
            params![id as i64, now],
        )?;
        Ok(())
    }

    /// Refresh `last_use` on an existing node. Advisory only.
    pub fn touch_node(&self, id: u64, now: i64) -> CacheResult<()> {
        self.conn.execute(
            "UPDATE nodes SET last_use = ?2 WHERE id = ?1",
            params![id as i64, now],
        )?;
        Ok(())
    }

    /// Bind a virtual path to a node, replacing any previous binding.
    pub fn upsert_path(&self, path: &str, node_id: u64) -> CacheResult<()> {
        self.conn.execute(
            "INSERT INTO paths (path, node_id) VALUES (?1, ?2)
             ON CONFLICT(path) DO UPDATE SET node_id = excluded.node_id",
            params![path, node_id as i64],
        )?;
        Ok(())
    }

    pub fn node_for_path(&self, path: &str) -> CacheResult<Option<u64>> {
        let id = self
            .conn
            .query_row(
                "SELECT node_id FROM paths WHERE path = ?1",
                params![path],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(id.map(|id| id as u64))
    }

    /// Other virtual paths bound to the same node (hard links, renames).
    pub fn sibling_paths(&self, node_id: u64, excluding: &str) -> CacheResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT path FROM paths WHERE node_id = ?1 AND path != ?2")?;
        let rows = stmt.query_map(params![node_id as i64, excluding], |row| row.get(0))?;
        let mut paths = Vec::new();
        for row in rows {
            paths.push(row?);
        }
        Ok(paths)
    }

    /// All blocks of a node, ordered by offset. Test and report surface.
    pub fn blocks_for_node(&self, node_id: u64) -> CacheResult<Vec<Block>> {
        let mut stmt = self.conn.prepare(
            r#"SELECT "offset", "end", last_block FROM blocks
               WHERE node_id = ?1 ORDER BY "offset""#,
        )?;
        let rows = stmt.query_map(params![node_id as i64], |row| {
            Ok(Block {
                offset: row.get::<_, i64>(0)? as u64,
                end: row.get::<_, i64>(1)? as u64,
                last: row.get::<_, bool>(2)?,
            })
        })?;
        let mut blocks = Vec::new();
        for row in rows {
            blocks.push(row?);
        }
        Ok(blocks)
    }

    /// The block satisfying a `read(size, offset)`, if any.
    ///
    /// A block covers the read when it contains the whole range, or when it
    /// contains the start and its end was the file's end at insert time (a
    /// short read at EOF is still a hit).
    pub fn covering_block(
        &self,
        node_id: u64,
        offset: u64,
        size: u32,
    ) -> CacheResult<Option<Block>> {
        let end = offset + u64::from(size);
        let block = self
            .conn
            .query_row(
                r#"SELECT "offset", "end", last_block FROM blocks
                   WHERE node_id = ?1 AND "offset" <= ?2
                     AND ("end" >= ?3 OR (last_block = 1 AND "end" > ?2))
                   ORDER BY "end" DESC LIMIT 1"#,
                params![node_id as i64, offset as i64, end as i64],
                |row| {
                    Ok(Block {
                        offset: row.get::<_, i64>(0)? as u64,
                        end: row.get::<_, i64>(1)? as u64,
                        last: row.get::<_, bool>(2)?,
                    })
                },
            )
            .optional()?;
        Ok(block)
    }

    /// Fold `[offset, end)` into the node's block set.
    ///
    /// Every block that intersects or touches the new range is absorbed into
    /// a single coalesced row carrying the incoming `last` flag. Stale
    /// last-block tags are cleared in the same transaction so that at most
    /// one tag survives and it sits on the block with the largest end.
    pub fn merge_block(
        &mut self,
        node_id: u64,
        offset: u64,
        end: u64,
        last: bool,
    ) -> CacheResult<()> {
        debug_assert!(offset < end);
        let tx = self.conn.transaction()?;
        let (lo, hi): (Option<i64>, Option<i64>) = tx.query_row(
            r#"SELECT min("offset"), max("end") FROM blocks
               WHERE node_id = ?1 AND "offset" <= ?2 AND "end" >= ?3"#,
            params![node_id as i64, end as i64, offset as i64],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let merged_offset = lo.map_or(offset, |lo| offset.min(lo as u64));
        let merged_end = hi.map_or(end, |hi| end.max(hi as u64));
        tx.execute(
            r#"DELETE FROM blocks
               WHERE node_id = ?1 AND "offset" <= ?2 AND "end" >= ?3"#,
            params![node_id as i64, end as i64, offset as i64],
        )?;
        if last {
            tx.execute(
                "UPDATE blocks SET last_block = 0 WHERE node_id = ?1 AND last_block = 1",
                params![node_id as i64],
            )?;
        } else {
            tx.execute(
                r#"UPDATE blocks SET last_block = 0
                   WHERE node_id = ?1 AND last_block = 1 AND "end" <= ?2"#,
                params![node_id as i64, merged_end as i64],
            )?;
        }
        tx.execute(
            r#"INSERT INTO blocks (node_id, "offset", "end", last_block)
               VALUES (?1, ?2, ?3, ?4)"#,
            params![node_id as i64, merged_offset as i64, merged_end as i64, last],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Drop all knowledge above `len`: blocks at or past the cut are
    /// deleted, straddling blocks are clamped and lose their tag.
    pub fn truncate_blocks(&mut self, node_id: u64, len: u64) -> CacheResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            r#"DELETE FROM blocks WHERE node_id = ?1 AND "offset" >= ?2"#,
            params![node_id as i64, len as i64],
        )?;
        tx.execute(
            r#"UPDATE blocks SET "end" = ?2, last_block = 0
               WHERE node_id = ?1 AND "end" > ?2"#,
            params![node_id as i64, len as i64],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Remove a path binding. When it was the last binding for its node the
    /// node and its blocks go too.
    pub fn unlink_path(&mut self, path: &str) -> CacheResult<()> {
        let tx = self.conn.transaction()?;
        let node_id: Option<i64> = tx
            .query_row(
                "SELECT node_id FROM paths WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )
            .optional()?;
        tx.execute("DELETE FROM paths WHERE path = ?1", params![path])?;
        if let Some(node_id) = node_id {
            let remaining: i64 = tx.query_row(
                "SELECT count(*) FROM paths WHERE node_id = ?1",
                params![node_id],
                |row| row.get(0),
            )?;
            if remaining == 0 {
                tx.execute("DELETE FROM blocks WHERE node_id = ?1", params![node_id])?;
                tx.execute("DELETE FROM nodes WHERE id = ?1", params![node_id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Rebind `old` to `new`, including every binding underneath `old` when
    /// it names a directory, so aliases survive a rename.
    pub fn rebind_path(&mut self, old: &str, new: &str) -> CacheResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE OR REPLACE paths SET path = ?2 WHERE path = ?1",
            params![old, new],
        )?;
        tx.execute(
            "UPDATE OR REPLACE paths SET path = ?2 || substr(path, length(?1) + 1)
             WHERE substr(path, 1, length(?1) + 1) = ?1 || '/'",
            params![old, new],
        )?;
        tx.commit()?;
        Ok(())
    }
}
