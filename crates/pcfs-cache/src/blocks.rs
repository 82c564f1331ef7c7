//! [MODULE C] Block Store.
//!
//! Persistent content cache of fixed-size file blocks with atime-ordered LRU
//! eviction under a byte budget (spec.md §4.3). One file per block, named by
//! a stable hash of the backend path plus the block index, under a two-level
//! directory fan-out — exactly the layout spec.md §6 specifies.
//!
//! Atomic replace (write-temp + rename) is grounded in the `nova-cache`
//! disk-cache pattern from the retrieval pack; so is tracking each entry's
//! last-access time explicitly in a small index rather than trusting
//! filesystem atime, which is routinely disabled (`noatime`) on exactly the
//! kind of slow remote mounts this system targets.

use crate::error::CacheError;
use pcfs_models::{block_span, BackendPath};
use rusqlite::{params, Connection};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

/// Evict down to this fraction of `max_cache_size_bytes` once the budget is
/// exceeded (spec.md §4.3).
const EVICTION_TARGET_RATIO: f64 = 0.9;

fn djb2_hash64(s: &str) -> u64 {
    let mut hash: u64 = 5381;
    for b in s.as_bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(*b as u64);
    }
    hash
}

pub struct BlockStore {
    blocks_root: PathBuf,
    block_size: u32,
    max_bytes: u64,
    current_bytes: AtomicU64,
    next_atime: AtomicI64,
    index: Mutex<Connection>,
    eviction_lock: Mutex<()>,
    cache_debug: bool,
}

impl BlockStore {
    pub fn open(cache_root: impl Into<PathBuf>, block_size: u32, max_bytes: u64) -> Result<Self, CacheError> {
        Self::open_with_debug(cache_root, block_size, max_bytes, false)
    }

    pub fn open_with_debug(
        cache_root: impl Into<PathBuf>,
        block_size: u32,
        max_bytes: u64,
        cache_debug: bool,
    ) -> Result<Self, CacheError> {
        let cache_root = cache_root.into();
        let blocks_root = cache_root.join("blocks");
        fs::create_dir_all(&blocks_root)?;

        let index = Connection::open(cache_root.join("blocks_index.db"))?;
        index.pragma_update(None, "journal_mode", "WAL")?;
        index.busy_timeout(std::time::Duration::from_millis(100))?;
        index.execute_batch(
            "CREATE TABLE IF NOT EXISTS block_file (
                hash TEXT NOT NULL,
                block_idx INTEGER NOT NULL,
                path TEXT NOT NULL,
                len INTEGER NOT NULL,
                atime INTEGER NOT NULL,
                PRIMARY KEY (hash, block_idx)
            );
            CREATE INDEX IF NOT EXISTS block_file_path ON block_file(path);",
        )?;

        let current: i64 = index.query_row("SELECT COALESCE(SUM(len), 0) FROM block_file", [], |r| r.get(0))?;

        Ok(BlockStore {
            blocks_root,
            block_size,
            max_bytes,
            current_bytes: AtomicU64::new(current as u64),
            next_atime: AtomicI64::new(0),
            index: Mutex::new(index),
            eviction_lock: Mutex::new(()),
            cache_debug,
        })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn hash_of(path: &BackendPath) -> u64 {
        djb2_hash64(path.as_str())
    }

    fn block_file_path(&self, hash: u64, idx: u64) -> PathBuf {
        let hex = format!("{hash:016x}");
        self.blocks_root
            .join(&hex[0..2])
            .join(&hex[2..4])
            .join(format!("{hex}-{idx}"))
    }

    /// Logical clock for recency ordering: an incrementing counter rather
    /// than wall-clock time, so two accesses in the same second still order
    /// correctly (and so tests don't need to sleep).
    fn tick(&self) -> i64 {
        self.next_atime.fetch_add(1, Ordering::Relaxed)
    }

    pub fn exists(&self, path: &BackendPath, idx: u64) -> bool {
        self.block_file_path(Self::hash_of(path), idx).exists()
    }

    pub fn read(&self, path: &BackendPath, idx: u64) -> Result<Option<Vec<u8>>, CacheError> {
        let hash = Self::hash_of(path);
        let file_path = self.block_file_path(hash, idx);
        match fs::read(&file_path) {
            Ok(data) => {
                let atime = self.tick();
                let index = self.index.lock().unwrap();
                index.execute(
                    "UPDATE block_file SET atime = ?1 WHERE hash = ?2 AND block_idx = ?3",
                    params![atime, format!("{hash:016x}"), idx as i64],
                )?;
                if self.cache_debug {
                    tracing::debug!(path = %path, block = idx, "block store hit");
                }
                Ok(Some(data))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if self.cache_debug {
                    tracing::debug!(path = %path, block = idx, "block store miss");
                }
                Ok(None)
            }
            Err(e) => Err(CacheError::Io(e)),
        }
    }

    /// Atomic replace: write to a sibling temp file, then rename over the
    /// final name, so no reader ever observes a partial block (spec.md §4.3,
    /// §5).
    pub fn write(&self, path: &BackendPath, idx: u64, data: &[u8]) -> Result<(), CacheError> {
        let hash = Self::hash_of(path);
        let file_path = self.block_file_path(hash, idx);
        let parent = file_path.parent().expect("block path always has a parent");
        fs::create_dir_all(parent)?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        std::io::Write::write_all(&mut tmp, data)?;
        tmp.persist(&file_path)
            .map_err(|e| CacheError::Io(e.error))?;

        let atime = self.tick();
        let hash_hex = format!("{hash:016x}");
        let old_len: i64 = {
            let index = self.index.lock().unwrap();
            let old_len: Option<i64> = index
                .query_row(
                    "SELECT len FROM block_file WHERE hash = ?1 AND block_idx = ?2",
                    params![hash_hex, idx as i64],
                    |r| r.get(0),
                )
                .ok();
            index.execute(
                "INSERT INTO block_file (hash, block_idx, path, len, atime) VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(hash, block_idx) DO UPDATE SET path=excluded.path, len=excluded.len, atime=excluded.atime",
                params![hash_hex, idx as i64, path.as_str(), data.len() as i64, atime],
            )?;
            old_len.unwrap_or(0)
        };

        let delta = data.len() as i64 - old_len;
        if delta >= 0 {
            self.current_bytes.fetch_add(delta as u64, Ordering::Relaxed);
        } else {
            self.current_bytes.fetch_sub((-delta) as u64, Ordering::Relaxed);
        }

        if self.cache_debug {
            tracing::debug!(path = %path, block = idx, len = data.len(), "block store write");
        }

        if self.max_bytes > 0 && self.current_bytes.load(Ordering::Relaxed) > self.max_bytes {
            self.evict()?;
        }
        Ok(())
    }

    /// Deletes every block whose byte range intersects `[file_offset, file_offset + length)`.
    pub fn invalidate_range(&self, path: &BackendPath, file_offset: u64, length: u64) -> Result<(), CacheError> {
        if length == 0 {
            return Ok(());
        }
        if self.cache_debug {
            tracing::debug!(path = %path, offset = file_offset, length, "block store invalidate range");
        }
        let (first, last) = block_span(file_offset, length, self.block_size);
        for idx in first..=last {
            self.delete_block(path, idx)?;
        }
        Ok(())
    }

    /// Deletes every block belonging to `path`.
    pub fn invalidate_file(&self, path: &BackendPath) -> Result<(), CacheError> {
        if self.cache_debug {
            tracing::debug!(path = %path, "block store invalidate file");
        }
        let hash_hex = format!("{:016x}", Self::hash_of(path));
        let indices: Vec<i64> = {
            let index = self.index.lock().unwrap();
            let mut stmt = index.prepare("SELECT block_idx FROM block_file WHERE hash = ?1")?;
            let rows = stmt.query_map(params![hash_hex], |r| r.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        for idx in indices {
            self.delete_block_by_hash(&hash_hex, idx as u64)?;
        }
        Ok(())
    }

    /// Deletes every block belonging to `prefix` or to any path nested under
    /// it, for rmdir/rename invalidating a whole subtree (mirrors
    /// `MetadataStore::invalidate_subtree`). Blocks are keyed by a hash of the
    /// full path, so unlike the metadata tables this requires the stored
    /// `path` column rather than a prefix-shaped key.
    pub fn invalidate_prefix(&self, prefix: &BackendPath) -> Result<(), CacheError> {
        if self.cache_debug {
            tracing::debug!(prefix = %prefix, "block store invalidate prefix");
        }
        let glob = format!("{}/*", prefix.as_str());
        let matches: Vec<(String, i64)> = {
            let index = self.index.lock().unwrap();
            let mut stmt = index.prepare("SELECT hash, block_idx FROM block_file WHERE path = ?1 OR path GLOB ?2")?;
            let rows = stmt.query_map(params![prefix.as_str(), glob], |r| Ok((r.get(0)?, r.get(1)?)))?;
            rows.collect::<Result<_, _>>()?
        };
        for (hash_hex, idx) in matches {
            self.delete_block_by_hash(&hash_hex, idx as u64)?;
        }
        Ok(())
    }

    fn delete_block(&self, path: &BackendPath, idx: u64) -> Result<(), CacheError> {
        let hash_hex = format!("{:016x}", Self::hash_of(path));
        self.delete_block_by_hash(&hash_hex, idx)
    }

    fn delete_block_by_hash(&self, hash_hex: &str, idx: u64) -> Result<(), CacheError> {
        let hash = u64::from_str_radix(hash_hex, 16).unwrap_or(0);
        let file_path = self.block_file_path(hash, idx);

        let removed_len: Option<i64> = {
            let index = self.index.lock().unwrap();
            let len: Option<i64> = index
                .query_row(
                    "SELECT len FROM block_file WHERE hash = ?1 AND block_idx = ?2",
                    params![hash_hex, idx as i64],
                    |r| r.get(0),
                )
                .ok();
            index.execute(
                "DELETE FROM block_file WHERE hash = ?1 AND block_idx = ?2",
                params![hash_hex, idx as i64],
            )?;
            len
        };

        match fs::remove_file(&file_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CacheError::Io(e)),
        }

        if let Some(len) = removed_len {
            self.current_bytes.fetch_sub(len as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn stats(&self) -> (u64, u64) {
        (self.current_bytes.load(Ordering::Relaxed), self.max_bytes)
    }

    /// Synchronous eviction pass: sort all known blocks by last access
    /// ascending, unlink oldest first until at or below 90% of budget
    /// (spec.md §4.3).
    fn evict(&self) -> Result<(), CacheError> {
        let _guard = self.eviction_lock.lock().unwrap();
        if self.max_bytes == 0 || self.current_bytes.load(Ordering::Relaxed) <= self.max_bytes {
            return Ok(());
        }
        let target = (self.max_bytes as f64 * EVICTION_TARGET_RATIO) as u64;
        let before = self.current_bytes.load(Ordering::Relaxed);

        let candidates: Vec<(String, i64, i64)> = {
            let index = self.index.lock().unwrap();
            let mut stmt = index.prepare("SELECT hash, block_idx, len FROM block_file ORDER BY atime ASC")?;
            let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?;
            rows.collect::<Result<_, _>>()?
        };

        for (hash_hex, idx, len) in candidates {
            if self.current_bytes.load(Ordering::Relaxed) <= target {
                break;
            }
            let hash = u64::from_str_radix(&hash_hex, 16).unwrap_or(0);
            let file_path = self.block_file_path(hash, idx as u64);
            {
                let index = self.index.lock().unwrap();
                index.execute(
                    "DELETE FROM block_file WHERE hash = ?1 AND block_idx = ?2",
                    params![hash_hex, idx],
                )?;
            }
            match fs::remove_file(&file_path) {
                Ok(()) => {
                    self.current_bytes.fetch_sub(len as u64, Ordering::Relaxed);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::Io(e)),
            }
        }
        if self.cache_debug {
            let after = self.current_bytes.load(Ordering::Relaxed);
            tracing::debug!(freed = before.saturating_sub(after), target, "block store evict");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_roundtrip() {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(dir.path(), 4, 0).unwrap();
        let path = BackendPath::new("/f");
        store.write(&path, 0, b"AAAA").unwrap();
        assert_eq!(store.read(&path, 0).unwrap().unwrap(), b"AAAA");
        assert!(store.exists(&path, 0));
        assert!(!store.exists(&path, 1));
    }

    #[test]
    fn invalidate_range_drops_overlapping_blocks_only() {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(dir.path(), 4, 0).unwrap();
        let path = BackendPath::new("/f");
        store.write(&path, 0, b"AAAA").unwrap();
        store.write(&path, 1, b"AAAA").unwrap();
        store.write(&path, 2, b"AAAA").unwrap();

        // write "ZZ" at offset 2 touches only block 0
        store.invalidate_range(&path, 2, 2).unwrap();

        assert!(!store.exists(&path, 0));
        assert!(store.exists(&path, 1));
        assert!(store.exists(&path, 2));
    }

    #[test]
    fn invalidate_file_drops_every_block() {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(dir.path(), 4, 0).unwrap();
        let path = BackendPath::new("/f");
        store.write(&path, 0, b"AAAA").unwrap();
        store.write(&path, 1, b"BBBB").unwrap();
        store.invalidate_file(&path).unwrap();
        assert!(!store.exists(&path, 0));
        assert!(!store.exists(&path, 1));
        assert_eq!(store.stats().0, 0);
    }

    #[test]
    fn invalidate_prefix_drops_nested_paths_but_not_siblings() {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(dir.path(), 4, 0).unwrap();
        let dir_path = BackendPath::new("/a");
        let nested = BackendPath::new("/a/b");
        let sibling = BackendPath::new("/ab");
        store.write(&dir_path, 0, b"AAAA").unwrap();
        store.write(&nested, 0, b"BBBB").unwrap();
        store.write(&sibling, 0, b"CCCC").unwrap();

        store.invalidate_prefix(&dir_path).unwrap();

        assert!(!store.exists(&dir_path, 0));
        assert!(!store.exists(&nested, 0));
        assert!(store.exists(&sibling, 0));
    }

    #[test]
    fn eviction_drops_oldest_block_under_budget() {
        // S5: block_size = 4096, max_cache_size = 8192.
        let dir = tempdir().unwrap();
        let store = BlockStore::open(dir.path(), 4096, 8192).unwrap();
        let path = BackendPath::new("/large");
        let block = vec![0u8; 4096];

        store.write(&path, 0, &block).unwrap();
        store.write(&path, 1, &block).unwrap();
        store.write(&path, 2, &block).unwrap(); // pushes current_bytes to 12288, triggers eviction

        let (current, _max) = store.stats();
        assert!(current <= (8192.0 * EVICTION_TARGET_RATIO) as u64);
        assert!(!store.exists(&path, 0));
        assert!(store.exists(&path, 1));
        assert!(store.exists(&path, 2));
    }

    #[test]
    fn reading_a_block_refreshes_its_recency() {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(dir.path(), 4096, 8192).unwrap();
        let path = BackendPath::new("/large");
        let block = vec![0u8; 4096];

        store.write(&path, 0, &block).unwrap();
        store.write(&path, 1, &block).unwrap();
        // touch block 0 so it is no longer the least-recently-used
        store.read(&path, 0).unwrap();
        store.write(&path, 2, &block).unwrap(); // triggers eviction

        assert!(store.exists(&path, 0));
        assert!(!store.exists(&path, 1));
        assert!(store.exists(&path, 2));
    }
}
