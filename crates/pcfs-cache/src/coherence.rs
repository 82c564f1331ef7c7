//! [MODULE D] Coherence Engine.
//!
//! Sole owner of "cache or backend?" and the write-through protocol
//! (spec.md §4.4). Every public method here is a direct translation of one
//! of the per-operation decision tables there; the cross-cutting
//! invalidation work that spec.md §9 calls out as scattered across call
//! sites in the source is centralized in `apply_mutation` below, the same
//! refactor the teacher's `Cache::invalidate_all_under_prefix` hints at but
//! never finishes.

use crate::blocks::BlockStore;
use crate::error::CacheError;
use crate::metadata::{AttrLookup, MetadataStore};
use pcfs_backend::BackendAdapter;
use pcfs_models::{block_span, block_start, now_seconds, AttrRecord, BackendError, BackendPath, CacheConfig, DirEntryRecord, DirListing, RawAttrs};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

enum MutationKind<'a> {
    Created(&'a BackendPath),
    Removed(&'a BackendPath),
    Renamed { src: &'a BackendPath, dst: &'a BackendPath },
    Written { path: &'a BackendPath, offset: u64, len: u64, grew_from_empty: bool },
    AttrChanged(&'a BackendPath),
    Truncated(&'a BackendPath),
}

pub struct CoherenceEngine<B: BackendAdapter> {
    backend: Arc<B>,
    meta: MetadataStore,
    blocks: BlockStore,
    config: CacheConfig,
    poisoned: AtomicBool,
}

impl<B: BackendAdapter> CoherenceEngine<B> {
    pub fn open(backend: Arc<B>, config: CacheConfig) -> Result<Self, CacheError> {
        fs::create_dir_all(&config.cache_root)?;
        let _ = fs::set_permissions(&config.cache_root, fs::Permissions::from_mode(0o700));
        let meta = MetadataStore::open(config.cache_root.join("metadata.db"))?;
        let blocks = BlockStore::open_with_debug(
            &config.cache_root,
            config.block_size_bytes,
            config.max_cache_size_bytes,
            config.cache_debug,
        )?;
        Ok(CoherenceEngine {
            backend,
            meta,
            blocks,
            config,
            poisoned: AtomicBool::new(false),
        })
    }

    /// Whether a structural store failure has already been observed. Once
    /// true, every method below degrades to pure pass-through (spec.md
    /// §4.4 "Failure fallback"); the Dispatcher also consults this to retire
    /// the engine entirely for the rest of the mount.
    pub fn poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Relaxed)
    }

    fn cache_available(&self) -> bool {
        !self.poisoned()
    }

    fn mark_poisoned(&self, err: &CacheError) {
        if err.is_structural() && !self.poisoned.swap(true, Ordering::Relaxed) {
            tracing::error!(error = %err, "cache store failure, disabling cache for remainder of mount");
        } else if !err.is_structural() {
            tracing::debug!(error = %err, "transient cache store error, treating call as a miss");
        }
    }

    // -- per-operation protocols (spec.md §4.4) --------------------------

    pub fn attr_query(&self, path: &BackendPath) -> Result<RawAttrs, BackendError> {
        if !self.cache_available() {
            return self.backend.stat(path);
        }
        let now = now_seconds();
        match self.meta.lookup_attr(path, now) {
            Ok(AttrLookup::Negative) => {
                if self.config.cache_debug {
                    tracing::debug!(path = %path, "metadata store negative hit");
                }
                Err(BackendError::NotFound(path.to_string()))
            }
            Ok(AttrLookup::Hit(record)) => {
                let live = self.backend.stat(path)?;
                if record.matches_live(live.mtime, live.size) {
                    if self.config.cache_debug {
                        tracing::debug!(path = %path, "metadata store hit");
                    }
                    Ok(RawAttrs {
                        ino: live.ino,
                        kind: record.kind,
                        size: record.size,
                        mtime: record.mtime,
                        ctime: record.ctime,
                        mode: record.mode,
                        uid: record.uid,
                        gid: record.gid,
                    })
                } else {
                    self.apply_mutation(MutationKind::Truncated(path));
                    self.store_fresh_attr(path, &live, now);
                    Ok(live)
                }
            }
            Ok(AttrLookup::Miss) => match self.backend.stat(path) {
                Ok(live) => {
                    if self.config.cache_debug {
                        tracing::debug!(path = %path, "metadata store miss");
                    }
                    self.store_fresh_attr(path, &live, now);
                    Ok(live)
                }
                Err(BackendError::NotFound(_)) => {
                    if let Err(e) = self.meta.put_negative(path, now, self.config.neg_ttl_seconds) {
                        self.mark_poisoned(&e);
                    }
                    Err(BackendError::NotFound(path.to_string()))
                }
                Err(e) => Err(e),
            },
            Err(e) => {
                self.mark_poisoned(&e);
                self.backend.stat(path)
            }
        }
    }

    fn store_fresh_attr(&self, path: &BackendPath, live: &RawAttrs, now: i64) {
        let record = AttrRecord::from_raw(live, now, self.config.meta_ttl_seconds);
        if let Err(e) = self.meta.put_attr(path, &record) {
            self.mark_poisoned(&e);
        }
    }

    pub fn dir_listing(&self, path: &BackendPath) -> Result<Vec<DirEntryRecord>, BackendError> {
        let raw = |backend: &B| -> Result<Vec<DirEntryRecord>, BackendError> {
            Ok(backend
                .read_dir(path)?
                .into_iter()
                .map(|(name, kind)| DirEntryRecord { name, kind })
                .collect())
        };
        if !self.cache_available() {
            return raw(&self.backend);
        }
        let now = now_seconds();
        let current = self.backend.stat(path)?;
        match self.meta.lookup_dir(path, now) {
            Ok(Some(listing)) if listing.parent_mtime == current.mtime => {
                if self.config.cache_debug {
                    tracing::debug!(path = %path, "directory listing hit");
                }
                return Ok(listing.entries);
            }
            Ok(_) => {}
            Err(e) => self.mark_poisoned(&e),
        }
        if self.config.cache_debug {
            tracing::debug!(path = %path, "directory listing miss");
        }
        let entries = raw(&self.backend)?;
        let listing = DirListing {
            parent_mtime: current.mtime,
            entries: entries.clone(),
            cached_at: now,
            valid_until: now + self.config.dir_ttl_seconds as i64,
        };
        if let Err(e) = self.meta.put_dir(path, &listing) {
            self.mark_poisoned(&e);
        }
        Ok(entries)
    }

    /// Close-to-open revalidation: the attribute-query protocol already
    /// invalidates blocks when it observes a stale (mtime, size) pair, so
    /// open only needs to run it and then hand back a live backend handle.
    pub fn open_file(&self, path: &BackendPath) -> Result<(u64, RawAttrs), BackendError> {
        let attrs = self.attr_query(path)?;
        let fh = self.backend.open(path)?;
        Ok((fh, attrs))
    }

    pub fn close_file(&self, fh: u64) -> Result<(), BackendError> {
        self.backend.close(fh)
    }

    pub fn read(&self, path: &BackendPath, fh: u64, offset: u64, length: u64) -> Result<Vec<u8>, BackendError> {
        if length == 0 {
            return Ok(Vec::new());
        }
        if !self.cache_available() {
            return self.backend.pread(fh, offset, length);
        }
        let block_size = self.blocks.block_size();
        let (first, last) = block_span(offset, length, block_size);
        let mut out = Vec::with_capacity(length as usize);
        let mut hit_eof = false;

        for idx in first..=last {
            if hit_eof {
                break;
            }
            let blk_start = block_start(idx, block_size);
            let block_data = match self.blocks.read(path, idx) {
                Ok(Some(data)) => data,
                Ok(None) => {
                    let fetched = self.backend.pread(fh, blk_start, block_size as u64)?;
                    if let Err(e) = self.blocks.write(path, idx, &fetched) {
                        self.mark_poisoned(&e);
                    }
                    fetched
                }
                Err(e) => {
                    self.mark_poisoned(&e);
                    self.backend.pread(fh, blk_start, block_size as u64)?
                }
            };

            if (block_data.len() as u64) < block_size as u64 {
                hit_eof = true;
            }

            let blk_end = blk_start + block_data.len() as u64;
            let want_start = offset.max(blk_start);
            let want_end = (offset + length).min(blk_end);
            if want_start >= want_end {
                continue;
            }
            let rel_start = (want_start - blk_start) as usize;
            let rel_end = (want_end - blk_start) as usize;
            out.extend_from_slice(&block_data[rel_start..rel_end]);
        }
        Ok(out)
    }

    pub fn write(&self, path: &BackendPath, fh: u64, buf: &[u8], offset: u64) -> Result<u64, BackendError> {
        let now = now_seconds();
        let grew_from_empty = if self.cache_available() {
            match self.meta.lookup_attr(path, now) {
                Ok(AttrLookup::Hit(record)) => record.size == 0,
                Ok(AttrLookup::Negative) | Ok(AttrLookup::Miss) => true,
                Err(e) => {
                    self.mark_poisoned(&e);
                    true
                }
            }
        } else {
            true
        };

        let written = self.backend.pwrite(fh, offset, buf)?;

        self.apply_mutation(MutationKind::Written {
            path,
            offset,
            len: written,
            grew_from_empty,
        });
        Ok(written)
    }

    pub fn create(&self, path: &BackendPath, mode: u32) -> Result<RawAttrs, BackendError> {
        let attrs = self.backend.create(path, mode)?;
        self.apply_mutation(MutationKind::Created(path));
        Ok(attrs)
    }

    pub fn mkdir(&self, path: &BackendPath, mode: u32) -> Result<RawAttrs, BackendError> {
        let attrs = self.backend.mkdir(path, mode)?;
        self.apply_mutation(MutationKind::Created(path));
        Ok(attrs)
    }

    pub fn symlink(&self, path: &BackendPath, target: &str) -> Result<RawAttrs, BackendError> {
        let attrs = self.backend.symlink(path, target)?;
        self.apply_mutation(MutationKind::Created(path));
        Ok(attrs)
    }

    pub fn link(&self, src: &BackendPath, dst: &BackendPath) -> Result<RawAttrs, BackendError> {
        let attrs = self.backend.link(src, dst)?;
        self.apply_mutation(MutationKind::Created(dst));
        Ok(attrs)
    }

    pub fn read_link(&self, path: &BackendPath) -> Result<String, BackendError> {
        self.backend.read_link(path)
    }

    pub fn unlink(&self, path: &BackendPath) -> Result<(), BackendError> {
        self.backend.unlink(path)?;
        self.apply_mutation(MutationKind::Removed(path));
        Ok(())
    }

    pub fn rmdir(&self, path: &BackendPath) -> Result<(), BackendError> {
        self.backend.rmdir(path)?;
        self.apply_mutation(MutationKind::Removed(path));
        Ok(())
    }

    pub fn rename(&self, src: &BackendPath, dst: &BackendPath) -> Result<(), BackendError> {
        self.backend.rename(src, dst)?;
        self.apply_mutation(MutationKind::Renamed { src, dst });
        Ok(())
    }

    pub fn truncate(&self, path: &BackendPath, size: u64) -> Result<RawAttrs, BackendError> {
        let attrs = self.backend.truncate(path, size)?;
        self.apply_mutation(MutationKind::Truncated(path));
        Ok(attrs)
    }

    pub fn set_mode(&self, path: &BackendPath, mode: u32) -> Result<RawAttrs, BackendError> {
        let attrs = self.backend.set_mode(path, mode)?;
        self.apply_mutation(MutationKind::AttrChanged(path));
        Ok(attrs)
    }

    pub fn set_owner(&self, path: &BackendPath, uid: Option<u32>, gid: Option<u32>) -> Result<RawAttrs, BackendError> {
        let attrs = self.backend.set_owner(path, uid, gid)?;
        self.apply_mutation(MutationKind::AttrChanged(path));
        Ok(attrs)
    }

    pub fn stats(&self) -> (u64, u64) {
        self.blocks.stats()
    }

    // -- single post-mutation invalidation hook --------------------------

    /// Every mutating operation above funnels its cache side effects through
    /// here, keyed by what kind of mutation happened, instead of each
    /// call site repeating its own ad-hoc sequence of invalidations.
    fn apply_mutation(&self, kind: MutationKind) {
        if !self.cache_available() {
            return;
        }
        match kind {
            MutationKind::Created(path) => {
                self.invalidate_attr(path);
                self.invalidate_parent_dir(path);
            }
            MutationKind::Removed(path) => {
                self.invalidate_attr(path);
                self.invalidate_blocks(path);
                self.invalidate_dir(path);
                self.invalidate_parent_dir(path);
            }
            MutationKind::Renamed { src, dst } => {
                self.invalidate_subtree(src);
                self.invalidate_subtree(dst);
                self.invalidate_block_prefix(src);
                self.invalidate_block_prefix(dst);
                self.invalidate_parent_dir(src);
                self.invalidate_parent_dir(dst);
            }
            MutationKind::Written { path, offset, len, grew_from_empty } => {
                if let Err(e) = self.blocks.invalidate_range(path, offset, len) {
                    self.mark_poisoned(&e);
                }
                self.invalidate_attr(path);
                if grew_from_empty {
                    self.invalidate_parent_dir(path);
                }
            }
            MutationKind::AttrChanged(path) => {
                self.invalidate_attr(path);
            }
            MutationKind::Truncated(path) => {
                self.invalidate_attr(path);
                self.invalidate_blocks(path);
            }
        }
    }

    fn invalidate_attr(&self, path: &BackendPath) {
        if self.config.cache_debug {
            tracing::debug!(path = %path, "invalidate attr");
        }
        if let Err(e) = self.meta.invalidate_attr(path) {
            self.mark_poisoned(&e);
        }
    }

    fn invalidate_dir(&self, path: &BackendPath) {
        if self.config.cache_debug {
            tracing::debug!(path = %path, "invalidate dir");
        }
        if let Err(e) = self.meta.invalidate_dir(path) {
            self.mark_poisoned(&e);
        }
    }

    fn invalidate_parent_dir(&self, path: &BackendPath) {
        if let Some(parent) = path.parent() {
            self.invalidate_dir(&parent);
        }
    }

    fn invalidate_subtree(&self, path: &BackendPath) {
        if self.config.cache_debug {
            tracing::debug!(path = %path, "invalidate subtree");
        }
        if let Err(e) = self.meta.invalidate_subtree(path) {
            self.mark_poisoned(&e);
        }
    }

    fn invalidate_blocks(&self, path: &BackendPath) {
        if let Err(e) = self.blocks.invalidate_file(path) {
            self.mark_poisoned(&e);
        }
    }

    /// Unlike `invalidate_blocks`, also clears blocks belonging to any path
    /// nested under `path` — needed when a renamed directory takes its whole
    /// cached subtree with it (spec.md §1 P1: cached content must never
    /// diverge from the backend).
    fn invalidate_block_prefix(&self, path: &BackendPath) {
        if let Err(e) = self.blocks.invalidate_prefix(path) {
            self.mark_poisoned(&e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcfs_backend::PosixBackend;
    use tempfile::tempdir;

    fn engine() -> (tempfile::TempDir, tempfile::TempDir, CoherenceEngine<PosixBackend>) {
        let backend_dir = tempdir().unwrap();
        let cache_dir = tempdir().unwrap();
        let backend = Arc::new(PosixBackend::new(backend_dir.path(), cache_dir.path()).unwrap());
        let config = CacheConfig {
            cache_root: cache_dir.path().to_path_buf(),
            block_size_bytes: 4,
            ..CacheConfig::default()
        };
        let engine = CoherenceEngine::open(backend, config).unwrap();
        (backend_dir, cache_dir, engine)
    }

    #[test]
    fn s1_metadata_hit_after_miss() {
        let (backend_dir, _cache_dir, engine) = engine();
        let path = BackendPath::new(backend_dir.path().join("a.txt").to_str().unwrap());
        engine.backend.create(&path, 0o644).unwrap();
        let fh = engine.backend.open(&path).unwrap();
        engine.backend.pwrite(fh, 0, b"hello world").unwrap();
        engine.backend.close(fh).unwrap();

        let first = engine.attr_query(&path).unwrap();
        let second = engine.attr_query(&path).unwrap();
        assert_eq!(first.size, 11);
        assert_eq!(second.size, 11);
        assert_eq!(first.ino, second.ino);
    }

    #[test]
    fn s2_write_through_invalidates_only_touched_block() {
        let (backend_dir, _cache_dir, engine) = engine();
        let path = BackendPath::new(backend_dir.path().join("f").to_str().unwrap());
        engine.backend.create(&path, 0o644).unwrap();
        let fh = engine.backend.open(&path).unwrap();
        engine.backend.pwrite(fh, 0, b"AAAAAAAA").unwrap();

        let data = engine.read(&path, fh, 0, 8).unwrap();
        assert_eq!(&data, b"AAAAAAAA");

        engine.write(&path, fh, b"ZZ", 2).unwrap();
        let data = engine.read(&path, fh, 0, 8).unwrap();
        assert_eq!(&data, b"AAZZAAAA");
        engine.backend.close(fh).unwrap();
    }

    #[test]
    fn s3_negative_then_create_clears_it() {
        let (backend_dir, _cache_dir, engine) = engine();
        let path = BackendPath::new(backend_dir.path().join("new").to_str().unwrap());
        let err = engine.attr_query(&path).unwrap_err();
        assert!(matches!(err, BackendError::NotFound(_)));

        engine.create(&path, 0o644).unwrap();
        let attrs = engine.attr_query(&path).unwrap();
        assert_eq!(attrs.mode & 0o777, 0o644);
    }

    #[test]
    fn s4_directory_mtime_revalidation() {
        let (backend_dir, _cache_dir, engine) = engine();
        let dir = BackendPath::new(backend_dir.path().to_str().unwrap());
        engine
            .create(&BackendPath::new(backend_dir.path().join("x").to_str().unwrap()), 0o644)
            .unwrap();
        engine
            .create(&BackendPath::new(backend_dir.path().join("y").to_str().unwrap()), 0o644)
            .unwrap();

        let first = engine.dir_listing(&dir).unwrap();
        assert_eq!(first.len(), 2);

        // external mutation bumps parent mtime without going through the engine
        engine.backend.create(&BackendPath::new(backend_dir.path().join("z").to_str().unwrap()), 0o644).unwrap();

        let second = engine.dir_listing(&dir).unwrap();
        assert_eq!(second.len(), 3);
    }

    #[test]
    fn rename_invalidates_both_sides() {
        let (backend_dir, _cache_dir, engine) = engine();
        let src = BackendPath::new(backend_dir.path().join("src").to_str().unwrap());
        let dst = BackendPath::new(backend_dir.path().join("dst").to_str().unwrap());
        engine.create(&src, 0o644).unwrap();
        engine.attr_query(&src).unwrap();

        engine.rename(&src, &dst).unwrap();

        let err = engine.attr_query(&src).unwrap_err();
        assert!(matches!(err, BackendError::NotFound(_)));
        assert!(engine.attr_query(&dst).is_ok());
    }

    #[test]
    fn renaming_a_directory_drops_cached_blocks_of_nested_files() {
        let (backend_dir, _cache_dir, engine) = engine();
        let src_dir = backend_dir.path().join("src_dir");
        engine.backend.mkdir(&BackendPath::new(src_dir.to_str().unwrap()), 0o755).unwrap();
        let nested = BackendPath::new(src_dir.join("f").to_str().unwrap());
        engine.backend.create(&nested, 0o644).unwrap();
        let fh = engine.backend.open(&nested).unwrap();
        engine.backend.pwrite(fh, 0, b"AAAA").unwrap();
        engine.backend.close(fh).unwrap();
        // populate the block cache for the nested file
        let fh = engine.backend.open(&nested).unwrap();
        engine.read(&nested, fh, 0, 4).unwrap();
        engine.backend.close(fh).unwrap();
        assert!(engine.blocks.exists(&nested, 0));

        let dst_dir = BackendPath::new(backend_dir.path().join("dst_dir").to_str().unwrap());
        engine.rename(&BackendPath::new(src_dir.to_str().unwrap()), &dst_dir).unwrap();

        assert!(!engine.blocks.exists(&nested, 0));
    }
}
