//! Shared types for the pass-through cache filesystem.
//!
//! This crate has no I/O of its own: it is the leaf dependency every other
//! crate in the workspace builds on, the same role `rfs-models` played for
//! the remote-filesystem client this workspace was grown from.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Default block size for the Block Store (spec.md §6).
pub const DEFAULT_BLOCK_SIZE: u32 = 262_144;
pub const DEFAULT_META_TTL_SECONDS: u64 = 5;
pub const DEFAULT_DIR_TTL_SECONDS: u64 = 10;
pub const DEFAULT_NEG_TTL_SECONDS: u64 = 2;

/// A canonical absolute path on the backing filesystem.
///
/// Produced only by the Dispatcher's translation step; the Coherence Engine
/// and the stores accept only `BackendPath`, never a gateway-visible path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BackendPath(String);

impl BackendPath {
    pub fn new(path: impl Into<String>) -> Self {
        let mut s = path.into();
        if s.len() > 1 && s.ends_with('/') {
            s.pop();
        }
        if s.is_empty() {
            s.push('/');
        }
        BackendPath(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn parent(&self) -> Option<BackendPath> {
        let p = Path::new(&self.0).parent()?;
        let p = p.to_str()?;
        if p.is_empty() {
            Some(BackendPath::new("/"))
        } else {
            Some(BackendPath::new(p))
        }
    }

    pub fn join(&self, name: &str) -> BackendPath {
        if self.0 == "/" {
            BackendPath::new(format!("/{name}"))
        } else {
            BackendPath::new(format!("{}/{name}", self.0))
        }
    }

    /// Whether `self` is `other` or lives underneath it, used to invalidate an
    /// entire subtree on rmdir/rename (spec.md "invalidate_all_under_prefix").
    pub fn is_under_prefix(&self, prefix: &BackendPath) -> bool {
        Path::new(&self.0).starts_with(Path::new(&prefix.0))
    }
}

impl std::fmt::Display for BackendPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BackendPath {
    fn from(s: &str) -> Self {
        BackendPath::new(s)
    }
}

impl From<String> for BackendPath {
    fn from(s: String) -> Self {
        BackendPath::new(s)
    }
}

impl AsRef<Path> for BackendPath {
    fn as_ref(&self) -> &Path {
        Path::new(&self.0)
    }
}

/// Kind of a cached filesystem entry. NEGATIVE is not a variant here: a
/// negative entry is represented by the *absence* of an `AttrRecord` paired
/// with a row in the store's negative-entries table (see pcfs-cache).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    Other,
}

/// The live result of a backend `stat`, including the inode. Never persisted
/// as-is: the inode field is deliberately separate from `AttrRecord` so that
/// call sites cannot accidentally cache it (spec.md §3: "the inode number is
/// NOT stored").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawAttrs {
    pub ino: u64,
    pub kind: EntryKind,
    pub size: u64,
    pub mtime: i64,
    pub ctime: i64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// Cached attribute record (spec.md §3). Carries no inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrRecord {
    pub kind: EntryKind,
    pub size: u64,
    pub mtime: i64,
    pub ctime: i64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub cached_at: i64,
    pub valid_until: i64,
}

impl AttrRecord {
    pub fn from_raw(raw: &RawAttrs, cached_at: i64, ttl_seconds: u64) -> Self {
        AttrRecord {
            kind: raw.kind,
            size: raw.size,
            mtime: raw.mtime,
            ctime: raw.ctime,
            mode: raw.mode,
            uid: raw.uid,
            gid: raw.gid,
            cached_at,
            valid_until: cached_at + ttl_seconds as i64,
        }
    }

    pub fn is_valid(&self, now: i64) -> bool {
        self.valid_until > now
    }

    /// Whether a freshly observed (mtime, size) pair still matches this
    /// record (spec.md §4.4 step 3).
    pub fn matches_live(&self, mtime: i64, size: u64) -> bool {
        self.mtime == mtime && self.size == size
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntryRecord {
    pub name: String,
    pub kind: EntryKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirListing {
    pub parent_mtime: i64,
    pub entries: Vec<DirEntryRecord>,
    pub cached_at: i64,
    pub valid_until: i64,
}

impl DirListing {
    pub fn is_valid(&self, now: i64) -> bool {
        self.valid_until > now
    }
}

/// Resolves a read span into the block index covering `offset` and the one
/// covering `offset + len - 1`.
pub fn block_span(offset: u64, len: u64, block_size: u32) -> (u64, u64) {
    let block_size = block_size as u64;
    let first = offset / block_size;
    let last = (offset + len.saturating_sub(1)) / block_size;
    (first, last)
}

pub fn block_start(index: u64, block_size: u32) -> u64 {
    index * block_size as u64
}

pub fn block_index(offset: u64, block_size: u32) -> u64 {
    offset / block_size as u64
}

/// Current wall-clock time as seconds since the epoch, for TTL comparisons.
pub fn now_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Configuration surface enumerated in spec.md §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub cache_root: PathBuf,
    pub meta_ttl_seconds: u64,
    pub dir_ttl_seconds: u64,
    pub neg_ttl_seconds: u64,
    pub block_size_bytes: u32,
    pub max_cache_size_bytes: u64,
    pub cache_debug: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            cache_root: PathBuf::new(),
            meta_ttl_seconds: DEFAULT_META_TTL_SECONDS,
            dir_ttl_seconds: DEFAULT_DIR_TTL_SECONDS,
            neg_ttl_seconds: DEFAULT_NEG_TTL_SECONDS,
            block_size_bytes: DEFAULT_BLOCK_SIZE,
            max_cache_size_bytes: 0,
            cache_debug: false,
        }
    }
}

impl CacheConfig {
    /// Validates the surface that can make the mount unsafe or nonsensical:
    /// block size must be a power of two >= 4096 (spec.md §6).
    pub fn validate(&self) -> Result<(), String> {
        if self.block_size_bytes < 4096 || !self.block_size_bytes.is_power_of_two() {
            return Err(format!(
                "block_size_bytes must be a power of two >= 4096, got {}",
                self.block_size_bytes
            ));
        }
        Ok(())
    }
}

/// Errors surfaced by the Backend Adapter. These are the only errors ever
/// visible to a gateway caller (spec.md §7 propagation policy); cache-internal
/// failures never take this shape.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("other backend error: {0}")]
    Other(String),
}

impl BackendError {
    pub fn from_io(path: &BackendPath, err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            NotFound => BackendError::NotFound(path.to_string()),
            PermissionDenied => BackendError::PermissionDenied(path.to_string()),
            AlreadyExists => BackendError::AlreadyExists(path.to_string()),
            _ => BackendError::Io(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_path_normalizes_trailing_slash() {
        assert_eq!(BackendPath::new("/a/b/").as_str(), "/a/b");
        assert_eq!(BackendPath::new("/").as_str(), "/");
    }

    #[test]
    fn backend_path_parent() {
        assert_eq!(BackendPath::new("/a/b").parent(), Some(BackendPath::new("/a")));
        assert_eq!(BackendPath::new("/a").parent(), Some(BackendPath::new("/")));
    }

    #[test]
    fn backend_path_prefix() {
        let prefix = BackendPath::new("/a/b");
        assert!(BackendPath::new("/a/b/c").is_under_prefix(&prefix));
        assert!(BackendPath::new("/a/b").is_under_prefix(&prefix));
        assert!(!BackendPath::new("/a/bc").is_under_prefix(&prefix));
    }

    #[test]
    fn block_span_computation() {
        assert_eq!(block_span(0, 8, 4), (0, 1));
        assert_eq!(block_span(2, 2, 4), (0, 0));
        assert_eq!(block_span(4, 1, 4), (1, 1));
    }
}
