//! [MODULE A] Backend Adapter.
//!
//! A thin, stateless interface over the backing POSIX path: stat, readdir,
//! open/pread/pwrite, create/mkdir/symlink/link/unlink/rmdir/rename, close.
//! No caching decisions are made here — every failure surfaces the backend's
//! error unchanged (spec.md §4.1), the same contract the teacher's
//! `HttpBackend` implements against a remote server instead of a local path.

use pcfs_models::{BackendError, BackendPath, EntryKind, RawAttrs};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::{FileExt, MetadataExt, PermissionsExt};
use std::os::unix::fs::symlink as unix_symlink;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Operations a pass-through cache engine can issue against the backing
/// filesystem. Implementors must not cache anything themselves.
pub trait BackendAdapter: Send + Sync {
    fn stat(&self, path: &BackendPath) -> Result<RawAttrs, BackendError>;
    fn read_dir(&self, path: &BackendPath) -> Result<Vec<(String, EntryKind)>, BackendError>;

    fn open(&self, path: &BackendPath) -> Result<u64, BackendError>;
    fn pread(&self, handle: u64, offset: u64, len: u64) -> Result<Vec<u8>, BackendError>;
    fn pwrite(&self, handle: u64, offset: u64, buf: &[u8]) -> Result<u64, BackendError>;
    fn close(&self, handle: u64) -> Result<(), BackendError>;

    fn create(&self, path: &BackendPath, mode: u32) -> Result<RawAttrs, BackendError>;
    fn mkdir(&self, path: &BackendPath, mode: u32) -> Result<RawAttrs, BackendError>;
    fn symlink(&self, path: &BackendPath, target: &str) -> Result<RawAttrs, BackendError>;
    fn read_link(&self, path: &BackendPath) -> Result<String, BackendError>;
    fn link(&self, src: &BackendPath, dst: &BackendPath) -> Result<RawAttrs, BackendError>;
    fn unlink(&self, path: &BackendPath) -> Result<(), BackendError>;
    fn rmdir(&self, path: &BackendPath) -> Result<(), BackendError>;
    fn rename(&self, old: &BackendPath, new: &BackendPath) -> Result<RawAttrs, BackendError>;
    fn truncate(&self, path: &BackendPath, size: u64) -> Result<RawAttrs, BackendError>;
    fn set_mode(&self, path: &BackendPath, mode: u32) -> Result<RawAttrs, BackendError>;
    fn set_owner(
        &self,
        path: &BackendPath,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> Result<RawAttrs, BackendError>;
}

/// A POSIX directory backend. `BackendPath`s it is handed are real, absolute
/// paths on local disk (or on whatever is mounted there — SMB/NFS look like
/// an ordinary local path to this adapter, per spec.md §1).
pub struct PosixBackend {
    root: PathBuf,
    handles: Mutex<HashMap<u64, File>>,
    next_fh: AtomicU64,
}

impl PosixBackend {
    /// Builds a backend rooted at `backend_root`. Refuses construction if
    /// `cache_root` lives inside `backend_root` (spec.md §9 open question:
    /// the cache must never be nested inside the thing it caches, or the
    /// mount becomes self-referential).
    pub fn new(backend_root: impl AsRef<Path>, cache_root: impl AsRef<Path>) -> Result<Self, BackendError> {
        let root = fs::canonicalize(backend_root.as_ref()).map_err(BackendError::Io)?;
        if let Ok(cache_root) = fs::canonicalize(cache_root.as_ref()) {
            if cache_root.starts_with(&root) {
                return Err(BackendError::Other(format!(
                    "cache_root {:?} must not be nested inside backend root {:?}",
                    cache_root, root
                )));
            }
        }
        Ok(PosixBackend {
            root,
            handles: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn map_io(path: &BackendPath, err: std::io::Error) -> BackendError {
        BackendError::from_io(path, err)
    }

    fn raw_attrs_of(path: &BackendPath, meta: &fs::Metadata) -> RawAttrs {
        let kind = if meta.file_type().is_dir() {
            EntryKind::Dir
        } else if meta.file_type().is_symlink() {
            EntryKind::Symlink
        } else if meta.file_type().is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        };
        let _ = path;
        RawAttrs {
            ino: meta.ino(),
            kind,
            size: meta.size(),
            mtime: meta.mtime(),
            ctime: meta.ctime(),
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
        }
    }

    fn stat_path(path: &BackendPath) -> Result<RawAttrs, BackendError> {
        let meta = fs::symlink_metadata(path.as_str()).map_err(|e| Self::map_io(path, e))?;
        Ok(Self::raw_attrs_of(path, &meta))
    }
}

impl BackendAdapter for PosixBackend {
    fn stat(&self, path: &BackendPath) -> Result<RawAttrs, BackendError> {
        Self::stat_path(path)
    }

    fn read_dir(&self, path: &BackendPath) -> Result<Vec<(String, EntryKind)>, BackendError> {
        let rd = fs::read_dir(path.as_str()).map_err(|e| Self::map_io(path, e))?;
        let mut out = Vec::new();
        for entry in rd {
            let entry = entry.map_err(|e| Self::map_io(path, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let file_type = entry.file_type().map_err(|e| Self::map_io(path, e))?;
            let kind = if file_type.is_dir() {
                EntryKind::Dir
            } else if file_type.is_symlink() {
                EntryKind::Symlink
            } else if file_type.is_file() {
                EntryKind::File
            } else {
                EntryKind::Other
            };
            out.push((name, kind));
        }
        Ok(out)
    }

    fn open(&self, path: &BackendPath) -> Result<u64, BackendError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_str())
            .or_else(|_| OpenOptions::new().read(true).open(path.as_str()))
            .map_err(|e| Self::map_io(path, e))?;
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().unwrap().insert(fh, file);
        Ok(fh)
    }

    fn pread(&self, handle: u64, offset: u64, len: u64) -> Result<Vec<u8>, BackendError> {
        let handles = self.handles.lock().unwrap();
        let file = handles
            .get(&handle)
            .ok_or_else(|| BackendError::InvalidArgument("unknown file handle".into()))?;
        let mut buf = vec![0u8; len as usize];
        let mut total = 0usize;
        loop {
            match file.read_at(&mut buf[total..], offset + total as u64) {
                Ok(0) => break,
                Ok(n) => {
                    total += n;
                    if total == buf.len() {
                        break;
                    }
                }
                Err(e) => return Err(BackendError::Io(e)),
            }
        }
        buf.truncate(total);
        Ok(buf)
    }

    fn pwrite(&self, handle: u64, offset: u64, buf: &[u8]) -> Result<u64, BackendError> {
        let handles = self.handles.lock().unwrap();
        let file = handles
            .get(&handle)
            .ok_or_else(|| BackendError::InvalidArgument("unknown file handle".into()))?;
        let mut total = 0usize;
        while total < buf.len() {
            let n = file
                .write_at(&buf[total..], offset + total as u64)
                .map_err(BackendError::Io)?;
            if n == 0 {
                return Err(BackendError::Io(std::io::Error::from(std::io::ErrorKind::WriteZero)));
            }
            total += n;
        }
        Ok(total as u64)
    }

    fn close(&self, handle: u64) -> Result<(), BackendError> {
        self.handles.lock().unwrap().remove(&handle);
        Ok(())
    }

    fn create(&self, path: &BackendPath, mode: u32) -> Result<RawAttrs, BackendError> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path.as_str())
            .map_err(|e| Self::map_io(path, e))?;
        file.set_permissions(fs::Permissions::from_mode(mode))
            .map_err(BackendError::Io)?;
        Self::stat_path(path)
    }

    fn mkdir(&self, path: &BackendPath, mode: u32) -> Result<RawAttrs, BackendError> {
        fs::create_dir(path.as_str()).map_err(|e| Self::map_io(path, e))?;
        fs::set_permissions(path.as_str(), fs::Permissions::from_mode(mode))
            .map_err(BackendError::Io)?;
        Self::stat_path(path)
    }

    fn symlink(&self, path: &BackendPath, target: &str) -> Result<RawAttrs, BackendError> {
        unix_symlink(target, path.as_str()).map_err(|e| Self::map_io(path, e))?;
        Self::stat_path(path)
    }

    fn link(&self, src: &BackendPath, dst: &BackendPath) -> Result<RawAttrs, BackendError> {
        fs::hard_link(src.as_str(), dst.as_str()).map_err(|e| Self::map_io(dst, e))?;
        Self::stat_path(dst)
    }

    fn read_link(&self, path: &BackendPath) -> Result<String, BackendError> {
        let target = fs::read_link(path.as_str()).map_err(|e| Self::map_io(path, e))?;
        target
            .to_str()
            .map(str::to_owned)
            .ok_or_else(|| BackendError::InvalidArgument("symlink target is not valid UTF-8".into()))
    }

    fn unlink(&self, path: &BackendPath) -> Result<(), BackendError> {
        fs::remove_file(path.as_str()).map_err(|e| Self::map_io(path, e))
    }

    fn rmdir(&self, path: &BackendPath) -> Result<(), BackendError> {
        fs::remove_dir(path.as_str()).map_err(|e| Self::map_io(path, e))
    }

    fn rename(&self, old: &BackendPath, new: &BackendPath) -> Result<RawAttrs, BackendError> {
        fs::rename(old.as_str(), new.as_str()).map_err(|e| Self::map_io(old, e))?;
        Self::stat_path(new)
    }

    fn truncate(&self, path: &BackendPath, size: u64) -> Result<RawAttrs, BackendError> {
        let file = OpenOptions::new()
            .write(true)
            .open(path.as_str())
            .map_err(|e| Self::map_io(path, e))?;
        file.set_len(size).map_err(BackendError::Io)?;
        Self::stat_path(path)
    }

    fn set_mode(&self, path: &BackendPath, mode: u32) -> Result<RawAttrs, BackendError> {
        fs::set_permissions(path.as_str(), fs::Permissions::from_mode(mode))
            .map_err(|e| Self::map_io(path, e))?;
        Self::stat_path(path)
    }

    fn set_owner(
        &self,
        path: &BackendPath,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> Result<RawAttrs, BackendError> {
        // SAFETY: chown is a thin libc wrapper; -1 (via `u32::MAX` cast through
        // libc's `uid_t`/`gid_t`) means "leave unchanged", matching POSIX chown(2).
        let c_path = std::ffi::CString::new(path.as_str())
            .map_err(|_| BackendError::InvalidArgument("path contains NUL".into()))?;
        let uid = uid.map(|u| u as libc::uid_t).unwrap_or(u32::MAX as libc::uid_t);
        let gid = gid.map(|g| g as libc::gid_t).unwrap_or(u32::MAX as libc::gid_t);
        let rc = unsafe { libc::chown(c_path.as_ptr(), uid, gid) };
        if rc != 0 {
            return Err(Self::map_io(path, std::io::Error::last_os_error()));
        }
        Self::stat_path(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn backend() -> (tempfile::TempDir, PosixBackend) {
        let dir = tempdir().unwrap();
        let cache = tempdir().unwrap();
        let backend = PosixBackend::new(dir.path(), cache.path()).unwrap();
        (dir, backend)
    }

    #[test]
    fn refuses_cache_root_nested_in_backend_root() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("cache");
        fs::create_dir(&nested).unwrap();
        let err = PosixBackend::new(dir.path(), &nested).unwrap_err();
        assert!(matches!(err, BackendError::Other(_)));
    }

    #[test]
    fn create_stat_write_read_roundtrip() {
        let (dir, backend) = backend();
        let path = BackendPath::new(dir.path().join("f.txt").to_str().unwrap());
        backend.create(&path, 0o644).unwrap();
        let fh = backend.open(&path).unwrap();
        backend.pwrite(fh, 0, b"hello world").unwrap();
        let data = backend.pread(fh, 0, 11).unwrap();
        assert_eq!(&data, b"hello world");
        backend.close(fh).unwrap();

        let attrs = backend.stat(&path).unwrap();
        assert_eq!(attrs.size, 11);
        assert_eq!(attrs.kind, EntryKind::File);
    }

    #[test]
    fn read_dir_lists_children() {
        let (dir, backend) = backend();
        let root = BackendPath::new(dir.path().to_str().unwrap());
        let file_path = BackendPath::new(dir.path().join("a").to_str().unwrap());
        backend.create(&file_path, 0o644).unwrap();
        let dir_path = BackendPath::new(dir.path().join("b").to_str().unwrap());
        backend.mkdir(&dir_path, 0o755).unwrap();

        let mut entries = backend.read_dir(&root).unwrap();
        entries.sort();
        assert_eq!(
            entries,
            vec![("a".to_string(), EntryKind::File), ("b".to_string(), EntryKind::Dir)]
        );
    }

    #[test]
    fn unlink_then_stat_not_found() {
        let (dir, backend) = backend();
        let path = BackendPath::new(dir.path().join("f").to_str().unwrap());
        backend.create(&path, 0o644).unwrap();
        backend.unlink(&path).unwrap();
        let err = backend.stat(&path).unwrap_err();
        assert!(matches!(err, BackendError::NotFound(_)));
    }
}
