//! [MODULE E] Operation Dispatcher.
//!
//! Fronts the kernel gateway's `fuser::Filesystem` callbacks: translates
//! gateway-visible inode numbers to backend paths, calls the Coherence
//! Engine, and maps error conditions back onto the gateway's error channel
//! (spec.md §4.5). The inode table and the lazy cache-initialization state
//! machine live here, the same split of responsibility the teacher's
//! `RemoteFS` keeps between its own path/handle bookkeeping and the
//! backend it drives.

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyWrite, Request,
};
use libc::{EACCES, EEXIST, EINVAL, EIO, ENOENT};
use pcfs_backend::BackendAdapter;
use pcfs_cache::CoherenceEngine;
use pcfs_models::{BackendError, BackendPath, CacheConfig, EntryKind, RawAttrs};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const ROOT_INO: u64 = 1;

fn map_error(error: &BackendError) -> libc::c_int {
    match error {
        BackendError::NotFound(_) => ENOENT,
        BackendError::PermissionDenied(_) => EACCES,
        BackendError::AlreadyExists(_) => EEXIST,
        BackendError::InvalidArgument(_) => EINVAL,
        BackendError::Io(e) => e.raw_os_error().unwrap_or(EIO),
        BackendError::Other(_) => EIO,
    }
}

fn secs_to_systemtime(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs((-secs) as u64)
    }
}

fn raw_to_file_attr(raw: &RawAttrs, block_size: u32) -> FileAttr {
    let kind = match raw.kind {
        EntryKind::File => FileType::RegularFile,
        EntryKind::Dir => FileType::Directory,
        EntryKind::Symlink => FileType::Symlink,
        EntryKind::Other => FileType::RegularFile,
    };
    let mtime = secs_to_systemtime(raw.mtime);
    let ctime = secs_to_systemtime(raw.ctime);
    FileAttr {
        ino: raw.ino,
        size: raw.size,
        blocks: raw.size.div_ceil(512),
        atime: mtime,
        mtime,
        ctime,
        crtime: ctime,
        kind,
        perm: (raw.mode & 0o7777) as u16,
        nlink: 1,
        uid: raw.uid,
        gid: raw.gid,
        rdev: 0,
        blksize: block_size,
        flags: 0,
    }
}

enum DispatcherState<B: BackendAdapter> {
    Uninit,
    Ready(Arc<CoherenceEngine<B>>),
    Disabled,
}

/// Translates gateway inode numbers to backend paths and drives the
/// Coherence Engine, with the lazy UNINIT -> INITIALIZING -> READY ->
/// DISABLED state machine from spec.md §4.5.
pub struct PassThroughFs<B: BackendAdapter> {
    backend: Arc<B>,
    config: CacheConfig,
    state: RwLock<DispatcherState<B>>,
    paths: Mutex<HashMap<u64, BackendPath>>,
}

impl<B: BackendAdapter> PassThroughFs<B> {
    pub fn new(backend: Arc<B>, config: CacheConfig, root_path: BackendPath) -> Self {
        let mut paths = HashMap::new();
        paths.insert(ROOT_INO, root_path);
        PassThroughFs {
            backend,
            config,
            state: RwLock::new(DispatcherState::Uninit),
            paths: Mutex::new(paths),
        }
    }

    fn meta_ttl(&self) -> Duration {
        Duration::from_secs(self.config.meta_ttl_seconds)
    }

    fn dir_ttl(&self) -> Duration {
        Duration::from_secs(self.config.dir_ttl_seconds)
    }

    fn block_size(&self) -> u32 {
        self.config.block_size_bytes
    }

    /// Lazily constructs the Coherence Engine on first use; on structural
    /// failure, or once an already-open engine reports itself poisoned,
    /// permanently retires it so every later call skips straight to the
    /// backend (spec.md §4.5 DISABLED state).
    fn engine(&self) -> Option<Arc<CoherenceEngine<B>>> {
        {
            let guard = self.state.read().unwrap();
            match &*guard {
                DispatcherState::Ready(engine) if !engine.poisoned() => return Some(Arc::clone(engine)),
                DispatcherState::Disabled => return None,
                DispatcherState::Ready(_) => {}
                DispatcherState::Uninit => {}
            }
        }

        let mut guard = self.state.write().unwrap();
        let is_poisoned_ready = matches!(&*guard, DispatcherState::Ready(engine) if engine.poisoned());
        if is_poisoned_ready {
            *guard = DispatcherState::Disabled;
        }
        match &*guard {
            DispatcherState::Uninit => match CoherenceEngine::open(Arc::clone(&self.backend), self.config.clone()) {
                Ok(engine) => {
                    let engine = Arc::new(engine);
                    *guard = DispatcherState::Ready(Arc::clone(&engine));
                    Some(engine)
                }
                Err(err) => {
                    tracing::error!(error = %err, "cache store unavailable, mount running pass-through only");
                    *guard = DispatcherState::Disabled;
                    None
                }
            },
            DispatcherState::Ready(engine) => Some(Arc::clone(engine)),
            DispatcherState::Disabled => None,
        }
    }

    fn path_of(&self, ino: u64) -> Option<BackendPath> {
        self.paths.lock().unwrap().get(&ino).cloned()
    }

    fn remember(&self, ino: u64, path: BackendPath) {
        self.paths.lock().unwrap().insert(ino, path);
    }

    fn attr_query(&self, path: &BackendPath) -> Result<RawAttrs, BackendError> {
        match self.engine() {
            Some(engine) => engine.attr_query(path),
            None => self.backend.stat(path),
        }
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Option<BackendPath> {
        let parent_path = self.path_of(parent)?;
        Some(parent_path.join(&name.to_string_lossy()))
    }
}

impl<B: BackendAdapter> Filesystem for PassThroughFs<B> {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(ENOENT);
            return;
        };
        match self.attr_query(&path) {
            Ok(raw) => {
                self.remember(raw.ino, path);
                reply.entry(&self.meta_ttl(), &raw_to_file_attr(&raw, self.block_size()), 0);
            }
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.path_of(ino) else {
            reply.error(ENOENT);
            return;
        };
        match self.attr_query(&path) {
            Ok(raw) => {
                let ttl = if raw.kind == EntryKind::Dir { self.dir_ttl() } else { self.meta_ttl() };
                reply.attr(&ttl, &raw_to_file_attr(&raw, self.block_size()));
            }
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let Some(path) = self.path_of(ino) else {
            reply.error(ENOENT);
            return;
        };
        let entries = match self.engine() {
            Some(engine) => engine.dir_listing(&path),
            None => self
                .backend
                .read_dir(&path)
                .map(|v| v.into_iter().map(|(name, kind)| pcfs_models::DirEntryRecord { name, kind }).collect()),
        };
        let entries = match entries {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(map_error(&e));
                return;
            }
        };

        let start = offset.max(0) as usize;
        // The inode handed to `reply.add` here is advisory only: the kernel
        // always follows up with a real lookup() before trusting it, so we
        // don't pay for a per-entry stat just to populate it (that would
        // defeat the point of caching the listing at all).
        for (i, entry) in entries.iter().enumerate().skip(start) {
            let ftype = match entry.kind {
                EntryKind::File => FileType::RegularFile,
                EntryKind::Dir => FileType::Directory,
                EntryKind::Symlink => FileType::Symlink,
                EntryKind::Other => FileType::RegularFile,
            };
            if reply.add(ROOT_INO, (i as i64) + 1, ftype, &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(ENOENT);
            return;
        };
        let result = match self.engine() {
            Some(engine) => engine.create(&path, mode & 0o7777),
            None => self.backend.create(&path, mode & 0o7777),
        };
        match result {
            Ok(raw) => {
                self.remember(raw.ino, path.clone());
                let fh = match self.engine() {
                    Some(engine) => engine.open_file(&path).map(|(fh, _)| fh),
                    None => self.backend.open(&path),
                };
                match fh {
                    Ok(fh) => reply.created(&self.meta_ttl(), &raw_to_file_attr(&raw, self.block_size()), 0, fh, 0),
                    Err(e) => reply.error(map_error(&e)),
                }
            }
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn mkdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, mode: u32, _umask: u32, reply: ReplyEntry) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(ENOENT);
            return;
        };
        let result = match self.engine() {
            Some(engine) => engine.mkdir(&path, mode & 0o7777),
            None => self.backend.mkdir(&path, mode & 0o7777),
        };
        match result {
            Ok(raw) => {
                self.remember(raw.ino, path);
                reply.entry(&self.dir_ttl(), &raw_to_file_attr(&raw, self.block_size()), 0);
            }
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        link: &std::path::Path,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(ENOENT);
            return;
        };
        let target = link.to_string_lossy();
        let result = match self.engine() {
            Some(engine) => engine.symlink(&path, &target),
            None => self.backend.symlink(&path, &target),
        };
        match result {
            Ok(raw) => {
                self.remember(raw.ino, path);
                reply.entry(&self.meta_ttl(), &raw_to_file_attr(&raw, self.block_size()), 0);
            }
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn link(&mut self, _req: &Request<'_>, ino: u64, new_parent: u64, new_name: &OsStr, reply: ReplyEntry) {
        let (Some(src), Some(dst)) = (self.path_of(ino), self.child_path(new_parent, new_name)) else {
            reply.error(ENOENT);
            return;
        };
        let result = match self.engine() {
            Some(engine) => engine.link(&src, &dst),
            None => self.backend.link(&src, &dst),
        };
        match result {
            Ok(raw) => {
                self.remember(raw.ino, dst);
                reply.entry(&self.meta_ttl(), &raw_to_file_attr(&raw, self.block_size()), 0);
            }
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(path) = self.path_of(ino) else {
            reply.error(ENOENT);
            return;
        };
        let result = match self.engine() {
            Some(engine) => engine.read_link(&path),
            None => self.backend.read_link(&path),
        };
        match result {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(ENOENT);
            return;
        };
        let result = match self.engine() {
            Some(engine) => engine.unlink(&path),
            None => self.backend.unlink(&path),
        };
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(ENOENT);
            return;
        };
        let result = match self.engine() {
            Some(engine) => engine.rmdir(&path),
            None => self.backend.rmdir(&path),
        };
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(src), Some(dst)) = (self.child_path(parent, name), self.child_path(new_parent, new_name)) else {
            reply.error(ENOENT);
            return;
        };
        let result = match self.engine() {
            Some(engine) => engine.rename(&src, &dst),
            None => self.backend.rename(&src, &dst).map(|_| ()),
        };
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_of(ino) else {
            reply.error(ENOENT);
            return;
        };
        let result = match self.engine() {
            Some(engine) => engine.open_file(&path).map(|(fh, _)| fh),
            None => self.backend.open(&path),
        };
        match result {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(ENOENT);
            return;
        };
        if offset < 0 {
            reply.error(EINVAL);
            return;
        }
        let result = match self.engine() {
            Some(engine) => engine.read(&path, fh, offset as u64, size as u64),
            None => self.backend.pread(fh, offset as u64, size as u64),
        };
        match result {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(ENOENT);
            return;
        };
        if offset < 0 {
            reply.error(EINVAL);
            return;
        }
        let result = match self.engine() {
            Some(engine) => engine.write(&path, fh, data, offset as u64),
            None => self.backend.pwrite(fh, offset as u64, data),
        };
        match result {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let result = match self.engine() {
            Some(engine) => engine.close_file(fh),
            None => self.backend.close(fh),
        };
        match result {
            Ok(()) => reply.ok(),
            Err(_) => reply.ok(), // close never surfaces an error to the gateway
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        // Writes are write-through (spec.md §4.4): there is nothing buffered
        // here to flush.
        reply.ok();
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(ENOENT);
            return;
        };

        let mut latest: Option<RawAttrs> = None;
        macro_rules! apply {
            ($call:expr) => {
                match $call {
                    Ok(raw) => latest = Some(raw),
                    Err(e) => {
                        reply.error(map_error(&e));
                        return;
                    }
                }
            };
        }

        if let Some(size) = size {
            apply!(match self.engine() {
                Some(engine) => engine.truncate(&path, size),
                None => self.backend.truncate(&path, size),
            });
        }
        if let Some(mode) = mode {
            apply!(match self.engine() {
                Some(engine) => engine.set_mode(&path, mode & 0o7777),
                None => self.backend.set_mode(&path, mode & 0o7777),
            });
        }
        if uid.is_some() || gid.is_some() {
            apply!(match self.engine() {
                Some(engine) => engine.set_owner(&path, uid, gid),
                None => self.backend.set_owner(&path, uid, gid),
            });
        }

        let raw = match latest {
            Some(raw) => raw,
            None => match self.attr_query(&path) {
                Ok(raw) => raw,
                Err(e) => {
                    reply.error(map_error(&e));
                    return;
                }
            },
        };
        let ttl = if raw.kind == EntryKind::Dir { self.dir_ttl() } else { self.meta_ttl() };
        reply.attr(&ttl, &raw_to_file_attr(&raw, self.block_size()));
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, _nlookup: u64) {
        if ino != ROOT_INO {
            self.paths.lock().unwrap().remove(&ino);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcfs_backend::PosixBackend;
    use tempfile::tempdir;

    fn fs() -> (tempfile::TempDir, tempfile::TempDir, PassThroughFs<PosixBackend>) {
        let backend_dir = tempdir().unwrap();
        let cache_dir = tempdir().unwrap();
        let backend = Arc::new(PosixBackend::new(backend_dir.path(), cache_dir.path()).unwrap());
        let config = CacheConfig {
            cache_root: cache_dir.path().to_path_buf(),
            ..CacheConfig::default()
        };
        let root = BackendPath::new(backend_dir.path().to_str().unwrap());
        let fs = PassThroughFs::new(backend, config, root);
        (backend_dir, cache_dir, fs)
    }

    #[test]
    fn root_inode_resolves_to_backend_root() {
        let (backend_dir, _cache_dir, fs) = fs();
        let path = fs.path_of(ROOT_INO).unwrap();
        assert_eq!(path.as_str(), backend_dir.path().to_str().unwrap());
    }

    #[test]
    fn lazy_engine_initializes_once() {
        let (_backend_dir, _cache_dir, fs) = fs();
        assert!(matches!(*fs.state.read().unwrap(), DispatcherState::Uninit));
        let engine1 = fs.engine().unwrap();
        assert!(matches!(*fs.state.read().unwrap(), DispatcherState::Ready(_)));
        let engine2 = fs.engine().unwrap();
        assert!(Arc::ptr_eq(&engine1, &engine2));
    }

    #[test]
    fn non_root_mapping_can_be_removed() {
        let (backend_dir, _cache_dir, fs) = fs();
        let path = BackendPath::new(backend_dir.path().join("a").to_str().unwrap());
        fs.remember(42, path);
        assert!(fs.path_of(42).is_some());
        fs.paths.lock().unwrap().remove(&42);
        assert!(fs.path_of(42).is_none());
    }
}
