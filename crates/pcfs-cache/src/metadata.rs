//! [MODULE B] Metadata Store.
//!
//! Persistent mapping from backend path to cached attributes, negative
//! entries, and directory listings, with TTLs (spec.md §4.2). Backed by
//! `rusqlite` in WAL mode — an embedded transactional store with durable
//! writes and prepared parameterized queries, the same role the
//! `amoffat-supertag` FUSE cache in the retrieval pack uses `rusqlite` for.
//!
//! One connection is shared by all threads behind a mutex (spec.md §5,
//! "Shared-resource policy"): SQLite's own WAL journaling is what gives
//! single-writer/multi-reader semantics, the mutex here only serializes Rust
//! callers onto that one connection.

use crate::error::CacheError;
use pcfs_models::{AttrRecord, BackendPath, DirEntryRecord, DirListing, EntryKind};
use rusqlite::{params, Connection, OptionalExtension};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Mutex;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS attribute (
    path TEXT PRIMARY KEY,
    kind INTEGER NOT NULL,
    size INTEGER NOT NULL,
    mtime INTEGER NOT NULL,
    ctime INTEGER NOT NULL,
    mode INTEGER NOT NULL,
    uid INTEGER NOT NULL,
    gid INTEGER NOT NULL,
    cached_at INTEGER NOT NULL,
    valid_until INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS negative (
    path TEXT PRIMARY KEY,
    cached_at INTEGER NOT NULL,
    valid_until INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS directory_listing (
    dir_path TEXT PRIMARY KEY,
    dir_mtime INTEGER NOT NULL,
    entries_json TEXT NOT NULL,
    cached_at INTEGER NOT NULL,
    valid_until INTEGER NOT NULL
);
"#;

fn kind_to_int(kind: EntryKind) -> i64 {
    match kind {
        EntryKind::File => 0,
        EntryKind::Dir => 1,
        EntryKind::Symlink => 2,
        EntryKind::Other => 3,
    }
}

fn kind_from_int(v: i64) -> EntryKind {
    match v {
        1 => EntryKind::Dir,
        2 => EntryKind::Symlink,
        3 => EntryKind::Other,
        _ => EntryKind::File,
    }
}

/// Result of a `lookup_attr` call, distinguishing a positive hit from a
/// cached negative entry from a plain miss (spec.md §4.2/§4.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrLookup {
    Hit(AttrRecord),
    Negative,
    Miss,
}

pub struct MetadataStore {
    conn: Mutex<Connection>,
}

impl MetadataStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let db_path = db_path.as_ref();
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_millis(100))?;
        conn.execute_batch(SCHEMA)?;
        if let Ok(meta) = std::fs::metadata(db_path) {
            let mut perms = meta.permissions();
            perms.set_mode(0o600);
            let _ = std::fs::set_permissions(db_path, perms);
        }
        Ok(MetadataStore {
            conn: Mutex::new(conn),
        })
    }

    pub fn lookup_attr(&self, path: &BackendPath, now: i64) -> Result<AttrLookup, CacheError> {
        let conn = self.conn.lock().unwrap();
        let row: Option<AttrRecord> = conn
            .query_row(
                "SELECT kind, size, mtime, ctime, mode, uid, gid, cached_at, valid_until \
                 FROM attribute WHERE path = ?1",
                params![path.as_str()],
                |r| {
                    Ok(AttrRecord {
                        kind: kind_from_int(r.get(0)?),
                        size: r.get::<_, i64>(1)? as u64,
                        mtime: r.get(2)?,
                        ctime: r.get(3)?,
                        mode: r.get::<_, i64>(4)? as u32,
                        uid: r.get::<_, i64>(5)? as u32,
                        gid: r.get::<_, i64>(6)? as u32,
                        cached_at: r.get(7)?,
                        valid_until: r.get(8)?,
                    })
                },
            )
            .optional()?;

        if let Some(record) = row {
            return Ok(if record.is_valid(now) {
                AttrLookup::Hit(record)
            } else {
                AttrLookup::Miss
            });
        }

        let neg_valid_until: Option<i64> = conn
            .query_row(
                "SELECT valid_until FROM negative WHERE path = ?1",
                params![path.as_str()],
                |r| r.get(0),
            )
            .optional()?;

        match neg_valid_until {
            Some(valid_until) if valid_until > now => Ok(AttrLookup::Negative),
            Some(_) => Ok(AttrLookup::Miss),
            None => Ok(AttrLookup::Miss),
        }
    }

    /// Stores a fresh attribute record, clearing any negative entry at the
    /// same path (spec.md invariant 4).
    pub fn put_attr(&self, path: &BackendPath, record: &AttrRecord) -> Result<(), CacheError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM negative WHERE path = ?1", params![path.as_str()])?;
        conn.execute(
            "INSERT INTO attribute (path, kind, size, mtime, ctime, mode, uid, gid, cached_at, valid_until) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
             ON CONFLICT(path) DO UPDATE SET \
               kind=excluded.kind, size=excluded.size, mtime=excluded.mtime, ctime=excluded.ctime, \
               mode=excluded.mode, uid=excluded.uid, gid=excluded.gid, \
               cached_at=excluded.cached_at, valid_until=excluded.valid_until",
            params![
                path.as_str(),
                kind_to_int(record.kind),
                record.size as i64,
                record.mtime,
                record.ctime,
                record.mode as i64,
                record.uid as i64,
                record.gid as i64,
                record.cached_at,
                record.valid_until,
            ],
        )?;
        Ok(())
    }

    /// Stores a negative entry, clearing any positive attribute record at the
    /// same path (spec.md invariant 2: at most one of the two can hold).
    pub fn put_negative(&self, path: &BackendPath, now: i64, ttl_neg: u64) -> Result<(), CacheError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM attribute WHERE path = ?1", params![path.as_str()])?;
        conn.execute(
            "INSERT INTO negative (path, cached_at, valid_until) VALUES (?1, ?2, ?3) \
             ON CONFLICT(path) DO UPDATE SET cached_at=excluded.cached_at, valid_until=excluded.valid_until",
            params![path.as_str(), now, now + ttl_neg as i64],
        )?;
        Ok(())
    }

    pub fn invalidate_attr(&self, path: &BackendPath) -> Result<(), CacheError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM attribute WHERE path = ?1", params![path.as_str()])?;
        conn.execute("DELETE FROM negative WHERE path = ?1", params![path.as_str()])?;
        Ok(())
    }

    /// Invalidates the attribute/negative/listing rows for `prefix` and
    /// everything nested under it, used by rmdir/rename (spec.md's
    /// `invalidate_all_under_prefix` in the teacher's in-memory cache).
    pub fn invalidate_subtree(&self, prefix: &BackendPath) -> Result<(), CacheError> {
        let glob = format!("{}/*", prefix.as_str());
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM attribute WHERE path = ?1 OR path GLOB ?2",
            params![prefix.as_str(), glob],
        )?;
        conn.execute(
            "DELETE FROM negative WHERE path = ?1 OR path GLOB ?2",
            params![prefix.as_str(), glob],
        )?;
        conn.execute(
            "DELETE FROM directory_listing WHERE dir_path = ?1 OR dir_path GLOB ?2",
            params![prefix.as_str(), glob],
        )?;
        Ok(())
    }

    pub fn lookup_dir(&self, path: &BackendPath, now: i64) -> Result<Option<DirListing>, CacheError> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(i64, String, i64, i64)> = conn
            .query_row(
                "SELECT dir_mtime, entries_json, cached_at, valid_until FROM directory_listing WHERE dir_path = ?1",
                params![path.as_str()],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()?;

        let Some((dir_mtime, entries_json, cached_at, valid_until)) = row else {
            return Ok(None);
        };
        if valid_until <= now {
            return Ok(None);
        }
        let entries: Vec<DirEntryRecord> = serde_json::from_str(&entries_json)
            .map_err(|e| CacheError::Corrupt(e.to_string()))?;
        Ok(Some(DirListing {
            parent_mtime: dir_mtime,
            entries,
            cached_at,
            valid_until,
        }))
    }

    /// Atomic replace: a single row is inserted/updated in one statement, so
    /// observers never see a partial listing (spec.md §4.2 requirement).
    pub fn put_dir(&self, path: &BackendPath, listing: &DirListing) -> Result<(), CacheError> {
        let entries_json =
            serde_json::to_string(&listing.entries).map_err(|e| CacheError::Corrupt(e.to_string()))?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO directory_listing (dir_path, dir_mtime, entries_json, cached_at, valid_until) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(dir_path) DO UPDATE SET \
               dir_mtime=excluded.dir_mtime, entries_json=excluded.entries_json, \
               cached_at=excluded.cached_at, valid_until=excluded.valid_until",
            params![
                path.as_str(),
                listing.parent_mtime,
                entries_json,
                listing.cached_at,
                listing.valid_until,
            ],
        )?;
        Ok(())
    }

    pub fn invalidate_dir(&self, path: &BackendPath) -> Result<(), CacheError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM directory_listing WHERE dir_path = ?1",
            params![path.as_str()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcfs_models::now_seconds;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, MetadataStore) {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(dir.path().join("metadata.db")).unwrap();
        (dir, store)
    }

    fn sample_record(now: i64) -> AttrRecord {
        AttrRecord {
            kind: EntryKind::File,
            size: 11,
            mtime: 100,
            ctime: 100,
            mode: 0o644,
            uid: 0,
            gid: 0,
            cached_at: now,
            valid_until: now + 5,
        }
    }

    #[test]
    fn miss_then_hit_then_expired() {
        let (_dir, store) = store();
        let now = now_seconds();
        let path = BackendPath::new("/a.txt");
        assert_eq!(store.lookup_attr(&path, now).unwrap(), AttrLookup::Miss);

        store.put_attr(&path, &sample_record(now)).unwrap();
        assert_eq!(
            store.lookup_attr(&path, now).unwrap(),
            AttrLookup::Hit(sample_record(now))
        );
        assert_eq!(store.lookup_attr(&path, now + 10).unwrap(), AttrLookup::Miss);
    }

    #[test]
    fn negative_then_put_attr_clears_it() {
        let (_dir, store) = store();
        let now = now_seconds();
        let path = BackendPath::new("/missing");
        store.put_negative(&path, now, 2).unwrap();
        assert_eq!(store.lookup_attr(&path, now).unwrap(), AttrLookup::Negative);

        store.put_attr(&path, &sample_record(now)).unwrap();
        assert_eq!(
            store.lookup_attr(&path, now).unwrap(),
            AttrLookup::Hit(sample_record(now))
        );
    }

    #[test]
    fn put_attr_clears_negative_and_vice_versa() {
        let (_dir, store) = store();
        let now = now_seconds();
        let path = BackendPath::new("/x");
        store.put_attr(&path, &sample_record(now)).unwrap();
        store.put_negative(&path, now, 2).unwrap();
        assert_eq!(store.lookup_attr(&path, now).unwrap(), AttrLookup::Negative);
    }

    #[test]
    fn dir_listing_roundtrip_and_invalidate() {
        let (_dir, store) = store();
        let now = now_seconds();
        let path = BackendPath::new("/dir");
        let listing = DirListing {
            parent_mtime: 42,
            entries: vec![
                DirEntryRecord { name: "a".into(), kind: EntryKind::File },
                DirEntryRecord { name: "b".into(), kind: EntryKind::Dir },
            ],
            cached_at: now,
            valid_until: now + 10,
        };
        store.put_dir(&path, &listing).unwrap();
        let got = store.lookup_dir(&path, now).unwrap().unwrap();
        assert_eq!(got.entries, listing.entries);

        store.invalidate_dir(&path).unwrap();
        assert!(store.lookup_dir(&path, now).unwrap().is_none());
    }

    #[test]
    fn invalidate_subtree_clears_nested_entries() {
        let (_dir, store) = store();
        let now = now_seconds();
        store.put_attr(&BackendPath::new("/a"), &sample_record(now)).unwrap();
        store
            .put_attr(&BackendPath::new("/a/b"), &sample_record(now))
            .unwrap();
        store
            .put_attr(&BackendPath::new("/ab"), &sample_record(now))
            .unwrap();

        store.invalidate_subtree(&BackendPath::new("/a")).unwrap();

        assert_eq!(
            store.lookup_attr(&BackendPath::new("/a"), now).unwrap(),
            AttrLookup::Miss
        );
        assert_eq!(
            store.lookup_attr(&BackendPath::new("/a/b"), now).unwrap(),
            AttrLookup::Miss
        );
        // sibling path that merely shares a prefix string must survive
        assert!(matches!(
            store.lookup_attr(&BackendPath::new("/ab"), now).unwrap(),
            AttrLookup::Hit(_)
        ));
    }
}
