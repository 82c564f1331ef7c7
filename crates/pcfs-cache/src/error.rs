use thiserror::Error;

/// Cache-internal failures. Never surfaced to a gateway caller (spec.md §7):
/// callers see either a cache hit, a fresh backend answer, or — if the store
/// itself is unusable — pass-through behavior. This type exists so the
/// Coherence Engine can tell "transient contention" (retry/MISS) apart from
/// "structural failure" (disable caching for the mount).
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache store busy")]
    Busy,
    #[error("cache store corrupt or unusable: {0}")]
    Corrupt(String),
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache store error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl CacheError {
    /// Structural failures disable caching for the rest of the mount's
    /// lifetime (spec.md §4.4, §7 kind 4). Busy-timeout exhaustion does not:
    /// it degrades a single call to a MISS (spec.md §7 kind 3).
    pub fn is_structural(&self) -> bool {
        match self {
            CacheError::Busy => false,
            CacheError::Corrupt(_) => true,
            CacheError::Io(_) => true,
            CacheError::Sqlite(e) => !matches!(
                e,
                rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error {
                        code: rusqlite::ErrorCode::DatabaseBusy,
                        ..
                    },
                    _,
                )
            ),
        }
    }
}
