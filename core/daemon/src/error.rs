//! Error types for the store and the reconciler.

use rusqlite::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Write contention. The caller may retry the whole transaction.
    #[error("store is busy: {0}")]
    Transient(#[source] rusqlite::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[source] rusqlite::Error),

    #[error("Failed to create daemon data dir: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt process row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                StoreError::Transient(err)
            }
            _ => StoreError::Sqlite(err),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("reconcile gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: StoreError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_failure(code: i32) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None)
    }

    #[test]
    fn busy_and_locked_are_transient() {
        let busy: StoreError = sqlite_failure(rusqlite::ffi::SQLITE_BUSY).into();
        let locked: StoreError = sqlite_failure(rusqlite::ffi::SQLITE_LOCKED).into();
        assert!(busy.is_transient());
        assert!(locked.is_transient());
    }

    #[test]
    fn constraint_failures_are_not_transient() {
        let err: StoreError = sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT).into();
        assert!(!err.is_transient());
    }
}
