//! Shared database error types.

use bibsync_core::BibEntry;
use thiserror::Error;

/// Both sides of a refused update.
#[derive(Debug, Clone)]
pub struct OfflineLockConflict {
    /// The local entry that was about to be pushed.
    pub local: BibEntry,
    /// The entry as currently stored in the shared database.
    pub shared: BibEntry,
}

/// Shared database operation errors.
#[derive(Debug, Error)]
pub enum SharedError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Core(#[from] bibsync_core::Error),

    /// The database still uses the table layout of JabRef 3.5 or older.
    #[error("shared database uses an unsupported pre-3.6 table layout")]
    DatabaseNotSupported,

    #[error(
        "update refused: shared entry {} is at version {}, local copy is at version {}",
        .0.shared.shared_data().shared_id(),
        .0.shared.shared_data().version(),
        .0.local.shared_data().version()
    )]
    OfflineLock(Box<OfflineLockConflict>),

    #[error("notification error: {0}")]
    Notification(String),

    #[cfg(feature = "oracle")]
    #[error("oracle error: {0}")]
    Oracle(#[from] ::oracle::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SharedError {
    pub(crate) fn offline_lock(local: BibEntry, shared: BibEntry) -> Self {
        Self::OfflineLock(Box::new(OfflineLockConflict { local, shared }))
    }

    /// Vendor error code reported by the driver, if any.
    pub fn database_code(&self) -> Option<String> {
        match self {
            Self::Database(sqlx::Error::Database(err)) => err.code().map(|code| code.into_owned()),
            #[cfg(feature = "oracle")]
            Self::Oracle(err) => err.db_error().map(|db| format!("ORA-{:05}", db.code())),
            _ => None,
        }
    }
}

/// Result type for shared database operations.
pub type SharedResult<T> = std::result::Result<T, SharedError>;
