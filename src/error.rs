//! Error types for elevatr-sync

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A record the caller required does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The remote store could not be reached or rejected the call
    #[error("remote store unavailable: {0}")]
    RemoteUnavailable(String),

    /// Malformed identity, entity id or payload
    #[error("validation error: {0}")]
    Validation(String),

    /// One or more items failed during a guest to remote migration
    #[error("migration finished with {failed} failed item(s)")]
    PartialMigration { failed: usize },

    /// A queued operation was abandoned after too many attempts
    #[error("sync item {item_id} dropped after {attempts} attempts")]
    SyncExhausted { item_id: i64, attempts: u32 },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage lock poisoned")]
    LockPoisoned,
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::RemoteUnavailable(e.to_string())
    }
}

impl Error {
    /// True for failures that mean "the remote tier is out of reach"
    pub fn is_remote_unavailable(&self) -> bool {
        matches!(self, Error::RemoteUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
