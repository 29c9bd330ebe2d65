//! Error types for the record store and the persistent tree wrappers.

use thiserror::Error;
use zkledger_merkle::TreeError;

/// Errors raised while reading, writing or reloading persisted trees.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The sled database reported a failure.
    #[error("backend error: {0}")]
    Backend(#[from] sled::Error),

    /// A commit that was expected to write at least one row wrote none.
    #[error("commit affected no rows: {0}")]
    NoRowsAffected(String),

    /// A persisted record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Persisted state does not reproduce a valid tree.
    #[error("integrity violation in tree '{tree}': {reason}")]
    Integrity { tree: String, reason: String },

    /// The tree recorded an integrity failure and refuses further writes.
    #[error("tree '{0}' is frozen after an integrity failure")]
    Frozen(String),

    /// The store was switched to read-only.
    #[error("record store is read-only")]
    ReadOnly,

    #[error("invalid tree id '{0}'")]
    InvalidTreeId(String),

    /// Error from the in-memory tree itself.
    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error("lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl StoreError {
    pub(crate) fn integrity(tree: &str, reason: impl Into<String>) -> Self {
        StoreError::Integrity {
            tree: tree.to_string(),
            reason: reason.into(),
        }
    }

    /// True when the error means persisted or in-memory state is corrupt.
    pub fn is_integrity(&self) -> bool {
        match self {
            StoreError::Integrity { .. } | StoreError::Frozen(_) => true,
            StoreError::Tree(err) => err.is_integrity(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Codec(err.to_string())
    }
}

impl From<hex::FromHexError> for StoreError {
    fn from(err: hex::FromHexError) -> Self {
        StoreError::Codec(err.to_string())
    }
}
