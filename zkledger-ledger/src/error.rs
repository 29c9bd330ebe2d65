//! Ledger error type and its failure taxonomy.

use thiserror::Error;
use zkledger_merkle::TreeError;
use zkledger_store::StoreError;

use crate::{prover::ProverError, vault::CryptoError};

/// How a [`LedgerError`] should be handled by the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input such as an out-of-range index; retry with corrected input.
    Structural,
    /// Persisted or in-memory state is corrupt; the tree stops accepting writes.
    Integrity,
    /// A durable commit failed and was rolled back; safe to retry.
    Persistence,
    /// Expected business outcome, e.g. a double spend.
    Domain,
    /// An external collaborator (vault, proving backend) failed.
    Collaborator,
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error(transparent)]
    Structural(TreeError),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("persistence failure: {0}")]
    Persistence(StoreError),

    /// The note at `index` already has a nullifier.
    #[error("double spend: note {index} already nullified (nullifier {nullifier})")]
    DoubleSpend { index: usize, nullifier: String },

    /// The newest note is spent by the next record, not directly.
    #[error("note {index} is the newest note and is spent by the next record")]
    TipNote { index: usize },

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("prover error: {0}")]
    Prover(#[from] ProverError),

    #[error("unknown prover '{0}'")]
    UnknownProver(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::Structural(_)
            | LedgerError::TipNote { .. }
            | LedgerError::Codec(_)
            | LedgerError::Config(_) => ErrorKind::Structural,
            LedgerError::Integrity(_) | LedgerError::LockPoisoned(_) => ErrorKind::Integrity,
            LedgerError::Persistence(_) => ErrorKind::Persistence,
            LedgerError::DoubleSpend { .. } => ErrorKind::Domain,
            LedgerError::Crypto(_) | LedgerError::Prover(_) | LedgerError::UnknownProver(_) => {
                ErrorKind::Collaborator
            }
        }
    }
}

impl From<TreeError> for LedgerError {
    fn from(err: TreeError) -> Self {
        if err.is_integrity() {
            LedgerError::Integrity(err.to_string())
        } else {
            LedgerError::Structural(err)
        }
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Tree(tree) => tree.into(),
            StoreError::Codec(reason) => LedgerError::Codec(reason),
            StoreError::LockPoisoned(what) => LedgerError::LockPoisoned(what),
            err if err.is_integrity() => LedgerError::Integrity(err.to_string()),
            err => LedgerError::Persistence(err),
        }
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::Codec(err.to_string())
    }
}
