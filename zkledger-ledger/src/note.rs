//! Note payloads.

use serde::{Deserialize, Serialize};
use zkledger_merkle::Digest;
use zkledger_store::record::hex_bytes;

use crate::LedgerError;

/// Sparse-tree key marking a note as spent: the digest of its plaintext.
pub type NullifierKey = Digest;

/// A generated proof together with the witness it was proven against.
///
/// The JSON encoding is the note plaintext that gets encrypted into the dense
/// tree and, once spent, stored as the nullifier value. Field order is fixed
/// so identical notes always produce identical plaintext.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Note {
    #[serde(with = "hex_bytes")]
    pub proof: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub witness: Vec<u8>,
}

impl Note {
    pub fn new(proof: impl Into<Vec<u8>>, witness: impl Into<Vec<u8>>) -> Self {
        Self {
            proof: proof.into(),
            witness: witness.into(),
        }
    }

    pub fn to_plaintext(&self) -> Result<Vec<u8>, LedgerError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_plaintext(bytes: &[u8]) -> Result<Self, LedgerError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
