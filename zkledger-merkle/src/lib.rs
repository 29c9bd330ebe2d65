//! Merkle trees for the zkledger note/nullifier ledger.
//!
//! Two tree shapes share one [`HashStrategy`]:
//!
//! - [`DenseTree`]: an insertion-ordered, array-indexed tree over note
//!   ciphertexts. Leaves are appended; the final odd node of a level is paired
//!   with itself when its parent is computed.
//! - [`SparseTree`]: a fixed-depth, key-addressed tree over the 256-bit digest
//!   space. Untouched subtrees are never stored; they resolve to precomputed
//!   default hashes held in a [`SparseTreeConfig`].
//!
//! Neither tree knows about persistence. `zkledger-store` wraps both with a
//! mutex and a durable commit per mutation.

pub mod dense;
pub mod error;
pub mod hash;
pub mod sparse;

pub use dense::{DenseProof, DenseTree};
pub use error::TreeError;
pub use hash::{
    digest_from_hex, Blake3, Digest, HashKind, HashStrategy, Sha256, Sha3_256, DIGEST_LEN,
};
pub use sparse::{SparseProof, SparseTree, SparseTreeConfig, SparseUpdate, MAX_SPARSE_DEPTH};
