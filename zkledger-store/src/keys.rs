//! Row key layout.
//!
//! ```text
//! dense/<tree>/leaf/<u64 BE index>   DenseLeafRecord (JSON)
//! sparse/<tree>/node/<hash>          left || right (64 bytes)
//! sparse/<tree>/value/<key>          value bytes
//! sparse/<tree>/meta                 SparseMetaRecord (JSON)
//! prover/<id>                        ProverRecord (JSON)
//! ```
//!
//! Big-endian indices keep dense leaves in insertion order under a prefix scan.

use zkledger_merkle::Digest;

use crate::StoreError;

/// Tree ids become path segments, so they must be non-empty and slash-free.
pub fn validate_tree_id(tree: &str) -> Result<(), StoreError> {
    if tree.is_empty() || tree.contains('/') {
        return Err(StoreError::InvalidTreeId(tree.to_string()));
    }
    Ok(())
}

pub fn dense_root(tree: &str) -> Vec<u8> {
    format!("dense/{tree}/").into_bytes()
}

pub fn dense_leaf_prefix(tree: &str) -> Vec<u8> {
    format!("dense/{tree}/leaf/").into_bytes()
}

pub fn dense_leaf(tree: &str, index: u64) -> Vec<u8> {
    let mut key = dense_leaf_prefix(tree);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

pub fn sparse_root(tree: &str) -> Vec<u8> {
    format!("sparse/{tree}/").into_bytes()
}

pub fn sparse_node_prefix(tree: &str) -> Vec<u8> {
    format!("sparse/{tree}/node/").into_bytes()
}

pub fn sparse_node(tree: &str, hash: &Digest) -> Vec<u8> {
    let mut key = sparse_node_prefix(tree);
    key.extend_from_slice(hash);
    key
}

pub fn sparse_value_prefix(tree: &str) -> Vec<u8> {
    format!("sparse/{tree}/value/").into_bytes()
}

pub fn sparse_value(tree: &str, key: &Digest) -> Vec<u8> {
    let mut row = sparse_value_prefix(tree);
    row.extend_from_slice(key);
    row
}

pub fn sparse_meta(tree: &str) -> Vec<u8> {
    format!("sparse/{tree}/meta").into_bytes()
}

pub fn prover_prefix() -> Vec<u8> {
    b"prover/".to_vec()
}

pub fn prover(id: &str) -> Vec<u8> {
    format!("prover/{id}").into_bytes()
}

/// The 32-byte suffix of a node or value row key.
pub fn digest_suffix(prefix: &[u8], row: &[u8]) -> Result<Digest, StoreError> {
    row.strip_prefix(prefix)
        .and_then(|suffix| <Digest>::try_from(suffix).ok())
        .ok_or_else(|| StoreError::Codec(format!("malformed row key 0x{}", hex::encode(row))))
}

/// The big-endian index suffix of a dense leaf row key.
pub fn index_suffix(prefix: &[u8], row: &[u8]) -> Result<u64, StoreError> {
    row.strip_prefix(prefix)
        .and_then(|suffix| <[u8; 8]>::try_from(suffix).ok())
        .map(u64::from_be_bytes)
        .ok_or_else(|| StoreError::Codec(format!("malformed leaf key 0x{}", hex::encode(row))))
}
