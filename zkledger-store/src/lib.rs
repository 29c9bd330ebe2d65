//! Durable persistence for the zkledger Merkle trees.
//!
//! A [`RecordStore`] is an ordered key/value store backed by sled or by an
//! in-memory map. [`PersistentDenseTree`] and [`PersistentSparseTree`] wrap the
//! in-memory trees from `zkledger-merkle`, rebuild them from their records at
//! load time and commit every mutation under the same lock that performed it.

pub mod backend;
pub mod dense;
pub mod error;
pub mod keys;
pub mod record;
pub mod sparse;

pub use backend::{BatchOp, RecordStore, WriteBatch};
pub use dense::PersistentDenseTree;
pub use error::StoreError;
pub use record::{DenseLeafRecord, SparseMetaRecord};
pub use sparse::PersistentSparseTree;

use tracing::info;

/// Delete every row of the dense and sparse trees stored under `tree_id`.
pub fn drop_tree(store: &RecordStore, tree_id: &str) -> Result<usize, StoreError> {
    keys::validate_tree_id(tree_id)?;
    let removed =
        store.remove_prefix(&keys::dense_root(tree_id))? + store.remove_prefix(&keys::sparse_root(tree_id))?;
    info!(tree = %tree_id, rows = removed, "dropped tree");
    Ok(removed)
}
