//! Dense tree wrapper that commits one leaf record per insert.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex, MutexGuard,
};

use tracing::{debug, error, info, warn};
use zkledger_merkle::{DenseProof, DenseTree, Digest, HashKind, HashStrategy};

use crate::{keys, record::DenseLeafRecord, RecordStore, StoreError};

/// A [`DenseTree`] whose every insert is durably recorded before it returns.
///
/// The mutex covers both the in-memory insert and the commit, so concurrent
/// inserts are fully serialized and a failed commit is rolled back with
/// [`DenseTree::pop`] before the lock is released.
pub struct PersistentDenseTree<H = HashKind> {
    store: RecordStore,
    tree_id: String,
    inner: Mutex<DenseTree<H>>,
    frozen: AtomicBool,
}

impl<H: HashStrategy> PersistentDenseTree<H> {
    /// Rebuild the tree from its leaf records.
    ///
    /// Leaves are replayed with `raw_insert` and hashed once with
    /// `recalculate`. The rebuilt tree must be structurally valid and its root
    /// must equal the root stored with the last leaf; otherwise loading fails
    /// with [`StoreError::Integrity`].
    pub fn load(store: RecordStore, tree_id: impl Into<String>, hasher: H) -> Result<Self, StoreError> {
        let tree_id = tree_id.into();
        keys::validate_tree_id(&tree_id)?;

        let prefix = keys::dense_leaf_prefix(&tree_id);
        let rows = store.scan_prefix(&prefix)?;
        let mut tree = DenseTree::new(hasher);
        let mut expected_root = None;

        for (position, (key, bytes)) in rows.iter().enumerate() {
            let index = keys::index_suffix(&prefix, key)
                .map_err(|err| StoreError::integrity(&tree_id, err.to_string()))?;
            let record = DenseLeafRecord::from_bytes(bytes)
                .map_err(|err| StoreError::integrity(&tree_id, format!("leaf {index}: {err}")))?;
            if index != position as u64 || record.index != index {
                return Err(StoreError::integrity(
                    &tree_id,
                    format!("expected leaf {position}, found key {index} holding record {}", record.index),
                ));
            }
            tree.raw_insert(record.value);
            expected_root = Some(record.root);
        }

        if let Some(expected) = expected_root {
            let root = tree.recalculate()?;
            if let Err(err) = tree.verify_structure() {
                error!(tree = %tree_id, error = %err, "dense tree failed structural verification");
                return Err(StoreError::integrity(&tree_id, err.to_string()));
            }
            if root != expected {
                error!(
                    tree = %tree_id,
                    stored = %hex::encode(expected),
                    rebuilt = %hex::encode(root),
                    "dense tree root mismatch after reload"
                );
                return Err(StoreError::integrity(
                    &tree_id,
                    "rebuilt root does not match the last committed root",
                ));
            }
        }

        info!(tree = %tree_id, leaves = tree.leaf_count(), "loaded dense tree");
        Ok(Self {
            store,
            tree_id,
            inner: Mutex::new(tree),
            frozen: AtomicBool::new(false),
        })
    }

    pub fn tree_id(&self) -> &str {
        &self.tree_id
    }

    /// Append `value` and commit its leaf record; returns `(index, root)`.
    pub fn insert(&self, value: Vec<u8>) -> Result<(usize, Digest), StoreError> {
        let mut tree = self.lock()?;
        self.ensure_writable()?;

        let (index, root) = tree.insert(value.clone());
        let record = DenseLeafRecord {
            index: index as u64,
            value,
            root,
        };
        let key = keys::dense_leaf(&self.tree_id, index as u64);
        let committed = record
            .to_bytes()
            .and_then(|bytes| self.store.insert_new(&key, &bytes));

        if let Err(err) = committed {
            tree.pop();
            warn!(tree = %self.tree_id, index, error = %err, "dense commit failed; insert rolled back");
            return Err(err);
        }

        debug!(tree = %self.tree_id, index, root = %hex::encode(root), "dense leaf committed");
        Ok((index, root))
    }

    pub fn leaf_count(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.leaf_count())
    }

    pub fn root(&self) -> Result<Digest, StoreError> {
        Ok(self.lock()?.root()?)
    }

    pub fn value_at(&self, index: usize) -> Result<Vec<u8>, StoreError> {
        Ok(self.lock()?.value_at(index)?.to_vec())
    }

    pub fn intermediary_hashes_by_index(&self, index: usize) -> Result<Vec<Digest>, StoreError> {
        Ok(self.lock()?.intermediary_hashes_by_index(index)?)
    }

    pub fn proof(&self, index: usize) -> Result<DenseProof, StoreError> {
        Ok(self.lock()?.proof(index)?)
    }

    pub fn validate_existence(
        &self,
        value: &[u8],
        index: usize,
        siblings: &[Digest],
    ) -> Result<bool, StoreError> {
        Ok(self.lock()?.validate_existence(value, index, siblings)?)
    }

    /// Re-check the in-memory tree; a failure freezes it.
    pub fn verify(&self) -> Result<(), StoreError> {
        let tree = self.lock()?;
        tree.verify_structure().map_err(|err| {
            self.freeze(&err.to_string());
            StoreError::integrity(&self.tree_id, err.to_string())
        })
    }

    /// Refuse all further writes until the process restarts.
    pub fn freeze(&self, reason: &str) {
        if !self.frozen.swap(true, Ordering::SeqCst) {
            error!(tree = %self.tree_id, reason, "dense tree frozen");
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    fn ensure_writable(&self) -> Result<(), StoreError> {
        if self.is_frozen() {
            return Err(StoreError::Frozen(self.tree_id.clone()));
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, DenseTree<H>>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::LockPoisoned("dense tree"))
    }
}
