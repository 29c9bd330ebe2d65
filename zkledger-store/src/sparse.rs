//! Sparse tree wrapper that commits each update's change set atomically.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use tracing::{debug, error, info, warn};
use zkledger_merkle::{
    Digest, HashKind, HashStrategy, SparseProof, SparseTree, SparseTreeConfig, SparseUpdate,
    TreeError,
};

use crate::{
    keys,
    record::{decode_node, encode_node, SparseMetaRecord},
    RecordStore, StoreError, WriteBatch,
};

/// A [`SparseTree`] whose every update is durably recorded before it returns.
///
/// A commit writes the nodes created by the update, the leaf value and the
/// meta row (root, depth, hash, count) in one batch. Stale nodes are left in
/// place since nodes are content addressed and may still be shared.
pub struct PersistentSparseTree<H = HashKind> {
    store: RecordStore,
    tree_id: String,
    inner: Mutex<SparseTree<H>>,
    frozen: AtomicBool,
}

impl<H: HashStrategy> PersistentSparseTree<H> {
    /// Rebuild the tree from its node, value and meta rows.
    ///
    /// The persisted root is taken as canonical; it must match the configured
    /// hash and depth and every stored value must be provable against it.
    pub fn load(
        store: RecordStore,
        tree_id: impl Into<String>,
        hasher: H,
        depth: usize,
    ) -> Result<Self, StoreError> {
        let tree_id = tree_id.into();
        keys::validate_tree_id(&tree_id)?;
        let config = Arc::new(SparseTreeConfig::new(&hasher, depth)?);

        let meta = match store.get(&keys::sparse_meta(&tree_id))? {
            Some(bytes) => Some(
                SparseMetaRecord::from_bytes(&bytes)
                    .map_err(|err| StoreError::integrity(&tree_id, format!("meta: {err}")))?,
            ),
            None => None,
        };

        let value_prefix = keys::sparse_value_prefix(&tree_id);
        let mut values = BTreeMap::new();
        for (row, value) in store.scan_prefix(&value_prefix)? {
            let key = keys::digest_suffix(&value_prefix, &row)
                .map_err(|err| StoreError::integrity(&tree_id, err.to_string()))?;
            values.insert(key, value);
        }

        let Some(meta) = meta else {
            if !values.is_empty() {
                return Err(StoreError::integrity(&tree_id, "values present without a meta record"));
            }
            info!(tree = %tree_id, depth, "created sparse tree");
            return Ok(Self::from_tree(store, tree_id, SparseTree::new(hasher, config)?));
        };

        if meta.hash != config.hash_name() || meta.depth != config.depth() {
            return Err(StoreError::integrity(
                &tree_id,
                format!(
                    "persisted as {}/{} but configured as {}/{}",
                    meta.hash,
                    meta.depth,
                    config.hash_name(),
                    config.depth()
                ),
            ));
        }
        if meta.count != values.len() as u64 {
            return Err(StoreError::integrity(
                &tree_id,
                format!("meta counts {} values, found {}", meta.count, values.len()),
            ));
        }

        let node_prefix = keys::sparse_node_prefix(&tree_id);
        let mut nodes = BTreeMap::new();
        for (row, bytes) in store.scan_prefix(&node_prefix)? {
            let hash = keys::digest_suffix(&node_prefix, &row)
                .map_err(|err| StoreError::integrity(&tree_id, err.to_string()))?;
            let children = decode_node(&bytes)
                .map_err(|err| StoreError::integrity(&tree_id, err.to_string()))?;
            nodes.insert(hash, children);
        }

        let tree = SparseTree::from_parts(hasher, config, nodes, values, meta.root)?;
        if let Err(err) = tree.verify_structure() {
            error!(tree = %tree_id, error = %err, "sparse tree failed verification on load");
            return Err(StoreError::integrity(&tree_id, err.to_string()));
        }

        info!(
            tree = %tree_id,
            values = tree.len(),
            nodes = tree.nodes().len(),
            root = %hex::encode(tree.root()),
            "loaded sparse tree"
        );
        Ok(Self::from_tree(store, tree_id, tree))
    }

    fn from_tree(store: RecordStore, tree_id: String, tree: SparseTree<H>) -> Self {
        Self {
            store,
            tree_id,
            inner: Mutex::new(tree),
            frozen: AtomicBool::new(false),
        }
    }

    pub fn tree_id(&self) -> &str {
        &self.tree_id
    }

    /// Insert or overwrite `key` and commit the change.
    pub fn update(&self, key: Digest, value: Vec<u8>) -> Result<SparseUpdate, StoreError> {
        self.commit_with(|tree| tree.update(key, value))
    }

    /// Insert `key` only if it is absent; fails with `TreeError::KeyExists`.
    pub fn insert_unique(&self, key: Digest, value: Vec<u8>) -> Result<SparseUpdate, StoreError> {
        self.commit_with(|tree| tree.insert_unique(key, value))
    }

    pub fn root(&self) -> Result<Digest, StoreError> {
        Ok(self.lock()?.root())
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.lock()?.is_empty())
    }

    pub fn depth(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.depth())
    }

    pub fn get(&self, key: &Digest) -> Result<Vec<u8>, StoreError> {
        Ok(self.lock()?.get(key)?.to_vec())
    }

    pub fn prove(&self, key: &Digest) -> Result<SparseProof, StoreError> {
        Ok(self.lock()?.prove(key)?)
    }

    pub fn contains(&self, value: &[u8]) -> Result<bool, StoreError> {
        Ok(self.lock()?.contains(value)?)
    }

    /// Key a value is stored under when tracked with [`contains`](Self::contains).
    pub fn key_for(&self, value: &[u8]) -> Result<Digest, StoreError> {
        Ok(self.lock()?.key_for(value))
    }

    /// Check a proof against `root` with this tree's hash.
    pub fn verify_proof(
        &self,
        proof: &SparseProof,
        root: &Digest,
        key: &Digest,
        value: Option<&[u8]>,
    ) -> Result<bool, StoreError> {
        let tree = self.lock()?;
        Ok(SparseTree::verify_proof(tree.hasher(), proof, root, key, value))
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
            error!(tree = %self.tree_id, reason, "sparse tree frozen");
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    fn commit_with<F>(&self, mutate: F) -> Result<SparseUpdate, StoreError>
    where
        F: FnOnce(&mut SparseTree<H>) -> Result<SparseUpdate, TreeError>,
    {
        let mut tree = self.lock()?;
        if self.is_frozen() {
            return Err(StoreError::Frozen(self.tree_id.clone()));
        }

        let update = mutate(&mut tree)?;
        let committed = self
            .change_set(&tree, &update)
            .and_then(|batch| self.store.apply(&batch));

        if let Err(err) = committed {
            tree.revert(&update);
            warn!(tree = %self.tree_id, error = %err, "sparse commit failed; update reverted");
            return Err(err);
        }

        debug!(
            tree = %self.tree_id,
            key = %hex::encode(update.key),
            root = %hex::encode(update.root),
            new_nodes = update.new_nodes.len(),
            "sparse update committed"
        );
        Ok(update)
    }

    fn change_set(&self, tree: &SparseTree<H>, update: &SparseUpdate) -> Result<WriteBatch, StoreError> {
        let mut batch = WriteBatch::new();
        for (hash, children) in &update.new_nodes {
            batch.put(keys::sparse_node(&self.tree_id, hash), encode_node(children));
        }
        batch.put(keys::sparse_value(&self.tree_id, &update.key), update.value.clone());
        let meta = SparseMetaRecord {
            root: update.root,
            depth: tree.depth(),
            hash: tree.hasher().name().to_string(),
            count: tree.len() as u64,
        };
        batch.put(keys::sparse_meta(&self.tree_id), meta.to_bytes()?);
        Ok(batch)
    }

    fn lock(&self) -> Result<MutexGuard<'_, SparseTree<H>>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::LockPoisoned("sparse tree"))
    }
}
