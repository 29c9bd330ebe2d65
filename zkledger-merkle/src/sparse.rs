//! Key-addressed sparse Merkle tree over the 256-bit digest space.
//!
//! A key's bits, read most-significant first, select the path from the root
//! down to its leaf. Subtrees that hold no leaves are never stored: a subtree
//! of height `h` with no leaves hashes to `defaults[h]`, where
//! `defaults[0]` is the empty-leaf sentinel and
//! `defaults[h + 1] = node(defaults[h], defaults[h])`.
//!
//! Internal nodes are content addressed (`node hash -> [left, right]`), so two
//! identical subtrees share one entry. Leaves and nodes are domain separated:
//!
//! | kind  | pre-image                   |
//! |-------|-----------------------------|
//! | leaf  | `0x00 ‖ key ‖ value`        |
//! | node  | `0x01 ‖ left ‖ right`       |
//! | empty | `[0u8; 32]` (not hashed)    |

use std::{collections::BTreeMap, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{hash::HashKind, Digest, HashStrategy, TreeError, DIGEST_LEN};

/// Deepest tree supported: one level per key bit.
pub const MAX_SPARSE_DEPTH: usize = DIGEST_LEN * 8;

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;
const EMPTY_LEAF: Digest = [0u8; DIGEST_LEN];

/// Precomputed default-subtree hashes for one (hash, depth) pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SparseTreeConfig {
    hash: &'static str,
    depth: usize,
    defaults: Vec<Digest>,
}

impl SparseTreeConfig {
    /// Compute `depth + 1` default hashes, from the empty leaf up to the
    /// empty root.
    pub fn new<H: HashStrategy>(hasher: &H, depth: usize) -> Result<Self, TreeError> {
        if depth == 0 || depth > MAX_SPARSE_DEPTH {
            return Err(TreeError::InvalidDepth(depth));
        }
        let mut defaults = Vec::with_capacity(depth + 1);
        defaults.push(EMPTY_LEAF);
        for height in 0..depth {
            let below = defaults[height];
            defaults.push(node_hash(hasher, &below, &below));
        }
        Ok(Self {
            hash: hasher.name(),
            depth,
            defaults,
        })
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Name of the hash strategy the defaults were computed with.
    pub fn hash_name(&self) -> &'static str {
        self.hash
    }

    /// Root of a tree with no leaves.
    pub fn empty_root(&self) -> Digest {
        self.defaults[self.depth]
    }
}

/// Membership or non-membership proof for one key.
///
/// `siblings[level]` is the sibling of the path node at `level + 1`, ordered
/// from just below the root down to the leaf level.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparseProof {
    pub siblings: Vec<Digest>,
    pub leaf_value: Option<Vec<u8>>,
}

/// Everything one `update` changed, so the caller can persist or undo it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SparseUpdate {
    pub key: Digest,
    pub value: Vec<u8>,
    pub root: Digest,
    pub previous_root: Digest,
    pub previous_value: Option<Vec<u8>>,
    /// Nodes that did not exist before this update.
    pub new_nodes: Vec<(Digest, [Digest; 2])>,
}

/// Fixed-depth sparse Merkle tree.
#[derive(Clone, Debug)]
pub struct SparseTree<H = HashKind> {
    hasher: H,
    config: Arc<SparseTreeConfig>,
    nodes: BTreeMap<Digest, [Digest; 2]>,
    values: BTreeMap<Digest, Vec<u8>>,
    root: Digest,
}

impl<H: HashStrategy> SparseTree<H> {
    /// Create an empty tree. `config` must have been built with `hasher`.
    pub fn new(hasher: H, config: Arc<SparseTreeConfig>) -> Result<Self, TreeError> {
        check_config(&hasher, &config)?;
        let root = config.empty_root();
        Ok(Self {
            hasher,
            config,
            nodes: BTreeMap::new(),
            values: BTreeMap::new(),
            root,
        })
    }

    /// Create an empty tree, computing the default hashes for `depth`.
    pub fn with_depth(hasher: H, depth: usize) -> Result<Self, TreeError> {
        let config = Arc::new(SparseTreeConfig::new(&hasher, depth)?);
        Self::new(hasher, config)
    }

    /// Reassemble a tree from persisted maps, trusting `root` as canonical.
    pub fn from_parts(
        hasher: H,
        config: Arc<SparseTreeConfig>,
        nodes: BTreeMap<Digest, [Digest; 2]>,
        values: BTreeMap<Digest, Vec<u8>>,
        root: Digest,
    ) -> Result<Self, TreeError> {
        check_config(&hasher, &config)?;
        Ok(Self {
            hasher,
            config,
            nodes,
            values,
            root,
        })
    }

    pub fn hasher(&self) -> &H {
        &self.hasher
    }

    pub fn config(&self) -> &Arc<SparseTreeConfig> {
        &self.config
    }

    pub fn root(&self) -> Digest {
        self.root
    }

    pub fn depth(&self) -> usize {
        self.config.depth
    }

    /// Number of keys holding a value.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn nodes(&self) -> &BTreeMap<Digest, [Digest; 2]> {
        &self.nodes
    }

    pub fn values(&self) -> &BTreeMap<Digest, Vec<u8>> {
        &self.values
    }

    /// Key under which `value` is tracked by [`contains`](Self::contains).
    pub fn key_for(&self, value: &[u8]) -> Digest {
        self.hasher.digest(value)
    }

    pub fn get(&self, key: &Digest) -> Result<&[u8], TreeError> {
        self.values
            .get(key)
            .map(Vec::as_slice)
            .ok_or_else(|| TreeError::NotFound(hex::encode(key)))
    }

    /// Insert or overwrite the leaf at `key`, recomputing its O(depth) path.
    ///
    /// In a tree shallower than 256 levels, two keys that agree on their first
    /// `depth` bits share a leaf slot; writing the second fails with
    /// `SlotOccupied`.
    pub fn update(&mut self, key: Digest, value: Vec<u8>) -> Result<SparseUpdate, TreeError> {
        if let Some(occupant) = self.slot_occupant(&key) {
            return Err(TreeError::SlotOccupied {
                key: hex::encode(key),
                occupant: hex::encode(occupant),
            });
        }
        let siblings = self.siblings_for(&key)?;
        let mut current = leaf_hash(&self.hasher, &key, &value);
        let mut new_nodes = Vec::new();

        for level in (0..self.config.depth).rev() {
            let sibling = siblings[level];
            let children = if bit(&key, level) {
                [sibling, current]
            } else {
                [current, sibling]
            };
            let parent = node_hash(&self.hasher, &children[0], &children[1]);
            if !self.nodes.contains_key(&parent) {
                self.nodes.insert(parent, children);
                new_nodes.push((parent, children));
            }
            current = parent;
        }

        let previous_value = self.values.insert(key, value.clone());
        let previous_root = std::mem::replace(&mut self.root, current);
        trace!(
            key = %hex::encode(key),
            root = %hex::encode(current),
            new_nodes = new_nodes.len(),
            "sparse update"
        );

        Ok(SparseUpdate {
            key,
            value,
            root: current,
            previous_root,
            previous_value,
            new_nodes,
        })
    }

    /// Like [`update`](Self::update) but refuses to overwrite an existing key.
    pub fn insert_unique(&mut self, key: Digest, value: Vec<u8>) -> Result<SparseUpdate, TreeError> {
        if self.values.contains_key(&key) {
            return Err(TreeError::KeyExists(hex::encode(key)));
        }
        self.update(key, value)
    }

    /// Undo an update. Only valid for the most recent update.
    pub fn revert(&mut self, update: &SparseUpdate) {
        for (hash, _) in &update.new_nodes {
            self.nodes.remove(hash);
        }
        match &update.previous_value {
            Some(previous) => {
                self.values.insert(update.key, previous.clone());
            }
            None => {
                self.values.remove(&update.key);
            }
        }
        self.root = update.previous_root;
    }

    /// Sibling path for `key`, valid for membership and non-membership.
    pub fn prove(&self, key: &Digest) -> Result<SparseProof, TreeError> {
        Ok(SparseProof {
            siblings: self.siblings_for(key)?,
            leaf_value: self.values.get(key).cloned(),
        })
    }

    /// Recompute the root from a proof and compare it with `root`.
    ///
    /// `value = None` checks that `key` is absent.
    pub fn verify_proof(
        hasher: &H,
        proof: &SparseProof,
        root: &Digest,
        key: &Digest,
        value: Option<&[u8]>,
    ) -> bool {
        let depth = proof.siblings.len();
        if depth == 0 || depth > MAX_SPARSE_DEPTH {
            return false;
        }

        let mut current = match value {
            Some(value) => leaf_hash(hasher, key, value),
            None => EMPTY_LEAF,
        };
        for level in (0..depth).rev() {
            let sibling = &proof.siblings[level];
            current = if bit(key, level) {
                node_hash(hasher, sibling, &current)
            } else {
                node_hash(hasher, &current, sibling)
            };
        }
        &current == root
    }

    /// Whether `value` has been inserted under `hash(value)`, proven against
    /// the current root.
    pub fn contains(&self, value: &[u8]) -> Result<bool, TreeError> {
        let key = self.key_for(value);
        let proof = self.prove(&key)?;
        Ok(Self::verify_proof(
            &self.hasher,
            &proof,
            &self.root,
            &key,
            Some(value),
        ))
    }

    /// Check that the root resolves and every stored value is provable.
    pub fn verify_structure(&self) -> Result<(), TreeError> {
        if self.values.is_empty() {
            if self.root != self.config.empty_root() {
                return Err(TreeError::Integrity(
                    "tree without values has a non-empty root".into(),
                ));
            }
            return Ok(());
        }
        for (key, value) in &self.values {
            let proof = self.prove(key)?;
            if !Self::verify_proof(&self.hasher, &proof, &self.root, key, Some(value)) {
                return Err(TreeError::Integrity(format!(
                    "value at key {} is not reachable from the root",
                    hex::encode(key)
                )));
            }
        }
        Ok(())
    }

    fn slot_occupant(&self, key: &Digest) -> Option<Digest> {
        let depth = self.config.depth;
        if depth == MAX_SPARSE_DEPTH {
            return None;
        }
        let (mut low, mut high) = (*key, *key);
        for index in depth..MAX_SPARSE_DEPTH {
            let mask = 1u8 << (7 - index % 8);
            low[index / 8] &= !mask;
            high[index / 8] |= mask;
        }
        self.values
            .range(low..=high)
            .map(|(other, _)| *other)
            .find(|other| other != key)
    }

    fn siblings_for(&self, key: &Digest) -> Result<Vec<Digest>, TreeError> {
        let depth = self.config.depth;
        let mut siblings = Vec::with_capacity(depth);
        let mut current = self.root;

        for level in 0..depth {
            if current == self.config.defaults[depth - level] {
                siblings.extend((level..depth).map(|l| self.config.defaults[depth - l - 1]));
                break;
            }
            let [left, right] = *self
                .nodes
                .get(&current)
                .ok_or_else(|| TreeError::MissingNode(hex::encode(current)))?;
            if bit(key, level) {
                siblings.push(left);
                current = right;
            } else {
                siblings.push(right);
                current = left;
            }
        }
        Ok(siblings)
    }
}

fn check_config<H: HashStrategy>(hasher: &H, config: &SparseTreeConfig) -> Result<(), TreeError> {
    if hasher.name() != config.hash {
        return Err(TreeError::Integrity(format!(
            "sparse tree config built with {} but tree uses {}",
            config.hash,
            hasher.name()
        )));
    }
    Ok(())
}

fn leaf_hash<H: HashStrategy>(hasher: &H, key: &Digest, value: &[u8]) -> Digest {
    let mut buf = Vec::with_capacity(1 + DIGEST_LEN + value.len());
    buf.push(LEAF_PREFIX);
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    hasher.digest(&buf)
}

fn node_hash<H: HashStrategy>(hasher: &H, left: &Digest, right: &Digest) -> Digest {
    let mut buf = [0u8; 1 + DIGEST_LEN * 2];
    buf[0] = NODE_PREFIX;
    buf[1..1 + DIGEST_LEN].copy_from_slice(left);
    buf[1 + DIGEST_LEN..].copy_from_slice(right);
    hasher.digest(&buf)
}

/// Bit `index` of `key`, most significant bit first.
fn bit(key: &Digest, index: usize) -> bool {
    (key[index / 8] >> (7 - index % 8)) & 1 == 1
}
