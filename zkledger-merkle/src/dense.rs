//! Insertion-ordered, array-indexed Merkle tree.
//!
//! The tree is stored as a vector of levels. `levels[0]` holds one leaf hash
//! per inserted value and every level above holds `ceil(len(below) / 2)`
//! parents. A parent at index `p` covers children `2p` and `2p + 1`; when
//! `2p + 1` does not exist the child at `2p` is paired with itself. The same
//! rule drives incremental propagation, full recalculation, rollback and proof
//! generation, which is what keeps their roots identical.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{hash::HashKind, Digest, HashStrategy, TreeError};

/// Sibling path for one leaf, ordered from the leaf level up to the root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenseProof {
    pub index: usize,
    pub siblings: Vec<Digest>,
}

impl DenseProof {
    /// Recompute the root implied by `value` sitting at `self.index`.
    pub fn compute_root<H: HashStrategy>(&self, hasher: &H, value: &[u8]) -> Digest {
        fold_path(hasher, hasher.digest(value), self.index, &self.siblings)
    }

    /// Check the proof against an externally supplied root.
    pub fn verify<H: HashStrategy>(&self, hasher: &H, value: &[u8], root: &Digest) -> bool {
        &self.compute_root(hasher, value) == root
    }
}

/// Array-of-levels Merkle tree over an append-only sequence of values.
#[derive(Clone, Debug)]
pub struct DenseTree<H = HashKind> {
    hasher: H,
    values: Vec<Vec<u8>>,
    levels: Vec<Vec<Digest>>,
    stale: bool,
}

impl<H: HashStrategy + Default> Default for DenseTree<H> {
    fn default() -> Self {
        Self::new(H::default())
    }
}

impl<H: HashStrategy> DenseTree<H> {
    /// Create an empty tree.
    pub fn new(hasher: H) -> Self {
        Self {
            hasher,
            values: Vec::new(),
            levels: vec![Vec::new()],
            stale: false,
        }
    }

    /// Build a tree from `values` with a single full recalculation.
    pub fn from_values<I, V>(hasher: H, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Vec<u8>>,
    {
        let mut tree = Self::new(hasher);
        for value in values {
            tree.raw_insert(value);
        }
        tree.rebuild();
        tree
    }

    pub fn hasher(&self) -> &H {
        &self.hasher
    }

    /// Number of leaves.
    pub fn leaf_count(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Number of levels above the leaves; the length of every sibling path.
    pub fn depth(&self) -> usize {
        self.levels.len().saturating_sub(1)
    }

    /// True after `raw_insert` until the next `recalculate`.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Raw value stored at `index`.
    pub fn value_at(&self, index: usize) -> Result<&[u8], TreeError> {
        self.values
            .get(index)
            .map(Vec::as_slice)
            .ok_or(TreeError::IndexOutOfBounds {
                index,
                leaf_count: self.leaf_count(),
            })
    }

    /// All raw values in insertion order.
    pub fn values(&self) -> impl Iterator<Item = &[u8]> {
        self.values.iter().map(Vec::as_slice)
    }

    /// Append `hash(value)` as a new leaf without touching its ancestors.
    ///
    /// Returns the index of the new leaf. The root is stale until
    /// [`recalculate`](Self::recalculate) runs.
    pub fn raw_insert(&mut self, value: impl Into<Vec<u8>>) -> usize {
        let value = value.into();
        let index = self.values.len();
        self.levels[0].push(self.hasher.digest(&value));
        self.values.push(value);
        self.stale = true;
        index
    }

    /// Append a leaf and repropagate the path above it.
    ///
    /// Only the new leaf's ancestors change, so this costs O(depth). A tree
    /// left stale by earlier raw inserts is rebuilt in full instead.
    pub fn insert(&mut self, value: impl Into<Vec<u8>>) -> (usize, Digest) {
        let was_stale = self.stale;
        let index = self.raw_insert(value);
        let root = if was_stale {
            self.rebuild();
            self.top()
        } else {
            self.propagate(index)
        };
        self.stale = false;
        trace!(index, root = %hex::encode(root), "dense insert");
        (index, root)
    }

    /// Rebuild every level from the leaves.
    pub fn recalculate(&mut self) -> Result<Digest, TreeError> {
        if self.values.is_empty() {
            self.levels.truncate(1);
            self.stale = false;
            return Err(TreeError::EmptyTree);
        }
        self.rebuild();
        Ok(self.top())
    }

    /// Current root.
    pub fn root(&self) -> Result<Digest, TreeError> {
        if self.stale {
            return Err(TreeError::StaleRoot);
        }
        if self.values.is_empty() {
            return Err(TreeError::EmptyTree);
        }
        Ok(self.top())
    }

    /// Sibling hashes needed to climb from leaf `index` to the root.
    pub fn intermediary_hashes_by_index(&self, index: usize) -> Result<Vec<Digest>, TreeError> {
        self.check_index(index)?;
        if self.stale {
            return Err(TreeError::StaleRoot);
        }

        let mut siblings = Vec::with_capacity(self.depth());
        let mut position = index;
        for row in self.levels.iter().take_while(|row| row.len() > 1) {
            let sibling = if position % 2 == 0 {
                row.get(position + 1).unwrap_or(&row[position])
            } else {
                &row[position - 1]
            };
            siblings.push(*sibling);
            position /= 2;
        }
        Ok(siblings)
    }

    /// Inclusion proof for leaf `index`.
    pub fn proof(&self, index: usize) -> Result<DenseProof, TreeError> {
        Ok(DenseProof {
            index,
            siblings: self.intermediary_hashes_by_index(index)?,
        })
    }

    /// Recompute the path from `value` at `index` and compare it to the root.
    pub fn validate_existence(
        &self,
        value: &[u8],
        index: usize,
        siblings: &[Digest],
    ) -> Result<bool, TreeError> {
        self.check_index(index)?;
        let root = self.root()?;
        Ok(fold_path(&self.hasher, self.hasher.digest(value), index, siblings) == root)
    }

    /// Remove the most recent leaf and repair the path it occupied.
    ///
    /// Used to undo an insert whose durable commit failed.
    pub fn pop(&mut self) -> Option<Vec<u8>> {
        let value = self.values.pop()?;
        self.levels[0].pop();

        if self.stale {
            return Some(value);
        }
        if self.levels[0].is_empty() {
            self.levels.truncate(1);
            return Some(value);
        }

        let mut level = 0;
        while self.levels[level].len() > 1 {
            let parent_len = (self.levels[level].len() + 1) / 2;
            let parent = parent_len - 1;
            let hash = self.parent_hash(level, parent);
            let above = &mut self.levels[level + 1];
            above.truncate(parent_len);
            above[parent] = hash;
            level += 1;
        }
        self.levels.truncate(level + 1);
        Some(value)
    }

    /// Check level sizing and that every node derives from its children.
    pub fn verify_structure(&self) -> Result<(), TreeError> {
        if self.stale {
            return Err(TreeError::StaleRoot);
        }
        if self.levels[0].len() != self.values.len() {
            return Err(TreeError::Integrity(format!(
                "{} leaf hashes for {} values",
                self.levels[0].len(),
                self.values.len()
            )));
        }
        for (index, (value, leaf)) in self.values.iter().zip(&self.levels[0]).enumerate() {
            if &self.hasher.digest(value) != leaf {
                return Err(TreeError::Integrity(format!(
                    "leaf {index} does not hash its value"
                )));
            }
        }

        for level in 0..self.depth() {
            let below = self.levels[level].len();
            let above = &self.levels[level + 1];
            if below <= 1 || above.len() != (below + 1) / 2 {
                return Err(TreeError::Integrity(format!(
                    "level {} has {} nodes over {} children",
                    level + 1,
                    above.len(),
                    below
                )));
            }
            for (parent, node) in above.iter().enumerate() {
                if node != &self.parent_hash(level, parent) {
                    return Err(TreeError::Integrity(format!(
                        "node {parent} at level {} does not derive from its children",
                        level + 1
                    )));
                }
            }
        }

        if self.levels[self.depth()].len() > 1 {
            return Err(TreeError::Integrity("tree has no single root".into()));
        }
        Ok(())
    }

    fn check_index(&self, index: usize) -> Result<(), TreeError> {
        if index >= self.values.len() {
            return Err(TreeError::IndexOutOfBounds {
                index,
                leaf_count: self.values.len(),
            });
        }
        Ok(())
    }

    fn parent_hash(&self, level: usize, parent: usize) -> Digest {
        let row = &self.levels[level];
        let left = &row[parent * 2];
        let right = row.get(parent * 2 + 1).unwrap_or(left);
        self.hasher.digest_pair(left, right)
    }

    fn propagate(&mut self, leaf_index: usize) -> Digest {
        let mut level = 0;
        let mut position = leaf_index;
        while self.levels[level].len() > 1 {
            let parent = position / 2;
            let hash = self.parent_hash(level, parent);
            if self.levels.len() == level + 1 {
                self.levels.push(Vec::new());
            }
            let above = &mut self.levels[level + 1];
            if parent < above.len() {
                above[parent] = hash;
            } else {
                above.push(hash);
            }
            level += 1;
            position = parent;
        }
        self.levels[level][0]
    }

    fn rebuild(&mut self) {
        self.levels.truncate(1);
        while self.levels[self.levels.len() - 1].len() > 1 {
            let below = &self.levels[self.levels.len() - 1];
            let next: Vec<Digest> = below
                .chunks(2)
                .map(|pair| {
                    let left = &pair[0];
                    let right = pair.get(1).unwrap_or(left);
                    self.hasher.digest_pair(left, right)
                })
                .collect();
            self.levels.push(next);
        }
        self.stale = false;
    }

    // Callers guarantee at least one leaf and a fresh tree.
    fn top(&self) -> Digest {
        self.levels[self.levels.len() - 1][0]
    }
}

fn fold_path<H: HashStrategy>(
    hasher: &H,
    leaf: Digest,
    index: usize,
    siblings: &[Digest],
) -> Digest {
    let mut current = leaf;
    let mut position = index;
    for sibling in siblings {
        current = if position % 2 == 0 {
            hasher.digest_pair(&current, sibling)
        } else {
            hasher.digest_pair(sibling, &current)
        };
        position /= 2;
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Sha256;

    fn h(data: &[u8]) -> Digest {
        Sha256.digest(data)
    }

    fn pair(left: Digest, right: Digest) -> Digest {
        Sha256.digest_pair(&left, &right)
    }

    fn tree_of(values: &[&str]) -> DenseTree<Sha256> {
        let mut tree = DenseTree::new(Sha256);
        for value in values {
            tree.insert(value.as_bytes());
        }
        tree
    }

    #[test]
    fn test_three_leaves_duplicate_final_odd_node() {
        let tree = tree_of(&["a", "b", "c"]);
        let expected = pair(pair(h(b"a"), h(b"b")), pair(h(b"c"), h(b"c")));
        assert_eq!(tree.root().unwrap(), expected);
        assert_eq!(tree.depth(), 2);
    }

    #[test]
    fn test_single_leaf_root_is_leaf_hash() {
        let tree = tree_of(&["only"]);
        assert_eq!(tree.root().unwrap(), h(b"only"));
        assert!(tree.intermediary_hashes_by_index(0).unwrap().is_empty());
    }

    #[test]
    fn test_empty_tree() {
        let mut tree = DenseTree::new(Sha256);
        assert_eq!(tree.root(), Err(TreeError::EmptyTree));
        assert_eq!(tree.recalculate(), Err(TreeError::EmptyTree));
        assert!(matches!(
            tree.intermediary_hashes_by_index(0),
            Err(TreeError::IndexOutOfBounds { index: 0, leaf_count: 0 })
        ));
    }

    #[test]
    fn test_insert_returns_index_and_root() {
        let mut tree = DenseTree::new(Sha256);
        assert_eq!(tree.insert(b"a".to_vec()), (0, h(b"a")));
        let (index, root) = tree.insert(b"b".to_vec());
        assert_eq!(index, 1);
        assert_eq!(root, pair(h(b"a"), h(b"b")));
    }

    #[test]
    fn test_incremental_matches_recalculate() {
        for count in 1..=33 {
            let values: Vec<String> = (0..count).map(|i| format!("note-{i}")).collect();
            let mut incremental = DenseTree::new(Sha256);
            for value in &values {
                incremental.insert(value.as_bytes());
            }
            let rebuilt = DenseTree::from_values(Sha256, values.iter().map(|v| v.as_bytes()));
            assert_eq!(incremental.root(), rebuilt.root(), "count {count}");
            assert_eq!(incremental.levels, rebuilt.levels, "count {count}");
        }
    }

    #[test]
    fn test_raw_insert_marks_root_stale() {
        let mut tree = tree_of(&["a"]);
        tree.raw_insert(b"b".to_vec());
        assert!(tree.is_stale());
        assert_eq!(tree.root(), Err(TreeError::StaleRoot));
        let root = tree.recalculate().unwrap();
        assert_eq!(root, pair(h(b"a"), h(b"b")));
        assert!(!tree.is_stale());
    }

    #[test]
    fn test_insert_after_raw_insert_rebuilds() {
        let mut tree = DenseTree::new(Sha256);
        tree.raw_insert(b"a".to_vec());
        tree.raw_insert(b"b".to_vec());
        let (_, root) = tree.insert(b"c".to_vec());
        assert_eq!(root, tree_of(&["a", "b", "c"]).root().unwrap());
    }

    #[test]
    fn test_proof_round_trip_every_index() {
        let values: Vec<String> = (0..11).map(|i| format!("v{i}")).collect();
        let tree = DenseTree::from_values(Sha256, values.iter().map(|v| v.as_bytes()));
        for (index, value) in values.iter().enumerate() {
            let siblings = tree.intermediary_hashes_by_index(index).unwrap();
            assert_eq!(siblings.len(), tree.depth());
            assert!(tree
                .validate_existence(value.as_bytes(), index, &siblings)
                .unwrap());
        }
    }

    #[test]
    fn test_proof_rejects_tampered_value() {
        let tree = tree_of(&["a", "b", "c", "d", "e"]);
        let siblings = tree.intermediary_hashes_by_index(2).unwrap();
        assert!(!tree.validate_existence(b"x", 2, &siblings).unwrap());
        assert!(!tree.validate_existence(b"c", 3, &siblings).unwrap());
    }

    #[test]
    fn test_validate_existence_out_of_bounds() {
        let tree = tree_of(&["a", "b"]);
        assert!(matches!(
            tree.validate_existence(b"a", 2, &[]),
            Err(TreeError::IndexOutOfBounds { index: 2, leaf_count: 2 })
        ));
    }

    #[test]
    fn test_pop_restores_previous_root() {
        let mut tree = DenseTree::new(Sha256);
        let mut roots = Vec::new();
        for i in 0..9u8 {
            roots.push(tree.insert(vec![i]).1);
        }
        for i in (0..9u8).rev() {
            assert_eq!(tree.root().unwrap(), roots[i as usize]);
            assert_eq!(tree.pop(), Some(vec![i]));
            tree.verify_structure().unwrap();
        }
        assert!(tree.is_empty());
        assert_eq!(tree.root(), Err(TreeError::EmptyTree));
    }

    #[test]
    fn test_verify_structure_detects_corruption() {
        let mut tree = tree_of(&["a", "b", "c"]);
        tree.verify_structure().unwrap();
        tree.levels[1][1] = [0u8; 32];
        assert!(matches!(
            tree.verify_structure(),
            Err(TreeError::Integrity(_))
        ));
    }

    #[test]
    fn test_dense_proof_verify_against_root() {
        let tree = tree_of(&["a", "b", "c"]);
        let proof = tree.proof(1).unwrap();
        let root = tree.root().unwrap();
        assert!(proof.verify(&Sha256, b"b", &root));
        assert!(!proof.verify(&Sha256, b"a", &root));
    }
}
