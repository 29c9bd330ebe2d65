//! Error types for tree operations.

use thiserror::Error;

/// Errors raised by [`DenseTree`](crate::DenseTree) and
/// [`SparseTree`](crate::SparseTree).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    /// Leaf index past the end of the dense tree.
    #[error("index {index} out of bounds for tree with {leaf_count} leaves")]
    IndexOutOfBounds { index: usize, leaf_count: usize },

    /// Root requested from a tree without leaves.
    #[error("tree is empty")]
    EmptyTree,

    /// Raw inserts are pending; call `recalculate` first.
    #[error("root is stale after raw inserts; recalculate before reading it")]
    StaleRoot,

    /// Key not present in the sparse tree.
    #[error("key {0} not found")]
    NotFound(String),

    /// Key already present in the sparse tree.
    #[error("key {0} already present")]
    KeyExists(String),

    /// Another key already owns the leaf slot in a shallow sparse tree.
    #[error("key {key} maps to the leaf slot held by {occupant}")]
    SlotOccupied { key: String, occupant: String },

    /// Sparse tree depth outside `1..=256`.
    #[error("invalid sparse tree depth {0}")]
    InvalidDepth(usize),

    /// Internal node referenced by the sparse tree is not stored.
    #[error("missing sparse tree node {0}")]
    MissingNode(String),

    /// A stored node does not derive from its children.
    #[error("tree integrity violation: {0}")]
    Integrity(String),

    #[error("unknown hash strategy '{0}'")]
    UnknownHash(String),

    #[error("invalid digest: {0}")]
    InvalidDigest(String),
}

impl TreeError {
    /// True for errors that indicate corrupted tree state rather than bad input.
    pub fn is_integrity(&self) -> bool {
        matches!(self, TreeError::MissingNode(_) | TreeError::Integrity(_))
    }
}
