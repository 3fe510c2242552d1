//! Selecting "the same" node across tree mutations.
//!
//! A [`SelectionHandle`] remembers the node's stable id and the names of the
//! leaves under it. In a new tree the id is tried first; otherwise the LCA of
//! the remembered names is taken. If the names are missing or ambiguous the
//! selection is dropped.

use crate::tree::{NodeIdx, Tree};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionHandle {
    pub node_id: String,
    pub fallback_names: BTreeSet<String>,
}

impl SelectionHandle {
    /// Handle for `idx` in `tree`, or `None` if it does not exist.
    pub fn from_node(tree: &Tree, idx: NodeIdx) -> Option<Self> {
        let node = tree.get(idx)?;
        Some(Self {
            node_id: node.id.clone(),
            fallback_names: tree.leaf_names(idx),
        })
    }

    /// Locate the node in `tree`.
    pub fn resolve(&self, tree: &Tree) -> Option<NodeIdx> {
        if let Some(idx) = tree.find_by_id(&self.node_id) {
            return Some(idx);
        }
        if self.fallback_names.is_empty() {
            return None;
        }
        tree.lca_of_names(&self.fallback_names)
    }
}
