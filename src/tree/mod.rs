//! Phylogenetic tree model.
//!
//! Nodes live in a flat `Vec<TreeNode>` indexed by [`NodeIdx`], with explicit
//! parent and child links. Every node carries a stable string id that survives
//! cloning and in-place edits, which is what selection recovery keys on.
//!
//! Three attributes are stored as dedicated fields and are addressable by name
//! like any other attribute: `Name`, `Length` and `Support`.

pub mod newick;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

pub use newick::{parse_newick, parse_newick_collection, write_newick};

/// Attribute name for the node label.
pub const ATTR_NAME: &str = "Name";
/// Attribute name for the branch length.
pub const ATTR_LENGTH: &str = "Length";
/// Attribute name for the branch support value.
pub const ATTR_SUPPORT: &str = "Support";

/// Index into `Tree::nodes`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeIdx(pub u32);

impl NodeIdx {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for NodeIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeIdx({})", self.0)
    }
}

/// Value of a node attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    Text(String),
    Number(f64),
}

impl AttributeValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(s) => Some(s),
            AttributeValue::Number(_) => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(n) => Some(*n),
            AttributeValue::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Text(s) => write!(f, "{}", s),
            AttributeValue::Number(n) => write!(f, "{}", n),
        }
    }
}

/// A single node in the tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    /// Stable identity, preserved across clones and edits.
    pub id: String,
    pub name: Option<String>,
    pub length: Option<f64>,
    pub support: Option<f64>,
    /// Custom attributes beyond Name/Length/Support.
    pub attributes: BTreeMap<String, AttributeValue>,
    pub parent: Option<NodeIdx>,
    pub children: Vec<NodeIdx>,
}

impl TreeNode {
    fn new(parent: Option<NodeIdx>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: None,
            length: None,
            support: None,
            attributes: BTreeMap::new(),
            parent,
            children: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// A rooted phylogenetic tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    nodes: Vec<TreeNode>,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    /// Create a tree containing only an unnamed root.
    pub fn new() -> Self {
        Self {
            nodes: vec![TreeNode::new(None)],
        }
    }

    pub fn root(&self) -> NodeIdx {
        NodeIdx(0)
    }

    /// Total number of nodes, including the root.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add a child under `parent`. Returns the child's index.
    pub fn add_child(&mut self, parent: NodeIdx) -> NodeIdx {
        let idx = NodeIdx(self.nodes.len() as u32);
        self.nodes.push(TreeNode::new(Some(parent)));
        self.nodes[parent.index()].children.push(idx);
        idx
    }

    /// Add a named child under `parent`.
    pub fn add_named_child(&mut self, parent: NodeIdx, name: impl Into<String>) -> NodeIdx {
        let idx = self.add_child(parent);
        self.nodes[idx.index()].name = Some(name.into());
        idx
    }

    #[inline]
    pub fn get(&self, idx: NodeIdx) -> Option<&TreeNode> {
        self.nodes.get(idx.index())
    }

    #[inline]
    pub fn get_mut(&mut self, idx: NodeIdx) -> Option<&mut TreeNode> {
        self.nodes.get_mut(idx.index())
    }

    pub fn children(&self, idx: NodeIdx) -> &[NodeIdx] {
        self.get(idx).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    pub fn parent(&self, idx: NodeIdx) -> Option<NodeIdx> {
        self.get(idx).and_then(|n| n.parent)
    }

    /// Nodes in pre-order starting from the root.
    pub fn preorder(&self) -> Vec<NodeIdx> {
        self.preorder_from(self.root())
    }

    /// Nodes in pre-order starting from `start`.
    pub fn preorder_from(&self, start: NodeIdx) -> Vec<NodeIdx> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![start];
        while let Some(idx) = stack.pop() {
            order.push(idx);
            for &child in self.children(idx).iter().rev() {
                stack.push(child);
            }
        }
        order
    }

    /// Nodes in post-order starting from the root.
    pub fn postorder(&self) -> Vec<NodeIdx> {
        let mut order = self.preorder_reversed_children();
        order.reverse();
        order
    }

    fn preorder_reversed_children(&self) -> Vec<NodeIdx> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root()];
        while let Some(idx) = stack.pop() {
            order.push(idx);
            for &child in self.children(idx) {
                stack.push(child);
            }
        }
        order
    }

    /// Leaves under `idx` (including `idx` itself when it is a leaf), in order.
    pub fn leaves(&self, idx: NodeIdx) -> Vec<NodeIdx> {
        self.preorder_from(idx)
            .into_iter()
            .filter(|&i| self.nodes[i.index()].is_leaf())
            .collect()
    }

    /// Names of the leaves under `idx`, skipping unnamed leaves.
    pub fn leaf_names(&self, idx: NodeIdx) -> BTreeSet<String> {
        self.leaves(idx)
            .into_iter()
            .filter_map(|i| self.nodes[i.index()].name.clone())
            .collect()
    }

    pub fn find_by_id(&self, id: &str) -> Option<NodeIdx> {
        self.nodes
            .iter()
            .position(|n| n.id == id)
            .map(|i| NodeIdx(i as u32))
    }

    /// All nodes whose name equals `name`.
    pub fn find_by_name(&self, name: &str) -> Vec<NodeIdx> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.name.as_deref() == Some(name))
            .map(|(i, _)| NodeIdx(i as u32))
            .collect()
    }

    pub fn depth(&self, idx: NodeIdx) -> usize {
        let mut depth = 0;
        let mut cur = idx;
        while let Some(parent) = self.parent(cur) {
            depth += 1;
            cur = parent;
        }
        depth
    }

    /// Lowest common ancestor of `nodes`. `None` for an empty slice.
    pub fn lca(&self, nodes: &[NodeIdx]) -> Option<NodeIdx> {
        let (&first, rest) = nodes.split_first()?;
        let mut ancestors = Vec::new();
        let mut cur = Some(first);
        while let Some(idx) = cur {
            ancestors.push(idx);
            cur = self.parent(idx);
        }
        // Deepest ancestor of `first` that is an ancestor-or-self of every other node
        let mut best = 0;
        for &other in rest {
            let chain: BTreeSet<NodeIdx> = {
                let mut set = BTreeSet::new();
                let mut c = Some(other);
                while let Some(idx) = c {
                    set.insert(idx);
                    c = self.parent(idx);
                }
                set
            };
            while best < ancestors.len() && !chain.contains(&ancestors[best]) {
                best += 1;
            }
        }
        ancestors.get(best).copied()
    }

    /// Lowest common ancestor of the nodes carrying `names`.
    ///
    /// Returns `None` when any name is missing or matches more than one node.
    pub fn lca_of_names<'a, I>(&self, names: I) -> Option<NodeIdx>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut matched = Vec::new();
        for name in names {
            let hits = self.find_by_name(name);
            if hits.len() != 1 {
                return None;
            }
            matched.push(hits[0]);
        }
        self.lca(&matched)
    }

    /// Read an attribute by name. `Name`/`Length`/`Support` map to fields.
    pub fn attribute(&self, idx: NodeIdx, name: &str) -> Option<AttributeValue> {
        let node = self.get(idx)?;
        match name {
            ATTR_NAME => node.name.clone().map(AttributeValue::Text),
            ATTR_LENGTH => node.length.map(AttributeValue::Number),
            ATTR_SUPPORT => node.support.map(AttributeValue::Number),
            _ => node.attributes.get(name).cloned(),
        }
    }

    /// Write an attribute by name. Numeric fields reject non-numeric text.
    pub fn set_attribute(
        &mut self,
        idx: NodeIdx,
        name: &str,
        value: Option<AttributeValue>,
    ) -> Result<(), String> {
        let node = self
            .get_mut(idx)
            .ok_or_else(|| format!("node {:?} does not exist", idx))?;
        match name {
            ATTR_NAME => node.name = value.map(|v| v.to_string()),
            ATTR_LENGTH | ATTR_SUPPORT => {
                let number = match value {
                    None => None,
                    Some(v) => Some(
                        v.as_number()
                            .ok_or_else(|| format!("attribute {} must be numeric", name))?,
                    ),
                };
                if name == ATTR_LENGTH {
                    node.length = number;
                } else {
                    node.support = number;
                }
            }
            _ => match value {
                Some(v) => {
                    node.attributes.insert(name.to_string(), v);
                }
                None => {
                    node.attributes.remove(name);
                }
            },
        }
        Ok(())
    }

    /// Sorted union of every attribute name present on any node.
    pub fn attribute_names(&self) -> Vec<String> {
        let mut names = BTreeSet::new();
        for node in &self.nodes {
            if node.name.is_some() {
                names.insert(ATTR_NAME.to_string());
            }
            if node.length.is_some() {
                names.insert(ATTR_LENGTH.to_string());
            }
            if node.support.is_some() {
                names.insert(ATTR_SUPPORT.to_string());
            }
            names.extend(node.attributes.keys().cloned());
        }
        names.into_iter().collect()
    }

    /// Sort every node's children by leaf count.
    pub fn ladderize(&mut self, descending: bool) {
        let mut leaf_counts = vec![0usize; self.nodes.len()];
        for idx in self.postorder() {
            let node = &self.nodes[idx.index()];
            leaf_counts[idx.index()] = if node.is_leaf() {
                1
            } else {
                node.children.iter().map(|c| leaf_counts[c.index()]).sum()
            };
        }
        for node in &mut self.nodes {
            node.children.sort_by_key(|c| leaf_counts[c.index()]);
            if descending {
                node.children.reverse();
            }
        }
    }

    /// Sum of branch lengths from the root to `idx`; missing lengths count as 0.
    pub fn root_distance(&self, idx: NodeIdx) -> f64 {
        let mut total = 0.0;
        let mut cur = idx;
        while let Some(parent) = self.parent(cur) {
            total += self.nodes[cur.index()].length.unwrap_or(0.0);
            cur = parent;
        }
        total
    }

    pub fn has_branch_lengths(&self) -> bool {
        self.nodes.iter().skip(1).any(|n| n.length.is_some())
    }
}

/// An ordered set of trees produced by a Load stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreeCollection {
    trees: Vec<Tree>,
}

impl TreeCollection {
    pub fn new(trees: Vec<Tree>) -> Self {
        Self { trees }
    }

    pub fn len(&self) -> usize {
        self.trees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Tree> {
        self.trees.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tree> {
        self.trees.iter()
    }

    pub fn into_vec(self) -> Vec<Tree> {
        self.trees
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// ((A,B)ab,(C,D)cd)root
    fn sample() -> Tree {
        let mut tree = Tree::new();
        let root = tree.root();
        tree.get_mut(root).unwrap().name = Some("root".into());
        let ab = tree.add_named_child(root, "ab");
        let cd = tree.add_named_child(root, "cd");
        tree.add_named_child(ab, "A");
        tree.add_named_child(ab, "B");
        tree.add_named_child(cd, "C");
        tree.add_named_child(cd, "D");
        tree
    }

    #[test]
    fn test_preorder_and_leaves() {
        let tree = sample();
        let names: Vec<_> = tree
            .preorder()
            .into_iter()
            .map(|i| tree.get(i).unwrap().name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["root", "ab", "A", "B", "cd", "C", "D"]);
        assert_eq!(tree.leaves(tree.root()).len(), 4);
    }

    #[test]
    fn test_lca_of_names() {
        let tree = sample();
        let names: BTreeSet<String> = ["A", "B"].iter().map(|s| s.to_string()).collect();
        let lca = tree.lca_of_names(&names).unwrap();
        assert_eq!(tree.get(lca).unwrap().name.as_deref(), Some("ab"));

        let across: BTreeSet<String> = ["A", "D"].iter().map(|s| s.to_string()).collect();
        assert_eq!(tree.lca_of_names(&across), Some(tree.root()));
    }

    #[test]
    fn test_lca_missing_or_ambiguous_name() {
        let mut tree = sample();
        let missing: BTreeSet<String> = ["A", "Z"].iter().map(|s| s.to_string()).collect();
        assert!(tree.lca_of_names(&missing).is_none());

        let root = tree.root();
        tree.add_named_child(root, "A");
        let dup: BTreeSet<String> = ["A"].iter().map(|s| s.to_string()).collect();
        assert!(tree.lca_of_names(&dup).is_none());
    }

    #[test]
    fn test_attributes_round_trip_through_fields() {
        let mut tree = sample();
        let a = tree.find_by_name("A")[0];
        tree.set_attribute(a, ATTR_LENGTH, Some(AttributeValue::Text("0.5".into())))
            .unwrap();
        tree.set_attribute(a, "Host", Some(AttributeValue::Text("human".into())))
            .unwrap();
        assert_eq!(tree.attribute(a, ATTR_LENGTH), Some(AttributeValue::Number(0.5)));
        assert!(tree
            .set_attribute(a, ATTR_SUPPORT, Some(AttributeValue::Text("high".into())))
            .is_err());
        assert_eq!(tree.attribute_names(), vec!["Host", "Length", "Name"]);
    }

    #[test]
    fn test_clone_preserves_ids() {
        let tree = sample();
        let copy = tree.clone();
        let a = tree.find_by_name("A")[0];
        let id = &tree.get(a).unwrap().id;
        assert_eq!(copy.find_by_id(id), Some(a));
    }

    #[test]
    fn test_ladderize() {
        let mut tree = Tree::new();
        let root = tree.root();
        let big = tree.add_named_child(root, "big");
        tree.add_named_child(big, "x");
        tree.add_named_child(big, "y");
        let small = tree.add_named_child(root, "small");

        tree.ladderize(false);
        assert_eq!(tree.children(root), &[small, big]);
        tree.ladderize(true);
        assert_eq!(tree.children(root), &[big, small]);
    }
}
