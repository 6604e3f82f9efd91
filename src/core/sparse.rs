//! A sparse tree of values registered to be written when the connection
//! drops, mirroring the server's disconnect handlers locally.

use std::collections::HashMap;

use super::node::Node;
use super::path::{Name, Path};

/// Sparse snapshot tree: each node carries either a stored value or child
/// subtrees, never both.
#[derive(Debug, Default)]
pub struct SparseSnapshotTree {
    value: Option<Node>,
    children: HashMap<Name, SparseSnapshotTree>,
}

impl SparseSnapshotTree {
    /// Stores `node` at `path`. A value stored at an ancestor is re-expanded
    /// into per-child subtrees first, so the coarse value and the finer one
    /// coexist. A value at the target forgets any finer children.
    pub fn remember(&mut self, path: &Path, node: Node) {
        let mut tree = self;
        for name in path.iter() {
            tree.expand_value();
            tree = tree.children.entry(name.clone()).or_default();
        }
        tree.value = Some(node);
        tree.children.clear();
    }

    /// Removes whatever is stored at or below `path`, re-expanding coarse
    /// ancestor values on the way down. Returns true when the whole tree is
    /// empty afterwards.
    pub fn forget(&mut self, path: &Path) -> bool {
        self.forget_inner(path.as_slice());
        self.is_empty()
    }

    fn forget_inner(&mut self, segments: &[Name]) {
        let Some((name, rest)) = segments.split_first() else {
            self.value = None;
            self.children.clear();
            return;
        };
        self.expand_value();
        if let Some(child) = self.children.get_mut(name) {
            child.forget_inner(rest);
            if child.is_empty() {
                self.children.remove(name);
            }
        }
    }

    /// True when nothing is stored anywhere.
    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.children.is_empty()
    }

    /// Visits every stored value with its absolute path.
    pub fn for_each(&self, prefix: &Path, visit: &mut impl FnMut(&Path, &Node)) {
        if let Some(value) = &self.value {
            visit(prefix, value);
            return;
        }
        for (name, child) in &self.children {
            child.for_each(&prefix.child(name.clone()), visit);
        }
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        self.value = None;
        self.children.clear();
    }

    fn expand_value(&mut self) {
        let Some(value) = self.value.take() else {
            return;
        };
        for (name, child) in value.children() {
            self.children.insert(
                name.clone(),
                SparseSnapshotTree {
                    value: Some(child.clone()),
                    children: HashMap::new(),
                },
            );
        }
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    fn path(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    fn node(json: serde_json::Value) -> Node {
        Node::from_json(&json)
    }

    fn collect(tree: &SparseSnapshotTree) -> Vec<(String, Node)> {
        let mut out = Vec::new();
        tree.for_each(&Path::root(), &mut |p, n| out.push((p.to_string(), n.clone())));
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    #[test]
    fn remember_expands_coarse_values() {
        let mut tree = SparseSnapshotTree::default();
        tree.remember(&path("/a"), node(json!({"x": 1})));
        tree.remember(&path("/a/y"), Node::leaf(2));
        assert_eq!(
            collect(&tree),
            vec![
                ("/a/x".to_string(), Node::leaf(1)),
                ("/a/y".to_string(), Node::leaf(2)),
            ]
        );
    }

    #[test]
    fn remember_at_ancestor_forgets_finer_values() {
        let mut tree = SparseSnapshotTree::default();
        tree.remember(&path("/a/x"), Node::leaf(1));
        tree.remember(&path("/a"), Node::leaf(9));
        assert_eq!(collect(&tree), vec![("/a".to_string(), Node::leaf(9))]);
    }

    #[test]
    fn forget_undoes_remember() {
        let mut tree = SparseSnapshotTree::default();
        tree.remember(&path("/a"), Node::leaf(1));
        assert!(tree.forget(&path("/a")));
        assert!(tree.is_empty());
    }

    #[test]
    fn forget_below_coarse_value_preserves_siblings() {
        let mut tree = SparseSnapshotTree::default();
        tree.remember(&path("/a"), node(json!({"x": 1, "y": 2})));
        assert!(!tree.forget(&path("/a/x")));
        assert_eq!(collect(&tree), vec![("/a/y".to_string(), Node::leaf(2))]);
    }

    #[test]
    fn forget_missing_path_is_harmless() {
        let mut tree = SparseSnapshotTree::default();
        tree.remember(&path("/a"), Node::leaf(1));
        assert!(!tree.forget(&path("/b/c")));
        assert_eq!(collect(&tree).len(), 1);
    }
}
