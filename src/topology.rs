//! Shape of the deployment tree.

use std::collections::{HashMap, HashSet};

/// Parent id recorded for the root of the tree.
pub const NO_PARENT: i32 = -1;

/// Parent-pointer map of the deployed nodes.
#[derive(Clone, Debug, Default)]
pub struct DeploymentTree {
    parents: HashMap<i32, i32>,
}

impl DeploymentTree {
    /// Build a tree from `(node, parent)` pairs. The root's parent is
    /// [`NO_PARENT`].
    pub fn new(edges: impl IntoIterator<Item = (i32, i32)>) -> Self {
        Self {
            parents: edges.into_iter().collect(),
        }
    }

    pub fn contains(&self, node: i32) -> bool {
        self.parents.contains_key(&node)
    }

    pub fn parent(&self, node: i32) -> Option<i32> {
        self.parents.get(&node).copied().filter(|p| *p != NO_PARENT)
    }

    pub fn children(&self, node: i32) -> Vec<i32> {
        let mut out: Vec<i32> = self
            .parents
            .iter()
            .filter(|(_, p)| **p == node)
            .map(|(c, _)| *c)
            .collect();
        out.sort_unstable();
        out
    }

    pub fn nodes(&self) -> Vec<i32> {
        let mut out: Vec<i32> = self.parents.keys().copied().collect();
        out.sort_unstable();
        out
    }

    /// `node` followed by each of its ancestors up to the root. Stops if the
    /// parent map contains a cycle.
    pub fn path_to_root(&self, node: i32) -> Vec<i32> {
        let mut path = vec![node];
        let mut seen = HashSet::from([node]);
        let mut current = node;
        while let Some(parent) = self.parent(current) {
            if !seen.insert(parent) {
                tracing::warn!(node, parent, "cycle in deployment tree");
                break;
            }
            path.push(parent);
            current = parent;
        }
        path
    }

    /// Lowest common ancestor of `source` and `destination`.
    ///
    /// Walks from `source` to the root marking every node; if `destination`
    /// is on that walk it is the answer, otherwise the first marked node on
    /// the walk up from `destination` is. Returns `None` when either node is
    /// unknown or they share no ancestor.
    pub fn lca(&self, source: i32, destination: i32) -> Option<i32> {
        if !self.contains(source) || !self.contains(destination) {
            return None;
        }
        let marked: HashSet<i32> = self.path_to_root(source).into_iter().collect();
        if marked.contains(&destination) {
            return Some(destination);
        }
        self.path_to_root(destination)
            .into_iter()
            .find(|n| marked.contains(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 1 <- 2 <- 4, 1 <- 3
    fn tree() -> DeploymentTree {
        DeploymentTree::new([(1, NO_PARENT), (2, 1), (3, 1), (4, 2)])
    }

    #[test]
    fn lca_of_siblings_and_ancestors() {
        let t = tree();
        assert_eq!(t.lca(4, 3), Some(1));
        assert_eq!(t.lca(4, 2), Some(2));
        assert_eq!(t.lca(2, 4), Some(2));
        assert_eq!(t.lca(4, 4), Some(4));
        assert_eq!(t.lca(3, 1), Some(1));
        assert_eq!(t.lca(4, 9), None);
    }

    #[test]
    fn children_and_paths_follow_parent_pointers() {
        let t = tree();
        assert_eq!(t.path_to_root(4), vec![4, 2, 1]);
        assert_eq!(t.children(1), vec![2, 3]);
        assert!(t.children(4).is_empty());
        assert_eq!(t.parent(1), None);
    }

    #[test]
    fn cycles_do_not_hang() {
        let t = DeploymentTree::new([(1, 2), (2, 1)]);
        assert_eq!(t.path_to_root(1), vec![1, 2]);
        assert_eq!(t.lca(1, 2), Some(2));
    }
}
