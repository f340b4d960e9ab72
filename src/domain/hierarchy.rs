//! In-memory category tree.
//!
//! Loaded once from the persistent store at startup and mutated on every
//! category create, move and delete. Every read takes a single lock
//! acquisition, so no caller observes a tree halfway through a reparent.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::RwLock;

use thiserror::Error;
use tracing::{debug, warn};

use super::types::{MAX_DEPTH, Node, NodeId};
use crate::util::lock::{rw_read, rw_write};

const SOURCE: &str = "domain::hierarchy";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HierarchyError {
    #[error("category `{0}` does not exist")]
    UnknownNode(NodeId),
    #[error("category `{child}` references missing parent `{parent}`")]
    UnknownParent { child: NodeId, parent: NodeId },
    #[error("category `{0}` already exists")]
    DuplicateNode(NodeId),
    #[error("category `{0}` references itself as a parent")]
    SelfParent(NodeId),
    #[error("moving category `{node}` under `{parent}` would create a cycle")]
    Cycle { node: NodeId, parent: NodeId },
    #[error("category `{node}` would reach depth {depth}, exceeding maximum depth {max_depth}")]
    DepthViolation {
        node: NodeId,
        depth: u8,
        max_depth: u8,
    },
    #[error("category `{node}` still has {children} child categories")]
    HasChildren { node: NodeId, children: usize },
}

#[derive(Debug, Default)]
struct Tree {
    nodes: HashMap<NodeId, Node>,
    children: HashMap<NodeId, BTreeSet<NodeId>>,
    roots: BTreeSet<NodeId>,
}

impl Tree {
    fn attach(&mut self, node: Node) {
        match node.parent_id {
            Some(parent) => {
                self.children.entry(parent).or_default().insert(node.id);
            }
            None => {
                self.roots.insert(node.id);
            }
        }
        self.nodes.insert(node.id, node);
    }

    fn detach(&mut self, id: NodeId, parent: Option<NodeId>) {
        match parent {
            Some(parent) => {
                if let Some(siblings) = self.children.get_mut(&parent) {
                    siblings.remove(&id);
                    if siblings.is_empty() {
                        self.children.remove(&parent);
                    }
                }
            }
            None => {
                self.roots.remove(&id);
            }
        }
    }

    fn children_of(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.children.get(&id).into_iter().flatten().copied()
    }

    /// Breadth-first descendants of `id`, excluding `id`.
    fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut queue: VecDeque<NodeId> = self.children_of(id).collect();
        while let Some(next) = queue.pop_front() {
            out.push(next);
            queue.extend(self.children_of(next));
        }
        out
    }

    /// `id` followed by its ancestors up to the root.
    fn chain(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(usize::from(MAX_DEPTH) + 1);
        let mut cursor = self.nodes.get(&id);
        while let Some(node) = cursor {
            out.push(node.id);
            cursor = node.parent_id.and_then(|parent| self.nodes.get(&parent));
        }
        out
    }

    /// Distance from `id` to its deepest descendant.
    fn subtree_height(&self, id: NodeId) -> u8 {
        self.children_of(id)
            .map(|child| self.subtree_height(child) + 1)
            .max()
            .unwrap_or(0)
    }

    fn depth_under(&self, parent: Option<NodeId>) -> Result<u8, NodeId> {
        match parent {
            None => Ok(0),
            Some(parent) => self
                .nodes
                .get(&parent)
                .map(|node| node.depth + 1)
                .ok_or(parent),
        }
    }

    fn check_reparent(
        &self,
        id: NodeId,
        new_parent: Option<NodeId>,
    ) -> Result<u8, HierarchyError> {
        if !self.nodes.contains_key(&id) {
            return Err(HierarchyError::UnknownNode(id));
        }

        if let Some(parent) = new_parent {
            if parent == id {
                return Err(HierarchyError::SelfParent(id));
            }
            if !self.nodes.contains_key(&parent) {
                return Err(HierarchyError::UnknownParent { child: id, parent });
            }
            if self.chain(parent).contains(&id) {
                return Err(HierarchyError::Cycle { node: id, parent });
            }
        }

        let new_depth = self
            .depth_under(new_parent)
            .map_err(|parent| HierarchyError::UnknownParent { child: id, parent })?;
        let deepest = new_depth + self.subtree_height(id);
        if deepest > MAX_DEPTH {
            return Err(HierarchyError::DepthViolation {
                node: id,
                depth: deepest,
                max_depth: MAX_DEPTH,
            });
        }

        Ok(new_depth)
    }
}

/// The category tree shared by every aggregate cache.
#[derive(Debug, Default)]
pub struct HierarchyStore {
    tree: RwLock<Tree>,
}

impl HierarchyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the tree with `nodes`, recomputing depths from parent links.
    ///
    /// Stored depths that disagree with the parent links are logged and
    /// corrected; depths past [`MAX_DEPTH`] and cycles are rejected.
    pub fn load(&self, nodes: Vec<Node>) -> Result<usize, HierarchyError> {
        let mut parents: HashMap<NodeId, Option<NodeId>> = HashMap::with_capacity(nodes.len());
        let mut stored_depths: HashMap<NodeId, u8> = HashMap::with_capacity(nodes.len());

        for node in &nodes {
            if node.parent_id == Some(node.id) {
                return Err(HierarchyError::SelfParent(node.id));
            }
            if parents.insert(node.id, node.parent_id).is_some() {
                return Err(HierarchyError::DuplicateNode(node.id));
            }
            stored_depths.insert(node.id, node.depth);
        }

        let mut tree = Tree::default();
        for (&id, &parent) in &parents {
            let depth = resolve_depth(id, &parents)?;
            if let Some(&stored) = stored_depths.get(&id)
                && stored != depth
            {
                warn!(
                    node = %id,
                    stored,
                    computed = depth,
                    "Stored category depth disagrees with parent links; using computed depth"
                );
            }
            tree.attach(Node {
                id,
                parent_id: parent,
                depth,
            });
        }

        let count = tree.nodes.len();
        *rw_write(&self.tree, SOURCE, "load") = tree;
        debug!(nodes = count, "Hierarchy loaded");
        Ok(count)
    }

    /// Every node, ordered by depth then id.
    pub fn snapshot(&self) -> Vec<Node> {
        let tree = rw_read(&self.tree, SOURCE, "snapshot");
        let mut nodes: Vec<Node> = tree.nodes.values().copied().collect();
        nodes.sort_by_key(|node| (node.depth, node.id));
        nodes
    }

    pub fn get(&self, id: NodeId) -> Option<Node> {
        rw_read(&self.tree, SOURCE, "get").nodes.get(&id).copied()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        rw_read(&self.tree, SOURCE, "contains")
            .nodes
            .contains_key(&id)
    }

    pub fn len(&self) -> usize {
        rw_read(&self.tree, SOURCE, "len").nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn roots(&self) -> Vec<NodeId> {
        rw_read(&self.tree, SOURCE, "roots")
            .roots
            .iter()
            .copied()
            .collect()
    }

    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        rw_read(&self.tree, SOURCE, "children")
            .children_of(id)
            .collect()
    }

    /// Transitive closure of `children`, excluding `id` itself.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        rw_read(&self.tree, SOURCE, "descendants").descendants(id)
    }

    /// `id` together with all of its descendants, read under one lock.
    pub fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let tree = rw_read(&self.tree, SOURCE, "subtree");
        if !tree.nodes.contains_key(&id) {
            return Vec::new();
        }
        let mut out = vec![id];
        out.extend(tree.descendants(id));
        out
    }

    /// Ancestors of `id` from its parent up to the root.
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut chain = self.chain(id);
        if !chain.is_empty() {
            chain.remove(0);
        }
        chain
    }

    /// `id` followed by its ancestors; empty when `id` is unknown.
    pub fn chain(&self, id: NodeId) -> Vec<NodeId> {
        rw_read(&self.tree, SOURCE, "chain").chain(id)
    }

    /// Chain starting at an optional parent; `None` (the root level) has no chain.
    pub fn chain_from(&self, parent: Option<NodeId>) -> Vec<NodeId> {
        parent.map(|id| self.chain(id)).unwrap_or_default()
    }

    pub fn subtree_height(&self, id: NodeId) -> u8 {
        rw_read(&self.tree, SOURCE, "subtree_height").subtree_height(id)
    }

    /// Insert a new category under `parent`, computing its depth.
    pub fn add(&self, id: NodeId, parent: Option<NodeId>) -> Result<Node, HierarchyError> {
        let mut tree = rw_write(&self.tree, SOURCE, "add");
        if tree.nodes.contains_key(&id) {
            return Err(HierarchyError::DuplicateNode(id));
        }
        if parent == Some(id) {
            return Err(HierarchyError::SelfParent(id));
        }

        let depth = tree
            .depth_under(parent)
            .map_err(|parent| HierarchyError::UnknownParent { child: id, parent })?;
        if depth > MAX_DEPTH {
            return Err(HierarchyError::DepthViolation {
                node: id,
                depth,
                max_depth: MAX_DEPTH,
            });
        }

        let node = Node {
            id,
            parent_id: parent,
            depth,
        };
        tree.attach(node);
        Ok(node)
    }

    /// Validate a move without applying it. Returns the node's new depth.
    pub fn check_reparent(
        &self,
        id: NodeId,
        new_parent: Option<NodeId>,
    ) -> Result<u8, HierarchyError> {
        rw_read(&self.tree, SOURCE, "check_reparent").check_reparent(id, new_parent)
    }

    /// Move `id` (with its subtree) under `new_parent`.
    ///
    /// Fails with [`HierarchyError::DepthViolation`] if any descendant would
    /// end up deeper than [`MAX_DEPTH`]. Returns the previous parent.
    pub fn reparent(
        &self,
        id: NodeId,
        new_parent: Option<NodeId>,
    ) -> Result<Option<NodeId>, HierarchyError> {
        let mut tree = rw_write(&self.tree, SOURCE, "reparent");
        let new_depth = tree.check_reparent(id, new_parent)?;
        let node = tree.nodes[&id];
        let old_parent = node.parent_id;
        if old_parent == new_parent {
            return Ok(old_parent);
        }

        tree.detach(id, old_parent);
        tree.attach(Node {
            id,
            parent_id: new_parent,
            depth: new_depth,
        });

        // Breadth-first order guarantees a parent's depth is updated before its children.
        for descendant in tree.descendants(id) {
            let Some(parent) = tree.nodes.get(&descendant).and_then(|n| n.parent_id) else {
                continue;
            };
            let depth = tree.nodes.get(&parent).map_or(0, |p| p.depth + 1);
            if let Some(entry) = tree.nodes.get_mut(&descendant) {
                entry.depth = depth;
            }
        }

        debug!(node = %id, ?old_parent, ?new_parent, depth = new_depth, "Category reparented");
        Ok(old_parent)
    }

    /// Remove a leaf category. Refuses with [`HierarchyError::HasChildren`]
    /// rather than cascading.
    pub fn remove(&self, id: NodeId) -> Result<Node, HierarchyError> {
        let mut tree = rw_write(&self.tree, SOURCE, "remove");
        let node = *tree
            .nodes
            .get(&id)
            .ok_or(HierarchyError::UnknownNode(id))?;
        let children = tree.children.get(&id).map_or(0, BTreeSet::len);
        if children > 0 {
            return Err(HierarchyError::HasChildren { node: id, children });
        }
        tree.detach(id, node.parent_id);
        tree.nodes.remove(&id);
        Ok(node)
    }

    /// Remove `id` and its whole subtree. Returned ids are deepest-first.
    pub fn remove_cascade(&self, id: NodeId) -> Result<Vec<NodeId>, HierarchyError> {
        let mut tree = rw_write(&self.tree, SOURCE, "remove_cascade");
        let node = *tree
            .nodes
            .get(&id)
            .ok_or(HierarchyError::UnknownNode(id))?;

        let mut removed = tree.descendants(id);
        removed.reverse();
        removed.push(id);

        tree.detach(id, node.parent_id);
        for victim in &removed {
            tree.children.remove(victim);
            tree.nodes.remove(victim);
        }
        Ok(removed)
    }
}

fn resolve_depth(
    id: NodeId,
    parents: &HashMap<NodeId, Option<NodeId>>,
) -> Result<u8, HierarchyError> {
    let mut seen = HashSet::new();
    let mut depth: u8 = 0;
    let mut cursor = id;
    seen.insert(id);

    while let Some(parent) = parents.get(&cursor).copied().flatten() {
        if !parents.contains_key(&parent) {
            return Err(HierarchyError::UnknownParent {
                child: cursor,
                parent,
            });
        }
        if !seen.insert(parent) {
            return Err(HierarchyError::Cycle { node: id, parent });
        }
        depth += 1;
        if depth > MAX_DEPTH {
            return Err(HierarchyError::DepthViolation {
                node: id,
                depth,
                max_depth: MAX_DEPTH,
            });
        }
        cursor = parent;
    }

    Ok(depth)
}
