//! Identifiers and aggregate value types shared by the hierarchy and the caches.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Deepest depth a category may sit at. Roots are depth 0, so the tree has
/// three levels: root, child, grandchild.
pub const MAX_DEPTH: u8 = 2;

/// Identifier of a category (a node in the bounded-depth hierarchy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub i64);

impl NodeId {
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> i64 {
        self.0
    }
}

impl From<i64> for NodeId {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A category as seen by the hierarchy store.
///
/// Invariant: `depth == depth(parent) + 1`, and `depth <= MAX_DEPTH`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
    pub depth: u8,
}

impl Node {
    pub const fn root(id: NodeId) -> Self {
        Self {
            id,
            parent_id: None,
            depth: 0,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Attachment totals for a category, either flat or recursive.
///
/// Both fields are additive, so a subtree's stats can be subtracted from one
/// ancestor chain and added to another without reloading anything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileStats {
    pub file_count: u64,
    pub total_size: u64,
}

impl FileStats {
    pub const ZERO: FileStats = FileStats::new(0, 0);

    pub const fn new(file_count: u64, total_size: u64) -> Self {
        Self {
            file_count,
            total_size,
        }
    }

    /// A single file of `size` bytes.
    pub const fn single(size: u64) -> Self {
        Self::new(1, size)
    }

    pub fn saturating_add(self, other: FileStats) -> Self {
        Self {
            file_count: self.file_count.saturating_add(other.file_count),
            total_size: self.total_size.saturating_add(other.total_size),
        }
    }

    /// Subtract field by field, each floored at zero independently.
    pub fn saturating_sub(self, other: FileStats) -> Self {
        Self {
            file_count: self.file_count.saturating_sub(other.file_count),
            total_size: self.total_size.saturating_sub(other.total_size),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.file_count == 0 && self.total_size == 0
    }
}

/// The subject of an activity histogram: one category, or every post on the site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityScope {
    All,
    Node(NodeId),
}

impl ActivityScope {
    pub fn node(self) -> Option<NodeId> {
        match self {
            ActivityScope::All => None,
            ActivityScope::Node(id) => Some(id),
        }
    }
}

impl From<NodeId> for ActivityScope {
    fn from(id: NodeId) -> Self {
        ActivityScope::Node(id)
    }
}

impl fmt::Display for ActivityScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivityScope::All => f.write_str("all"),
            ActivityScope::Node(id) => write!(f, "{id}"),
        }
    }
}
