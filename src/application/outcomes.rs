//! Authoritative values returned to the client after a mutation.
//!
//! The client mirror has no push channel; it updates itself from these.

use serde::{Deserialize, Serialize};
use time::Date;

use crate::cache::CacheCoordinator;
use crate::domain::{FileStats, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostCountOutcome {
    pub node: NodeId,
    pub direct: u64,
    pub recursive: u64,
}

/// Result of reparenting a category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryMoveOutcome {
    pub node: NodeId,
    pub old_parent: Option<NodeId>,
    pub new_parent: Option<NodeId>,
    /// Recursive file stats of the moved subtree.
    pub delta: FileStats,
    /// Fresh counts for every node on both ancestor chains.
    pub post_counts: Vec<PostCountOutcome>,
}

/// Result of creating, deleting or moving a post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostMutationOutcome {
    /// Every category on the affected ancestor chains.
    pub affected: Vec<NodeId>,
    pub day: Date,
    pub post_counts: Vec<PostCountOutcome>,
}

/// Current direct and recursive counts for `nodes`, read from the cache.
pub fn post_count_outcomes(cache: &CacheCoordinator, nodes: &[NodeId]) -> Vec<PostCountOutcome> {
    nodes
        .iter()
        .map(|node| PostCountOutcome {
            node: *node,
            direct: cache.get_post_count(*node),
            recursive: cache.get_post_count_recursive(*node),
        })
        .collect()
}

/// `first` followed by the members of `second` not already present.
pub(crate) fn merge_chains(first: Vec<NodeId>, second: Vec<NodeId>) -> Vec<NodeId> {
    let mut out = first;
    for id in second {
        if !out.contains(&id) {
            out.push(id);
        }
    }
    out
}
