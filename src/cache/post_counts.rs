//! Direct post counts per category.
//!
//! Only direct counts are stored. Recursive counts are summed over the
//! subtree on every read, so they stay correct no matter how categories
//! were moved around.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use super::dispatcher::{EventHandler, HandlerError};
use super::events::{CacheEvent, EventKind, EventType};
use crate::domain::{HierarchyStore, NodeId};
use crate::util::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::post_counts";

/// Event types the post-count cache reacts to.
pub const POST_COUNT_EVENTS: [EventType; 4] = [
    EventType::PostCreated,
    EventType::PostDeleted,
    EventType::PostMoved,
    EventType::CategoryRemoved,
];

/// Diagnostic snapshot of the post-count cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PostCountStats {
    /// Categories with a non-zero direct count.
    pub tracked_nodes: usize,
    pub total_posts: u64,
    /// Decrements that hit zero and were floored instead of going negative.
    pub floored_decrements: u64,
}

pub struct PostCountCache {
    hierarchy: Arc<HierarchyStore>,
    direct: RwLock<HashMap<NodeId, u64>>,
    floored: AtomicU64,
}

impl PostCountCache {
    pub fn new(hierarchy: Arc<HierarchyStore>) -> Self {
        Self {
            hierarchy,
            direct: RwLock::new(HashMap::new()),
            floored: AtomicU64::new(0),
        }
    }

    /// Replace every direct count with a bulk-loaded snapshot.
    pub fn initialize(&self, counts: HashMap<NodeId, u64>) {
        let mut direct = rw_write(&self.direct, SOURCE, "initialize");
        *direct = counts;
        direct.retain(|_, count| *count > 0);
    }

    pub fn get(&self, node: NodeId) -> u64 {
        rw_read(&self.direct, SOURCE, "get")
            .get(&node)
            .copied()
            .unwrap_or(0)
    }

    /// Sum of direct counts over `node` and all of its descendants.
    pub fn get_recursive(&self, node: NodeId) -> u64 {
        let subtree = self.hierarchy.subtree(node);
        let direct = rw_read(&self.direct, SOURCE, "get_recursive");
        if subtree.is_empty() {
            return direct.get(&node).copied().unwrap_or(0);
        }
        subtree
            .iter()
            .map(|id| direct.get(id).copied().unwrap_or(0))
            .sum()
    }

    pub fn total(&self) -> u64 {
        rw_read(&self.direct, SOURCE, "total").values().sum()
    }

    pub fn apply(&self, kind: &EventKind) {
        let mut direct = rw_write(&self.direct, SOURCE, "apply");
        match kind {
            EventKind::PostCreated { node, .. } => {
                *direct.entry(*node).or_insert(0) += 1;
            }
            EventKind::PostDeleted { node, .. } => {
                self.decrement(&mut direct, *node);
            }
            EventKind::PostMoved { from, to, .. } => {
                if from != to {
                    self.decrement(&mut direct, *from);
                    *direct.entry(*to).or_insert(0) += 1;
                }
            }
            EventKind::CategoryRemoved { node } => {
                if let Some(left) = direct.remove(node) {
                    warn!(
                        node = %node,
                        left,
                        "Removed category still had posts counted; dropping them"
                    );
                }
            }
            EventKind::CategoryUpdated { .. }
            | EventKind::FileUploaded { .. }
            | EventKind::FileDeleted { .. } => {}
        }
    }

    fn decrement(&self, direct: &mut HashMap<NodeId, u64>, node: NodeId) {
        match direct.get_mut(&node) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                direct.remove(&node);
            }
            None => {
                self.floored.fetch_add(1, Ordering::Relaxed);
                warn!(
                    node = %node,
                    "Post count decrement below zero; floored at zero"
                );
            }
        }
    }

    /// Drop the direct count of `node`.
    pub fn forget(&self, node: NodeId) {
        rw_write(&self.direct, SOURCE, "forget").remove(&node);
    }

    pub fn stats(&self) -> PostCountStats {
        let direct = rw_read(&self.direct, SOURCE, "stats");
        PostCountStats {
            tracked_nodes: direct.len(),
            total_posts: direct.values().sum(),
            floored_decrements: self.floored.load(Ordering::Relaxed),
        }
    }

    /// Set the direct count of `node` without going through the event path.
    pub fn seed_for_test(&self, node: NodeId, count: u64) {
        let mut direct = rw_write(&self.direct, SOURCE, "seed_for_test");
        if count == 0 {
            direct.remove(&node);
        } else {
            direct.insert(node, count);
        }
    }
}

/// Keeps a [`PostCountCache`] in step with post events.
pub struct PostCountHandler {
    cache: Arc<PostCountCache>,
}

impl PostCountHandler {
    pub fn new(cache: Arc<PostCountCache>) -> Self {
        Self { cache }
    }
}

impl EventHandler for PostCountHandler {
    fn name(&self) -> &'static str {
        "post_counts"
    }

    fn handle(&self, event: &CacheEvent) -> Result<(), HandlerError> {
        self.cache.apply(&event.kind);
        debug!(event_id = %event.id, event_kind = ?event.kind, "Post counts updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use time::macros::date;

    use super::*;
    use crate::domain::Node;

    fn tree() -> Arc<HierarchyStore> {
        let store = HierarchyStore::new();
        store
            .load(vec![
                Node::root(NodeId(1)),
                Node {
                    id: NodeId(2),
                    parent_id: Some(NodeId(1)),
                    depth: 1,
                },
                Node {
                    id: NodeId(3),
                    parent_id: Some(NodeId(2)),
                    depth: 2,
                },
                Node::root(NodeId(4)),
            ])
            .expect("tree loads");
        Arc::new(store)
    }

    fn created(node: i64) -> EventKind {
        EventKind::PostCreated {
            node: NodeId(node),
            day: date!(2024 - 05 - 01),
        }
    }

    fn deleted(node: i64) -> EventKind {
        EventKind::PostDeleted {
            node: NodeId(node),
            day: date!(2024 - 05 - 01),
        }
    }

    #[test]
    fn posts_under_grandchild_roll_up_to_every_ancestor() {
        let cache = PostCountCache::new(tree());
        for _ in 0..5 {
            cache.apply(&created(3));
        }

        assert_eq!(cache.get(NodeId(3)), 5);
        assert_eq!(cache.get(NodeId(1)), 0);
        assert_eq!(cache.get_recursive(NodeId(1)), 5);
        assert_eq!(cache.get_recursive(NodeId(2)), 5);
        assert_eq!(cache.get_recursive(NodeId(3)), 5);
        assert_eq!(cache.total(), 5);
    }

    #[test]
    fn delete_floors_at_zero_and_is_counted() {
        let cache = PostCountCache::new(tree());
        cache.apply(&created(2));
        cache.apply(&deleted(2));
        cache.apply(&deleted(2));

        assert_eq!(cache.get(NodeId(2)), 0);
        let stats = cache.stats();
        assert_eq!(stats.floored_decrements, 1);
        assert_eq!(stats.total_posts, 0);
        assert_eq!(stats.tracked_nodes, 0);
    }

    #[test]
    fn move_transfers_one_post() {
        let cache = PostCountCache::new(tree());
        cache.seed_for_test(NodeId(3), 2);

        cache.apply(&EventKind::PostMoved {
            from: NodeId(3),
            to: NodeId(4),
            day: date!(2024 - 05 - 01),
        });

        assert_eq!(cache.get(NodeId(3)), 1);
        assert_eq!(cache.get(NodeId(4)), 1);
        assert_eq!(cache.get_recursive(NodeId(1)), 1);
        assert_eq!(cache.total(), 2);
    }

    #[test]
    fn recursive_count_follows_reparenting_without_events() {
        let hierarchy = tree();
        let cache = PostCountCache::new(Arc::clone(&hierarchy));
        cache.seed_for_test(NodeId(3), 4);
        cache.seed_for_test(NodeId(2), 1);

        hierarchy
            .reparent(NodeId(3), Some(NodeId(4)))
            .expect("move is legal");

        assert_eq!(cache.get_recursive(NodeId(1)), 1);
        assert_eq!(cache.get_recursive(NodeId(4)), 4);
    }

    #[test]
    fn initialize_replaces_previous_counts() {
        let cache = PostCountCache::new(tree());
        cache.seed_for_test(NodeId(4), 9);

        cache.initialize(HashMap::from([(NodeId(1), 3), (NodeId(2), 0)]));

        assert_eq!(cache.get(NodeId(4)), 0);
        assert_eq!(cache.get(NodeId(1)), 3);
        assert_eq!(cache.stats().tracked_nodes, 1);
    }

    #[test]
    fn removed_category_is_forgotten() {
        let cache = PostCountCache::new(tree());
        cache.seed_for_test(NodeId(4), 2);
        cache.apply(&EventKind::CategoryRemoved { node: NodeId(4) });
        assert_eq!(cache.get(NodeId(4)), 0);

        cache.seed_for_test(NodeId(1), 2);
        cache.forget(NodeId(1));
        assert_eq!(cache.total(), 0);
    }
}
