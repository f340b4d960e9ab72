//! Cache event system.
//!
//! Defines mutation events and the in-memory queue that backs
//! fire-and-forget delivery.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::gauge;
use time::{Date, OffsetDateTime};
use tracing::debug;
use uuid::Uuid;

use crate::domain::{FileStats, NodeId};
use crate::util::lock::mutex_lock;

const SOURCE: &str = "cache::events";
const METRIC_EVENT_QUEUE_LEN: &str = "canopy_event_queue_len";

/// Monotonic epoch for ordering events within this process.
pub type Epoch = u64;

/// A committed mutation, published after the store write succeeded.
#[derive(Debug, Clone)]
pub struct CacheEvent {
    /// Unique identifier, used in logs to correlate handler failures.
    pub id: Uuid,
    /// Monotonic epoch for ordering within this process.
    pub epoch: Epoch,
    pub kind: EventKind,
    /// Ancestor chains resolved against the tree at publish time.
    pub chains: AncestorChains,
    /// When the event was created.
    pub timestamp: OffsetDateTime,
}

impl CacheEvent {
    pub fn new(kind: EventKind, epoch: Epoch) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            kind,
            chains: AncestorChains::default(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn with_chains(mut self, chains: AncestorChains) -> Self {
        self.chains = chains;
        self
    }

    pub fn event_type(&self) -> EventType {
        self.kind.event_type()
    }
}

/// Mutations that affect cached aggregates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// A post was filed under `node`, published on `day`.
    PostCreated { node: NodeId, day: Date },
    /// A post published on `day` was removed from `node`.
    PostDeleted { node: NodeId, day: Date },
    /// A post published on `day` moved between categories.
    PostMoved { from: NodeId, to: NodeId, day: Date },
    /// A category changed parent, carrying its recursive attachment totals.
    CategoryUpdated {
        node: NodeId,
        old_parent: Option<NodeId>,
        new_parent: Option<NodeId>,
        delta: FileStats,
    },
    /// A category was deleted; its per-node entries can be dropped.
    CategoryRemoved { node: NodeId },
    /// An attachment of `size` bytes was stored under `node`.
    FileUploaded { node: NodeId, size: u64 },
    /// An attachment of `size` bytes was removed from `node`.
    FileDeleted { node: NodeId, size: u64 },
}

impl EventKind {
    pub fn event_type(&self) -> EventType {
        match self {
            EventKind::PostCreated { .. } => EventType::PostCreated,
            EventKind::PostDeleted { .. } => EventType::PostDeleted,
            EventKind::PostMoved { .. } => EventType::PostMoved,
            EventKind::CategoryUpdated { .. } => EventType::CategoryUpdated,
            EventKind::CategoryRemoved { .. } => EventType::CategoryRemoved,
            EventKind::FileUploaded { .. } => EventType::FileUploaded,
            EventKind::FileDeleted { .. } => EventType::FileDeleted,
        }
    }

    /// The node the event is primarily about.
    pub fn primary_node(&self) -> NodeId {
        match self {
            EventKind::PostCreated { node, .. }
            | EventKind::PostDeleted { node, .. }
            | EventKind::CategoryUpdated { node, .. }
            | EventKind::CategoryRemoved { node }
            | EventKind::FileUploaded { node, .. }
            | EventKind::FileDeleted { node, .. } => *node,
            EventKind::PostMoved { from, .. } => *from,
        }
    }

    /// The second node involved in a move: the destination post category,
    /// or the new parent of a moved category.
    pub fn secondary_node(&self) -> Option<NodeId> {
        match self {
            EventKind::PostMoved { to, .. } => Some(*to),
            EventKind::CategoryUpdated { new_parent, .. } => *new_parent,
            _ => None,
        }
    }
}

/// Node-to-root chains an event touches, each starting at the node itself.
///
/// Handlers walk these instead of querying the live tree, so an event that
/// waits in the async queue while a category moves still lands on the
/// ancestors it had when the mutation was committed.
///
/// | event             | `primary`          | `secondary`        |
/// |-------------------|--------------------|--------------------|
/// | post created/deleted, file events, category removed | chain of `node` | empty |
/// | post moved        | chain of `from`    | chain of `to`      |
/// | category updated  | chain of old parent| chain of new parent|
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AncestorChains {
    pub primary: Vec<NodeId>,
    pub secondary: Vec<NodeId>,
}

impl AncestorChains {
    pub fn new(primary: Vec<NodeId>, secondary: Vec<NodeId>) -> Self {
        Self { primary, secondary }
    }

    pub fn single(primary: Vec<NodeId>) -> Self {
        Self {
            primary,
            secondary: Vec::new(),
        }
    }

    /// Both chains merged without duplicates, primary first.
    pub fn union(&self) -> Vec<NodeId> {
        let mut out = self.primary.clone();
        for id in &self.secondary {
            if !out.contains(id) {
                out.push(*id);
            }
        }
        out
    }
}

/// Payload-free discriminant of [`EventKind`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventType {
    PostCreated,
    PostDeleted,
    PostMoved,
    CategoryUpdated,
    CategoryRemoved,
    FileUploaded,
    FileDeleted,
}

impl EventType {
    pub const ALL: [EventType; 7] = [
        EventType::PostCreated,
        EventType::PostDeleted,
        EventType::PostMoved,
        EventType::CategoryUpdated,
        EventType::CategoryRemoved,
        EventType::FileUploaded,
        EventType::FileDeleted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::PostCreated => "post_created",
            EventType::PostDeleted => "post_deleted",
            EventType::PostMoved => "post_moved",
            EventType::CategoryUpdated => "category_updated",
            EventType::CategoryRemoved => "category_removed",
            EventType::FileUploaded => "file_uploaded",
            EventType::FileDeleted => "file_deleted",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of epochs shared by every dispatcher in a coordinator.
#[derive(Debug, Default)]
pub struct EpochCounter(AtomicU64);

impl EpochCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> Epoch {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    /// The epoch the next published event will get.
    pub fn current(&self) -> Epoch {
        self.0.load(Ordering::SeqCst)
    }
}

/// FIFO queue of events awaiting asynchronous delivery.
///
/// The queue uses a mutex for simplicity since contention is expected to be low.
#[derive(Default)]
pub struct EventQueue {
    queue: Mutex<VecDeque<CacheEvent>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: CacheEvent) {
        debug!(
            event_id = %event.id,
            event_epoch = event.epoch,
            event_kind = ?event.kind,
            "Cache event enqueued"
        );

        let mut queue = mutex_lock(&self.queue, SOURCE, "push");
        queue.push_back(event);
        gauge!(METRIC_EVENT_QUEUE_LEN).set(queue.len() as f64);
    }

    /// Drain up to `limit` events in FIFO order.
    pub fn drain(&self, limit: usize) -> Vec<CacheEvent> {
        let mut queue = mutex_lock(&self.queue, SOURCE, "drain");
        let count = limit.min(queue.len());
        let events: Vec<_> = queue.drain(..count).collect();
        gauge!(METRIC_EVENT_QUEUE_LEN).set(queue.len() as f64);
        events
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.queue, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use time::macros::date;

    use super::*;

    fn created(node: i64) -> EventKind {
        EventKind::PostCreated {
            node: NodeId(node),
            day: date!(2024 - 03 - 01),
        }
    }

    #[test]
    fn event_creation() {
        let event = CacheEvent::new(created(1), 42);

        assert_eq!(event.epoch, 42);
        assert_eq!(event.event_type(), EventType::PostCreated);
        assert!(!event.id.is_nil());
    }

    #[test]
    fn epoch_monotonicity() {
        let counter = EpochCounter::new();

        let e1 = counter.next();
        let e2 = counter.next();
        let e3 = counter.next();

        assert!(e1 < e2);
        assert!(e2 < e3);
        assert_eq!(counter.current(), e3 + 1);
    }

    #[test]
    fn push_and_drain_is_fifo() {
        let queue = EventQueue::new();
        for node in 1..=3 {
            queue.push(CacheEvent::new(created(node), node as u64));
        }
        assert_eq!(queue.len(), 3);

        let events = queue.drain(2);
        assert_eq!(events.len(), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(events[0].kind.primary_node(), NodeId(1));
        assert_eq!(events[1].kind.primary_node(), NodeId(2));

        let rest = queue.drain(100);
        assert_eq!(rest.len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn move_events_expose_both_nodes() {
        let kind = EventKind::PostMoved {
            from: NodeId(1),
            to: NodeId(2),
            day: date!(2024 - 03 - 01),
        };
        assert_eq!(kind.primary_node(), NodeId(1));
        assert_eq!(kind.secondary_node(), Some(NodeId(2)));

        let kind = EventKind::CategoryUpdated {
            node: NodeId(5),
            old_parent: Some(NodeId(2)),
            new_parent: None,
            delta: FileStats::ZERO,
        };
        assert_eq!(kind.secondary_node(), None);
        assert_eq!(kind.event_type(), EventType::CategoryUpdated);
    }

    #[test]
    fn chain_union_keeps_shared_ancestors_once() {
        let chains = AncestorChains::new(
            vec![NodeId(3), NodeId(2), NodeId(1)],
            vec![NodeId(4), NodeId(1)],
        );
        assert_eq!(
            chains.union(),
            vec![NodeId(3), NodeId(2), NodeId(1), NodeId(4)]
        );
    }

    #[test]
    fn event_queue_recovers_from_poisoned_lock() {
        let queue = EventQueue::new();

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = queue.queue.lock().expect("queue lock should be acquired");
            panic!("poison queue lock");
        }));

        queue.push(CacheEvent::new(created(1), 0));
        assert_eq!(queue.len(), 1);
    }
}
