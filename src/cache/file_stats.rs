//! Attachment counts and sizes per category.
//!
//! File stats are additive, so a category move is merged into the cache:
//! the moved subtree's totals are subtracted along the old ancestor chain
//! and added along the new one. Ancestors that are not cached are skipped
//! and will be loaded from the store on their next read.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, trace};

use super::dispatcher::{EventHandler, HandlerError};
use super::events::{CacheEvent, EventKind, EventType};
use crate::domain::{FileStats, NodeId};
use crate::util::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::file_stats";

/// Event types the file-stats cache reacts to.
pub const FILE_STATS_EVENTS: [EventType; 4] = [
    EventType::FileUploaded,
    EventType::FileDeleted,
    EventType::CategoryUpdated,
    EventType::CategoryRemoved,
];

/// Direction of a chain merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeSign {
    Add,
    Subtract,
}

impl MergeSign {
    fn apply(self, current: FileStats, delta: FileStats) -> FileStats {
        match self {
            MergeSign::Add => current.saturating_add(delta),
            MergeSign::Subtract => current.saturating_sub(delta),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStatsCacheStats {
    pub flat_entries: usize,
    pub recursive_entries: usize,
    pub generation: u64,
}

#[derive(Default)]
struct FileStatsState {
    entries: HashMap<(NodeId, bool), FileStats>,
    generation: u64,
}

impl FileStatsState {
    fn merge(&mut self, node: NodeId, recursive: bool, delta: FileStats, sign: MergeSign) -> bool {
        match self.entries.get_mut(&(node, recursive)) {
            Some(entry) => {
                *entry = sign.apply(*entry, delta);
                true
            }
            None => false,
        }
    }

    fn merge_chain(&mut self, chain: &[NodeId], delta: FileStats, sign: MergeSign) -> usize {
        chain
            .iter()
            .filter(|id| self.merge(**id, true, delta, sign))
            .count()
    }
}

#[derive(Default)]
pub struct FileStatsCache {
    state: RwLock<FileStatsState>,
}

impl FileStatsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cache with bulk-loaded flat and recursive entries.
    pub fn initialize(
        &self,
        flat: HashMap<NodeId, FileStats>,
        recursive: HashMap<NodeId, FileStats>,
    ) {
        let mut state = rw_write(&self.state, SOURCE, "initialize");
        state.generation += 1;
        state.entries = flat
            .into_iter()
            .map(|(id, stats)| ((id, false), stats))
            .chain(recursive.into_iter().map(|(id, stats)| ((id, true), stats)))
            .collect();
    }

    pub fn get(&self, node: NodeId, recursive: bool) -> Option<FileStats> {
        rw_read(&self.state, SOURCE, "get")
            .entries
            .get(&(node, recursive))
            .copied()
    }

    pub fn contains(&self, node: NodeId, recursive: bool) -> bool {
        rw_read(&self.state, SOURCE, "contains")
            .entries
            .contains_key(&(node, recursive))
    }

    pub fn generation(&self) -> u64 {
        rw_read(&self.state, SOURCE, "generation").generation
    }

    /// Store a freshly loaded entry unless the cache changed since
    /// `generation` was read.
    pub fn insert(&self, node: NodeId, recursive: bool, stats: FileStats, generation: u64) -> bool {
        let mut state = rw_write(&self.state, SOURCE, "insert");
        if state.generation != generation {
            debug!(
                node = %node,
                recursive,
                expected = generation,
                current = state.generation,
                "Discarding file stats loaded across a cache mutation"
            );
            return false;
        }
        state.entries.insert((node, recursive), stats);
        true
    }

    /// Add or subtract `delta` on the cached recursive entry of every node in
    /// `chain`. Returns the number of entries changed.
    pub fn merge_chain(&self, chain: &[NodeId], delta: FileStats, sign: MergeSign) -> usize {
        let mut state = rw_write(&self.state, SOURCE, "merge_chain");
        state.generation += 1;
        state.merge_chain(chain, delta, sign)
    }

    pub fn remove_node(&self, node: NodeId) {
        let mut state = rw_write(&self.state, SOURCE, "remove_node");
        state.generation += 1;
        state.entries.remove(&(node, false));
        state.entries.remove(&(node, true));
    }

    /// Apply one event using the ancestor chains it carries.
    pub fn apply(&self, event: &CacheEvent) {
        let chains = &event.chains;
        let mut state = rw_write(&self.state, SOURCE, "apply");
        state.generation += 1;

        match &event.kind {
            EventKind::FileUploaded { node, size } | EventKind::FileDeleted { node, size } => {
                let sign = if matches!(event.kind, EventKind::FileUploaded { .. }) {
                    MergeSign::Add
                } else {
                    MergeSign::Subtract
                };
                let delta = FileStats::single(*size);
                state.merge(*node, false, delta, sign);
                let chain = if chains.primary.is_empty() {
                    vec![*node]
                } else {
                    chains.primary.clone()
                };
                let merged = state.merge_chain(&chain, delta, sign);
                trace!(node = %node, size, ?sign, merged, "File stats patched");
            }
            EventKind::CategoryUpdated {
                node,
                old_parent,
                new_parent,
                delta,
            } => {
                if old_parent == new_parent || delta.is_zero() {
                    return;
                }
                let subtracted = state.merge_chain(&chains.primary, *delta, MergeSign::Subtract);
                let added = state.merge_chain(&chains.secondary, *delta, MergeSign::Add);
                debug!(
                    node = %node,
                    files = delta.file_count,
                    bytes = delta.total_size,
                    subtracted,
                    added,
                    "File stats merged across category move"
                );
            }
            EventKind::CategoryRemoved { node } => {
                state.entries.remove(&(*node, false));
                state.entries.remove(&(*node, true));
            }
            EventKind::PostCreated { .. }
            | EventKind::PostDeleted { .. }
            | EventKind::PostMoved { .. } => {}
        }
    }

    pub fn stats(&self) -> FileStatsCacheStats {
        let state = rw_read(&self.state, SOURCE, "stats");
        let recursive_entries = state.entries.keys().filter(|(_, r)| *r).count();
        FileStatsCacheStats {
            flat_entries: state.entries.len() - recursive_entries,
            recursive_entries,
            generation: state.generation,
        }
    }

    pub fn seed_for_test(&self, node: NodeId, recursive: bool, stats: FileStats) {
        rw_write(&self.state, SOURCE, "seed_for_test")
            .entries
            .insert((node, recursive), stats);
    }
}

/// Keeps a [`FileStatsCache`] in step with upload and category events.
pub struct FileStatsHandler {
    cache: Arc<FileStatsCache>,
}

impl FileStatsHandler {
    pub fn new(cache: Arc<FileStatsCache>) -> Self {
        Self { cache }
    }
}

impl EventHandler for FileStatsHandler {
    fn name(&self) -> &'static str {
        "file_stats"
    }

    fn handle(&self, event: &CacheEvent) -> Result<(), HandlerError> {
        self.cache.apply(event);
        Ok(())
    }
}
