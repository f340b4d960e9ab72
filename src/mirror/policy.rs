//! Applies server mutation outcomes to the client mirror.
//!
//! Category moves follow the same rules as the server caches: file stats are
//! merged along both ancestor chains, recursive activity windows along both
//! chains are dropped, and flat windows are kept. Unlike the server, the
//! mirror also drops the `all` window, since it cannot tell whether a moved
//! subtree was already counted there.

use std::collections::HashMap;

use time::Date;
use tracing::debug;

use crate::application::outcomes::{CategoryMoveOutcome, PostCountOutcome, PostMutationOutcome};
use crate::cache::{ActivityKey, ActivityWindow, MergeSign};
use crate::config::MirrorSettings;
use crate::domain::{ActivityScope, FileStats, Node, NodeId};

use super::cache::{Clock, InvalidatePattern, MirrorCache, SystemClock};
use super::keys::MirrorKeys;

/// What a single policy application touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MirrorReport {
    pub merged: usize,
    pub invalidated: usize,
    pub stored: usize,
}

/// The client's typed mirrors plus its view of the category tree.
pub struct ClientMirror<C: Clock + Clone = SystemClock> {
    parents: HashMap<NodeId, Option<NodeId>>,
    file_stats: MirrorCache<FileStats, C>,
    activity: MirrorCache<ActivityWindow, C>,
    post_counts: MirrorCache<u64, C>,
}

impl ClientMirror<SystemClock> {
    pub fn new(settings: &MirrorSettings) -> Self {
        Self::with_clock(settings, SystemClock::new())
    }
}

impl<C: Clock + Clone> ClientMirror<C> {
    pub fn with_clock(settings: &MirrorSettings, clock: C) -> Self {
        Self {
            parents: HashMap::new(),
            file_stats: MirrorCache::with_clock(
                "file_stats",
                settings.ttl,
                settings.max_entries,
                clock.clone(),
            ),
            activity: MirrorCache::with_clock(
                "activity",
                settings.ttl,
                settings.max_entries,
                clock.clone(),
            ),
            post_counts: MirrorCache::with_clock(
                "post_counts",
                settings.ttl,
                settings.max_entries,
                clock,
            ),
        }
    }

    /// Replace the local tree with a server snapshot.
    pub fn load_tree(&mut self, nodes: &[Node]) {
        self.parents = nodes.iter().map(|node| (node.id, node.parent_id)).collect();
    }

    pub fn set_parent(&mut self, node: NodeId, parent: Option<NodeId>) {
        self.parents.insert(node, parent);
    }

    pub fn parent_of(&self, node: NodeId) -> Option<NodeId> {
        self.parents.get(&node).copied().flatten()
    }

    /// `node` and its ancestors, per the local tree.
    pub fn chain(&self, node: NodeId) -> Vec<NodeId> {
        let mut chain = vec![node];
        let mut current = self.parent_of(node);
        while let Some(id) = current {
            if chain.contains(&id) || chain.len() > self.parents.len() {
                break;
            }
            chain.push(id);
            current = self.parent_of(id);
        }
        chain
    }

    fn chain_from(&self, node: Option<NodeId>) -> Vec<NodeId> {
        node.map(|id| self.chain(id)).unwrap_or_default()
    }

    pub fn file_stats(&mut self) -> &mut MirrorCache<FileStats, C> {
        &mut self.file_stats
    }

    pub fn activity(&mut self) -> &mut MirrorCache<ActivityWindow, C> {
        &mut self.activity
    }

    pub fn post_counts(&mut self) -> &mut MirrorCache<u64, C> {
        &mut self.post_counts
    }

    pub fn get_file_stats(&mut self, node: NodeId, recursive: bool) -> Option<FileStats> {
        self.file_stats.get(&MirrorKeys::file_stats(node, recursive))
    }

    pub fn set_file_stats(&mut self, node: NodeId, recursive: bool, stats: FileStats) {
        self.file_stats
            .set(MirrorKeys::file_stats(node, recursive), stats);
    }

    pub fn get_activity(&mut self, key: &ActivityKey) -> Option<ActivityWindow> {
        self.activity.get(&MirrorKeys::activity(key))
    }

    pub fn set_activity(&mut self, key: &ActivityKey, window: ActivityWindow) {
        self.activity.set(MirrorKeys::activity(key), window);
    }

    pub fn get_post_count(&mut self, node: NodeId, recursive: bool) -> Option<u64> {
        self.post_counts.get(&MirrorKeys::post_count(node, recursive))
    }

    /// Apply a category move reported by the server.
    pub fn apply_category_move(&mut self, outcome: &CategoryMoveOutcome) -> MirrorReport {
        let mut report = MirrorReport::default();
        if outcome.old_parent == outcome.new_parent {
            return report;
        }

        let from = self.chain_from(outcome.old_parent);
        let to = self.chain_from(outcome.new_parent);

        report.merged += self.merge_file_stats(&from, outcome.delta, MergeSign::Subtract);
        report.merged += self.merge_file_stats(&to, outcome.delta, MergeSign::Add);

        for node in from.iter().chain(to.iter()) {
            report.invalidated += self
                .activity
                .invalidate(MirrorKeys::activity_pattern(ActivityScope::Node(*node), true));
        }
        report.invalidated += self
            .activity
            .invalidate(MirrorKeys::activity_pattern(ActivityScope::All, true));

        self.parents.insert(outcome.node, outcome.new_parent);

        // Chain members the server did not report may now hold stale totals.
        for node in from.iter().chain(to.iter()) {
            if !outcome.post_counts.iter().any(|count| count.node == *node) {
                report.invalidated += self
                    .post_counts
                    .invalidate(MirrorKeys::post_count(*node, true));
            }
        }
        report.stored += self.apply_post_counts(&outcome.post_counts);

        debug!(
            node = %outcome.node,
            merged = report.merged,
            invalidated = report.invalidated,
            "Mirror applied category move"
        );
        report
    }

    /// Renames and description edits leave every aggregate valid.
    pub fn apply_metadata_edit(&mut self, node: NodeId) -> MirrorReport {
        debug!(node = %node, "Mirror ignored metadata edit");
        MirrorReport::default()
    }

    /// Store authoritative counts sent by the server; returns the number of entries written.
    pub fn apply_post_counts(&mut self, counts: &[PostCountOutcome]) -> usize {
        for count in counts {
            self.post_counts
                .set(MirrorKeys::post_count(count.node, false), count.direct);
            self.post_counts
                .set(MirrorKeys::post_count(count.node, true), count.recursive);
        }
        counts.len() * 2
    }

    /// Drop activity windows covering the post's day on every affected
    /// category, then store the counts the server returned.
    pub fn apply_post_mutation(&mut self, outcome: &PostMutationOutcome) -> MirrorReport {
        let affected = outcome.affected.clone();
        let day = outcome.day;
        let invalidated = self.activity.invalidate(InvalidatePattern::predicate(move |key| {
            covers(key, day, &affected)
        }));
        let stored = self.apply_post_counts(&outcome.post_counts);

        debug!(
            day = %outcome.day,
            affected = outcome.affected.len(),
            invalidated,
            "Mirror applied post mutation"
        );
        MirrorReport {
            merged: 0,
            invalidated,
            stored,
        }
    }

    pub fn clear(&mut self) {
        self.file_stats.clear();
        self.activity.clear();
        self.post_counts.clear();
    }

    fn merge_file_stats(&mut self, chain: &[NodeId], delta: FileStats, sign: MergeSign) -> usize {
        chain
            .iter()
            .filter(|node| {
                self.file_stats
                    .update(&MirrorKeys::file_stats(**node, true), |stats| {
                        *stats = match sign {
                            MergeSign::Add => stats.saturating_add(delta),
                            MergeSign::Subtract => stats.saturating_sub(delta),
                        };
                    })
            })
            .count()
    }
}

fn covers(key: &str, day: Date, affected: &[NodeId]) -> bool {
    let Some(parsed) = MirrorKeys::parse_activity(key) else {
        return false;
    };
    if !parsed.window.contains(day) {
        return false;
    }
    match parsed.scope {
        ActivityScope::All => true,
        ActivityScope::Node(node) => affected.contains(&node),
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;
    use std::time::Duration;

    use time::macros::date;

    use super::*;
    use crate::cache::ActivityWindowSpec;
    use crate::mirror::cache::ManualClock;

    fn settings() -> MirrorSettings {
        MirrorSettings {
            ttl: Duration::from_secs(300),
            max_entries: NonZeroUsize::new(64).expect("non-zero"),
        }
    }

    fn node(id: i64, parent: Option<i64>) -> Node {
        Node {
            id: NodeId::new(id),
            parent_id: parent.map(NodeId::new),
            depth: u8::from(parent.is_some()),
        }
    }

    fn mirror() -> ClientMirror<ManualClock> {
        let mut mirror = ClientMirror::with_clock(&settings(), ManualClock::new());
        mirror.load_tree(&[node(1, None), node(2, None), node(3, Some(1))]);
        mirror
    }

    fn window() -> ActivityWindowSpec {
        ActivityWindowSpec::new(date!(2024 - 01 - 01), 12)
    }

    #[test]
    fn category_move_merges_file_stats_and_drops_recursive_windows() {
        let mut mirror = mirror();
        let one = NodeId::new(1);
        let two = NodeId::new(2);
        let three = NodeId::new(3);

        mirror.set_file_stats(one, true, FileStats::new(3, 150));
        mirror.set_file_stats(two, true, FileStats::new(1, 10));
        mirror.set_file_stats(one, false, FileStats::new(1, 50));
        for key in [
            ActivityKey::recursive(one, window()),
            ActivityKey::flat(one, window()),
            ActivityKey::recursive(two, window()),
            ActivityKey::all(window()),
        ] {
            mirror.set_activity(&key, ActivityWindow::empty(key.window));
        }

        let report = mirror.apply_category_move(&CategoryMoveOutcome {
            node: three,
            old_parent: Some(one),
            new_parent: Some(two),
            delta: FileStats::new(2, 100),
            post_counts: Vec::new(),
        });

        assert_eq!(report.merged, 2);
        assert_eq!(mirror.get_file_stats(one, true), Some(FileStats::new(1, 50)));
        assert_eq!(mirror.get_file_stats(two, true), Some(FileStats::new(3, 110)));
        assert_eq!(mirror.get_file_stats(one, false), Some(FileStats::new(1, 50)));

        assert!(mirror.get_activity(&ActivityKey::flat(one, window())).is_some());
        assert!(mirror.get_activity(&ActivityKey::recursive(one, window())).is_none());
        assert!(mirror.get_activity(&ActivityKey::recursive(two, window())).is_none());
        assert!(mirror.get_activity(&ActivityKey::all(window())).is_none());
        assert_eq!(mirror.chain(three), vec![three, two]);
    }

    #[test]
    fn category_move_floors_and_skips_uncached_entries() {
        let mut mirror = mirror();
        let one = NodeId::new(1);
        mirror.set_file_stats(one, true, FileStats::new(1, 500));

        let report = mirror.apply_category_move(&CategoryMoveOutcome {
            node: NodeId::new(3),
            old_parent: Some(one),
            new_parent: Some(NodeId::new(2)),
            delta: FileStats::new(4, 100),
            post_counts: Vec::new(),
        });

        assert_eq!(report.merged, 1);
        assert_eq!(mirror.get_file_stats(one, true), Some(FileStats::new(0, 400)));
        assert_eq!(mirror.get_file_stats(NodeId::new(2), true), None);
    }

    #[test]
    fn move_stores_reported_counts_and_drops_unreported_ones() {
        let mut mirror = mirror();
        let one = NodeId::new(1);
        let two = NodeId::new(2);
        mirror.apply_post_counts(&[
            PostCountOutcome {
                node: one,
                direct: 1,
                recursive: 5,
            },
            PostCountOutcome {
                node: two,
                direct: 0,
                recursive: 0,
            },
        ]);

        mirror.apply_category_move(&CategoryMoveOutcome {
            node: NodeId::new(3),
            old_parent: Some(one),
            new_parent: Some(two),
            delta: FileStats::ZERO,
            post_counts: vec![PostCountOutcome {
                node: two,
                direct: 0,
                recursive: 4,
            }],
        });

        assert_eq!(mirror.get_post_count(one, true), None);
        assert_eq!(mirror.get_post_count(one, false), Some(1));
        assert_eq!(mirror.get_post_count(two, true), Some(4));
    }

    #[test]
    fn metadata_edit_invalidates_nothing() {
        let mut mirror = mirror();
        let key = ActivityKey::recursive(NodeId::new(1), window());
        mirror.set_activity(&key, ActivityWindow::empty(key.window));
        mirror.set_file_stats(NodeId::new(1), true, FileStats::new(1, 1));

        assert_eq!(
            mirror.apply_metadata_edit(NodeId::new(1)),
            MirrorReport::default()
        );
        assert!(mirror.get_activity(&key).is_some());
        assert!(mirror.get_file_stats(NodeId::new(1), true).is_some());
    }

    #[test]
    fn post_mutation_drops_only_windows_covering_the_day() {
        let mut mirror = mirror();
        let one = NodeId::new(1);
        let three = NodeId::new(3);
        let earlier = ActivityWindowSpec::new(date!(2022 - 01 - 01), 12);
        let keys = [
            ActivityKey::flat(three, window()),
            ActivityKey::recursive(one, window()),
            ActivityKey::recursive(one, earlier),
            ActivityKey::recursive(NodeId::new(2), window()),
            ActivityKey::all(window()),
        ];
        for key in &keys {
            mirror.set_activity(key, ActivityWindow::empty(key.window));
        }

        let report = mirror.apply_post_mutation(&PostMutationOutcome {
            affected: vec![three, one],
            day: date!(2024 - 05 - 17),
            post_counts: vec![PostCountOutcome {
                node: three,
                direct: 2,
                recursive: 2,
            }],
        });

        assert_eq!(report.invalidated, 3);
        assert_eq!(report.stored, 2);
        assert!(mirror.get_activity(&keys[0]).is_none());
        assert!(mirror.get_activity(&keys[1]).is_none());
        assert!(mirror.get_activity(&keys[2]).is_some());
        assert!(mirror.get_activity(&keys[3]).is_some());
        assert!(mirror.get_activity(&keys[4]).is_none());
        assert_eq!(mirror.get_post_count(three, false), Some(2));
    }
}
