//! Cache coordinator.
//!
//! The only legal entry point for cache mutation. Services open a
//! [`MutationGuard`] before writing to the store and call the `on_*` methods
//! after committing; the coordinator resolves ancestor
//! chains, publishes the event on the required lane (post counts, always
//! synchronous) and the derived lane (activity and file stats), and serves
//! reads with store fallbacks for optional caches that failed to start.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use metrics::{counter, histogram};
use thiserror::Error;
use time::{Date, OffsetDateTime};
use tokio::sync::{RwLock as AsyncRwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, instrument, warn};

use super::activity::{
    ACTIVITY_EVENTS, ActivityCache, ActivityCacheStats, ActivityHandler, ActivityKey,
    ActivityWindow, ActivityWindowSpec,
};
use super::config::CacheConfig;
use super::dispatcher::{DispatchReport, EventDispatcher};
use super::events::{AncestorChains, CacheEvent, Epoch, EpochCounter, EventKind};
use super::file_stats::{FILE_STATS_EVENTS, FileStatsCache, FileStatsCacheStats, FileStatsHandler};
use super::post_counts::{POST_COUNT_EVENTS, PostCountCache, PostCountHandler, PostCountStats};
use crate::application::repos::{CacheSource, RepoError};
use crate::domain::{ActivityScope, FileStats, HierarchyError, HierarchyStore, Node, NodeId};
use crate::util::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::coordinator";
const METRIC_INIT_MS: &str = "canopy_cache_init_ms";
const METRIC_FALLBACK: &str = "canopy_cache_fallback_total";

const LANE_REQUIRED: &str = "required";
const LANE_DERIVED: &str = "derived";

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("mandatory cache `{cache}` failed to initialize: {message}")]
    MandatoryInit { cache: &'static str, message: String },
    #[error(transparent)]
    Hierarchy(#[from] HierarchyError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error("cache coordinator has been stopped")]
    Stopped,
}

impl CoordinatorError {
    fn mandatory(cache: &'static str, err: impl std::fmt::Display) -> Self {
        Self::MandatoryInit {
            cache,
            message: err.to_string(),
        }
    }
}

/// Lifecycle state of one cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureState {
    /// Turned off in configuration; reads go to the store.
    Disabled,
    /// Enabled but not initialized yet.
    Pending,
    Ready,
    /// Initialization failed; reads go to the store.
    Unavailable,
}

impl FeatureState {
    pub fn is_ready(self) -> bool {
        self == FeatureState::Ready
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FeatureState::Disabled => "disabled",
            FeatureState::Pending => "pending",
            FeatureState::Ready => "ready",
            FeatureState::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheAvailability {
    pub post_counts: FeatureState,
    pub activity: FeatureState,
    pub file_stats: FeatureState,
}

/// Cached versus stored direct post count for one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostCountAudit {
    pub node: NodeId,
    pub cached: u64,
    pub stored: u64,
}

impl PostCountAudit {
    pub fn is_consistent(&self) -> bool {
        self.cached == self.stored
    }

    /// `cached - stored`; positive when the cache over-counts.
    pub fn drift(&self) -> i128 {
        i128::from(self.cached) - i128::from(self.stored)
    }
}

/// Diagnostic snapshot across every cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub nodes: usize,
    pub availability: CacheAvailability,
    pub post_counts: PostCountStats,
    pub activity: ActivityCacheStats,
    pub file_stats: FileStatsCacheStats,
    pub pending_events: usize,
}

/// An open store mutation whose cache event has not been published yet.
///
/// While any guard is alive, lazy loads are served from the store but not
/// cached: the store may already hold a commit whose event would patch the
/// loaded value a second time. Structural guards (category moves and
/// deletes) are exclusive; every other mutation is shared.
pub struct MutationGuard<'a> {
    in_flight: &'a AtomicUsize,
    _shared: Option<RwLockReadGuard<'a, ()>>,
    exclusive: Option<RwLockWriteGuard<'a, ()>>,
}

impl MutationGuard<'_> {
    pub fn is_structural(&self) -> bool {
        self.exclusive.is_some()
    }
}

impl Drop for MutationGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct CacheCoordinator {
    config: CacheConfig,
    source: Arc<dyn CacheSource>,
    hierarchy: Arc<HierarchyStore>,
    post_counts: Arc<PostCountCache>,
    activity: Arc<ActivityCache>,
    file_stats: Arc<FileStatsCache>,
    required: EventDispatcher,
    derived: EventDispatcher,
    epochs: EpochCounter,
    mutations: AsyncRwLock<()>,
    in_flight: AtomicUsize,
    // Held for writing while the epoch moves, for reading around lazy inserts.
    insert_gate: RwLock<()>,
    availability: RwLock<CacheAvailability>,
    stopped: AtomicBool,
}

impl CacheCoordinator {
    pub fn new(config: CacheConfig, source: Arc<dyn CacheSource>) -> Self {
        let hierarchy = Arc::new(HierarchyStore::new());
        let post_counts = Arc::new(PostCountCache::new(Arc::clone(&hierarchy)));
        let activity = Arc::new(ActivityCache::new());
        let file_stats = Arc::new(FileStatsCache::new());

        let batch_limit = config.dispatch_batch_limit_non_zero();
        let required = EventDispatcher::new(LANE_REQUIRED, batch_limit);
        let derived = EventDispatcher::new(LANE_DERIVED, batch_limit);

        required.subscribe_all(
            &POST_COUNT_EVENTS,
            Arc::new(PostCountHandler::new(Arc::clone(&post_counts))),
        );
        if config.enable_activity {
            derived.subscribe_all(
                &ACTIVITY_EVENTS,
                Arc::new(ActivityHandler::new(Arc::clone(&activity))),
            );
        }
        if config.enable_file_stats {
            derived.subscribe_all(
                &FILE_STATS_EVENTS,
                Arc::new(FileStatsHandler::new(Arc::clone(&file_stats))),
            );
        }

        let optional = |enabled: bool| {
            if enabled {
                FeatureState::Pending
            } else {
                FeatureState::Disabled
            }
        };
        let availability = CacheAvailability {
            post_counts: FeatureState::Pending,
            activity: optional(config.enable_activity),
            file_stats: optional(config.enable_file_stats),
        };

        Self {
            config,
            source,
            hierarchy,
            post_counts,
            activity,
            file_stats,
            required,
            derived,
            epochs: EpochCounter::new(),
            mutations: AsyncRwLock::new(()),
            in_flight: AtomicUsize::new(0),
            insert_gate: RwLock::new(()),
            availability: RwLock::new(availability),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn hierarchy(&self) -> &Arc<HierarchyStore> {
        &self.hierarchy
    }

    pub fn post_count_cache(&self) -> &Arc<PostCountCache> {
        &self.post_counts
    }

    pub fn activity_cache(&self) -> &Arc<ActivityCache> {
        &self.activity
    }

    pub fn file_stats_cache(&self) -> &Arc<FileStatsCache> {
        &self.file_stats
    }

    /// Dispatchers for inspecting subscription order.
    pub fn dispatchers(&self) -> (&EventDispatcher, &EventDispatcher) {
        (&self.required, &self.derived)
    }

    pub fn availability(&self) -> CacheAvailability {
        *rw_read(&self.availability, SOURCE, "availability")
    }

    fn set_state(&self, update: impl FnOnce(&mut CacheAvailability)) {
        update(&mut rw_write(&self.availability, SOURCE, "set_state"));
    }

    /// Load the hierarchy, then bulk-load each enabled cache.
    ///
    /// Hierarchy or post-count failures are fatal. Optional caches that fail
    /// are marked unavailable and served straight from the store.
    #[instrument(skip(self))]
    pub async fn initialize_all(&self) -> Result<CacheAvailability, CoordinatorError> {
        let started_at = Instant::now();
        let nodes = self
            .source
            .load_hierarchy()
            .await
            .map_err(|err| CoordinatorError::mandatory("hierarchy", err))?;
        let loaded = self
            .hierarchy
            .load(nodes)
            .map_err(|err| CoordinatorError::mandatory("hierarchy", err))?;
        record_init("hierarchy", started_at, loaded);

        let started_at = Instant::now();
        let counts = self
            .source
            .load_direct_post_counts()
            .await
            .map_err(|err| CoordinatorError::mandatory("post_counts", err))?;
        let loaded = counts.len();
        self.post_counts.initialize(counts);
        self.set_state(|state| state.post_counts = FeatureState::Ready);
        record_init("post_counts", started_at, loaded);

        if self.config.enable_activity {
            let started_at = Instant::now();
            let state = match self.warm_activity().await {
                Ok(windows) => {
                    record_init("activity", started_at, windows);
                    FeatureState::Ready
                }
                Err(err) => {
                    warn!(
                        cache = "activity",
                        error = %err,
                        "Optional cache failed to initialize; falling back to store queries"
                    );
                    FeatureState::Unavailable
                }
            };
            self.set_state(|availability| availability.activity = state);
        }

        if self.config.enable_file_stats {
            let started_at = Instant::now();
            let state = match self.warm_file_stats().await {
                Ok(entries) => {
                    record_init("file_stats", started_at, entries);
                    FeatureState::Ready
                }
                Err(err) => {
                    warn!(
                        cache = "file_stats",
                        error = %err,
                        "Optional cache failed to initialize; falling back to store queries"
                    );
                    FeatureState::Unavailable
                }
            };
            self.set_state(|availability| availability.file_stats = state);
        }

        Ok(self.availability())
    }

    async fn warm_activity(&self) -> Result<usize, RepoError> {
        let today = OffsetDateTime::now_utc().date();
        let window = ActivityWindowSpec::trailing(today, self.config.activity_window_months_clamped());

        self.activity.clear();
        let token = self.activity.generation();

        let mut loaded = Vec::new();
        let all = self
            .source
            .load_activity(ActivityScope::All, true, window.anchor, window.end())
            .await?;
        loaded.push((
            ActivityKey::all(window),
            ActivityWindow::from_counts(window, &all),
        ));

        for node in self.hierarchy.snapshot() {
            let counts = self
                .source
                .load_activity(ActivityScope::Node(node.id), false, window.anchor, window.end())
                .await?;
            loaded.push((
                ActivityKey::flat(node.id, window),
                ActivityWindow::from_counts(window, &counts),
            ));
        }

        let count = loaded.len();
        for (key, window) in loaded {
            self.activity.insert(key, window, token);
        }
        Ok(count)
    }

    async fn warm_file_stats(&self) -> Result<usize, RepoError> {
        let stored = self.source.load_flat_file_stats().await?;
        let nodes = self.hierarchy.snapshot();

        let flat: HashMap<NodeId, FileStats> = nodes
            .iter()
            .map(|node| (node.id, stored.get(&node.id).copied().unwrap_or_default()))
            .collect();
        let recursive: HashMap<NodeId, FileStats> = nodes
            .iter()
            .map(|node| {
                let total = self
                    .hierarchy
                    .subtree(node.id)
                    .iter()
                    .filter_map(|id| flat.get(id))
                    .fold(FileStats::ZERO, |acc, stats| acc.saturating_add(*stats));
                (node.id, total)
            })
            .collect();

        let entries = flat.len() + recursive.len();
        self.file_stats.initialize(flat, recursive);
        Ok(entries)
    }

    /// Spawn the derived-lane worker when derived events are asynchronous.
    pub fn start(&self) {
        if self.config.async_derived {
            self.derived.start();
        }
    }

    /// Reject new events, then drain and join both lanes.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.derived.stop().await;
        self.required.stop().await;
        info!("Cache coordinator stopped");
    }

    /// Deliver every queued derived event on the calling thread.
    pub fn flush(&self) -> usize {
        self.required.flush() + self.derived.flush()
    }

    pub fn pending_events(&self) -> usize {
        self.required.pending() + self.derived.pending()
    }

    pub fn get_post_count(&self, node: NodeId) -> u64 {
        self.post_counts.get(node)
    }

    pub fn get_post_count_recursive(&self, node: NodeId) -> u64 {
        self.post_counts.get_recursive(node)
    }

    pub fn get_total_post_count(&self) -> u64 {
        self.post_counts.total()
    }

    /// Open a post or attachment mutation. Hold the guard across the store
    /// write and the matching `on_*` call.
    pub async fn begin_mutation(&self) -> MutationGuard<'_> {
        let shared = self.mutations.read().await;
        self.open_mutation(Some(shared), None)
    }

    /// Open a mutation that changes the tree. Waits for every other open
    /// mutation and blocks new ones until the guard is dropped.
    pub async fn begin_structural_mutation(&self) -> MutationGuard<'_> {
        let exclusive = self.mutations.write().await;
        self.open_mutation(None, Some(exclusive))
    }

    fn open_mutation<'a>(
        &'a self,
        shared: Option<RwLockReadGuard<'a, ()>>,
        exclusive: Option<RwLockWriteGuard<'a, ()>>,
    ) -> MutationGuard<'a> {
        let _gate = rw_write(&self.insert_gate, SOURCE, "open_mutation");
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.epochs.next();
        MutationGuard {
            in_flight: &self.in_flight,
            _shared: shared,
            exclusive,
        }
    }

    pub fn mutations_in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Epoch to compare against before caching a lazy load, or `None` when a
    /// mutation is open and the load must not be cached.
    fn lazy_load_epoch(&self) -> Option<Epoch> {
        let _gate = rw_read(&self.insert_gate, SOURCE, "lazy_load_epoch");
        (self.in_flight.load(Ordering::SeqCst) == 0).then(|| self.epochs.current())
    }

    fn insert_if_quiet(&self, published: Option<Epoch>, insert: impl FnOnce() -> bool) {
        let Some(published) = published else {
            return;
        };
        let _gate = rw_read(&self.insert_gate, SOURCE, "insert_if_quiet");
        if self.epochs.current() == published {
            insert();
        }
    }

    /// Activity histogram for `scope`, loading and caching it on a miss.
    pub async fn get_activity(
        &self,
        scope: ActivityScope,
        recursive: bool,
        anchor: Date,
        months: u8,
    ) -> Result<ActivityWindow, CoordinatorError> {
        if let ActivityScope::Node(id) = scope {
            self.ensure_known(id)?;
        }
        let key = ActivityKey::new(scope, recursive, ActivityWindowSpec::new(anchor, months));

        if !self.availability().activity.is_ready() {
            counter!(METRIC_FALLBACK, "cache" => "activity").increment(1);
            return self.load_activity_window(key).await;
        }
        if let Some(window) = self.activity.get(&key) {
            return Ok(window);
        }

        let published = self.lazy_load_epoch();
        let token = self.activity.generation();
        // Queued events describe commits the store already reflects; apply
        // them before loading so they are not counted twice.
        self.derived.flush();

        let window = self.load_activity_window(key).await?;
        self.insert_if_quiet(published, || self.activity.insert(key, window.clone(), token));
        Ok(window)
    }

    async fn load_activity_window(&self, key: ActivityKey) -> Result<ActivityWindow, CoordinatorError> {
        let counts = self
            .source
            .load_activity(key.scope, key.recursive, key.window.anchor, key.window.end())
            .await?;
        Ok(ActivityWindow::from_counts(key.window, &counts))
    }

    /// File stats for `node`, loading and caching them on a miss.
    pub async fn get_file_stats(
        &self,
        node: NodeId,
        recursive: bool,
    ) -> Result<FileStats, CoordinatorError> {
        self.ensure_known(node)?;

        if !self.availability().file_stats.is_ready() {
            counter!(METRIC_FALLBACK, "cache" => "file_stats").increment(1);
            return Ok(self.source.load_file_stats(node, recursive).await?);
        }
        if let Some(stats) = self.file_stats.get(node, recursive) {
            return Ok(stats);
        }

        let published = self.lazy_load_epoch();
        let token = self.file_stats.generation();
        self.derived.flush();

        let stats = self.source.load_file_stats(node, recursive).await?;
        self.insert_if_quiet(published, || self.file_stats.insert(node, recursive, stats, token));
        Ok(stats)
    }

    fn ensure_known(&self, node: NodeId) -> Result<(), CoordinatorError> {
        if self.hierarchy.contains(node) {
            Ok(())
        } else {
            Err(HierarchyError::UnknownNode(node).into())
        }
    }

    #[instrument(skip(self))]
    pub fn on_post_created(&self, node: NodeId, day: Date) -> Result<DispatchReport, CoordinatorError> {
        self.publish(EventKind::PostCreated { node, day })
    }

    #[instrument(skip(self))]
    pub fn on_post_deleted(&self, node: NodeId, day: Date) -> Result<DispatchReport, CoordinatorError> {
        self.publish(EventKind::PostDeleted { node, day })
    }

    #[instrument(skip(self))]
    pub fn on_post_moved(
        &self,
        from: NodeId,
        to: NodeId,
        day: Date,
    ) -> Result<DispatchReport, CoordinatorError> {
        self.publish(EventKind::PostMoved { from, to, day })
    }

    /// Record a category reparenting that was committed to the store.
    ///
    /// The tree is updated here unless the caller already moved the node.
    /// `delta` is the moved subtree's recursive file stats.
    #[instrument(skip(self))]
    pub fn on_category_moved(
        &self,
        node: NodeId,
        old_parent: Option<NodeId>,
        new_parent: Option<NodeId>,
        delta: FileStats,
    ) -> Result<DispatchReport, CoordinatorError> {
        self.ensure_running()?;
        let current = self
            .hierarchy
            .get(node)
            .ok_or(HierarchyError::UnknownNode(node))?;
        if current.parent_id != new_parent {
            let previous = self.hierarchy.reparent(node, new_parent)?;
            if previous != old_parent {
                warn!(
                    node = %node,
                    expected = ?old_parent,
                    actual = ?previous,
                    "Category moved from an unexpected parent"
                );
            }
        }

        self.publish(EventKind::CategoryUpdated {
            node,
            old_parent,
            new_parent,
            delta,
        })
    }

    /// Register a category that was committed to the store. New categories
    /// have no posts or files, so no event is published.
    #[instrument(skip(self))]
    pub fn on_category_created(
        &self,
        node: NodeId,
        parent: Option<NodeId>,
    ) -> Result<Node, CoordinatorError> {
        self.ensure_running()?;
        let node = self.hierarchy.add(node, parent)?;
        debug!(node = %node.id, depth = node.depth, "Category registered");
        Ok(node)
    }

    /// Drop a deleted, childless category from the tree and every cache.
    #[instrument(skip(self))]
    pub fn on_category_removed(&self, node: NodeId) -> Result<DispatchReport, CoordinatorError> {
        self.ensure_running()?;
        let chains = AncestorChains::single(self.hierarchy.chain(node));
        self.hierarchy.remove(node)?;
        self.publish_with(EventKind::CategoryRemoved { node }, chains)
    }

    #[instrument(skip(self))]
    pub fn on_file_uploaded(&self, node: NodeId, size: u64) -> Result<DispatchReport, CoordinatorError> {
        self.publish(EventKind::FileUploaded { node, size })
    }

    #[instrument(skip(self))]
    pub fn on_file_deleted(&self, node: NodeId, size: u64) -> Result<DispatchReport, CoordinatorError> {
        self.publish(EventKind::FileDeleted { node, size })
    }

    fn ensure_running(&self) -> Result<(), CoordinatorError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(CoordinatorError::Stopped);
        }
        Ok(())
    }

    fn resolve_chains(&self, kind: &EventKind) -> AncestorChains {
        match kind {
            EventKind::PostCreated { node, .. }
            | EventKind::PostDeleted { node, .. }
            | EventKind::CategoryRemoved { node }
            | EventKind::FileUploaded { node, .. }
            | EventKind::FileDeleted { node, .. } => AncestorChains::single(self.hierarchy.chain(*node)),
            EventKind::PostMoved { from, to, .. } => {
                AncestorChains::new(self.hierarchy.chain(*from), self.hierarchy.chain(*to))
            }
            EventKind::CategoryUpdated {
                old_parent,
                new_parent,
                ..
            } => AncestorChains::new(
                self.hierarchy.chain_from(*old_parent),
                self.hierarchy.chain_from(*new_parent),
            ),
        }
    }

    fn publish(&self, kind: EventKind) -> Result<DispatchReport, CoordinatorError> {
        let chains = self.resolve_chains(&kind);
        self.publish_with(kind, chains)
    }

    fn publish_with(
        &self,
        kind: EventKind,
        chains: AncestorChains,
    ) -> Result<DispatchReport, CoordinatorError> {
        self.ensure_running()?;
        let _gate = rw_write(&self.insert_gate, SOURCE, "publish");
        let event = CacheEvent::new(kind, self.epochs.next()).with_chains(chains);
        info!(
            event_id = %event.id,
            event_epoch = event.epoch,
            event_kind = ?event.kind,
            "Cache event published"
        );

        let mut report = self.required.dispatch(&event);
        if self.config.async_derived {
            self.derived.dispatch_async(event);
        } else {
            let derived = self.derived.dispatch(&event);
            report.handled += derived.handled;
            report.failed.extend(derived.failed);
        }
        Ok(report)
    }

    /// Compare the cached direct count of `node` with the store.
    ///
    /// Drift is logged and reported, never repaired: a floored decrement can
    /// hide a lost event, and only the store knows the true value.
    pub async fn audit_post_count(&self, node: NodeId) -> Result<PostCountAudit, CoordinatorError> {
        let stored = self.source.count_posts_direct(node).await?;
        let audit = PostCountAudit {
            node,
            cached: self.post_counts.get(node),
            stored,
        };
        if !audit.is_consistent() {
            warn!(
                node = %node,
                cached = audit.cached,
                stored = audit.stored,
                drift = %audit.drift(),
                "Post count drift detected"
            );
        }
        Ok(audit)
    }

    /// Audit every category in the tree.
    pub async fn audit_all(&self) -> Result<Vec<PostCountAudit>, CoordinatorError> {
        let mut audits = Vec::with_capacity(self.hierarchy.len());
        for node in self.hierarchy.snapshot() {
            audits.push(self.audit_post_count(node.id).await?);
        }
        Ok(audits)
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            nodes: self.hierarchy.len(),
            availability: self.availability(),
            post_counts: self.post_counts.stats(),
            activity: self.activity.stats(),
            file_stats: self.file_stats.stats(),
            pending_events: self.pending_events(),
        }
    }
}

fn record_init(cache: &'static str, started_at: Instant, entries: usize) {
    let elapsed_ms = started_at.elapsed().as_secs_f64() * 1000.0;
    histogram!(METRIC_INIT_MS, "cache" => cache).record(elapsed_ms);
    info!(cache, entries, elapsed_ms, "Cache initialized");
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use time::macros::date;

    use super::*;
    use crate::application::repos::{DayCounts, HierarchyRepo, StatsRepo};

    /// Minimal store: root 1 → 2 → 3, and a separate root 4.
    #[derive(Default)]
    struct FakeStore {
        fail_activity: AtomicBool,
        fail_posts: AtomicBool,
        posts: HashMap<NodeId, u64>,
        files: HashMap<NodeId, FileStats>,
        days: Vec<(NodeId, Date)>,
    }

    #[async_trait]
    impl HierarchyRepo for FakeStore {
        async fn load_hierarchy(&self) -> Result<Vec<Node>, RepoError> {
            Ok(vec![
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
        }
    }

    #[async_trait]
    impl StatsRepo for FakeStore {
        async fn load_direct_post_counts(&self) -> Result<HashMap<NodeId, u64>, RepoError> {
            if self.fail_posts.load(Ordering::SeqCst) {
                return Err(RepoError::from_persistence("connection refused"));
            }
            Ok(self.posts.clone())
        }

        async fn count_posts_direct(&self, node: NodeId) -> Result<u64, RepoError> {
            Ok(self.posts.get(&node).copied().unwrap_or(0))
        }

        async fn load_file_stats(&self, node: NodeId, _recursive: bool) -> Result<FileStats, RepoError> {
            Ok(self.files.get(&node).copied().unwrap_or_default())
        }

        async fn load_flat_file_stats(&self) -> Result<HashMap<NodeId, FileStats>, RepoError> {
            Ok(self.files.clone())
        }

        async fn load_activity(
            &self,
            scope: ActivityScope,
            _recursive: bool,
            start: Date,
            end: Date,
        ) -> Result<DayCounts, RepoError> {
            if self.fail_activity.load(Ordering::SeqCst) {
                return Err(RepoError::from_persistence("activity query timed out"));
            }
            let mut out: DayCounts = Vec::new();
            for (node, day) in &self.days {
                if (scope == ActivityScope::All || scope == ActivityScope::Node(*node))
                    && *day >= start
                    && *day < end
                {
                    out.push((*day, 1));
                }
            }
            Ok(out)
        }
    }

    fn coordinator(store: FakeStore) -> CacheCoordinator {
        CacheCoordinator::new(CacheConfig::synchronous(), Arc::new(store))
    }

    #[tokio::test]
    async fn initialize_loads_tree_and_counts() {
        let store = FakeStore {
            posts: HashMap::from([(NodeId(3), 4), (NodeId(1), 1)]),
            ..Default::default()
        };
        let coordinator = coordinator(store);

        let availability = coordinator.initialize_all().await.expect("init succeeds");

        assert_eq!(availability.post_counts, FeatureState::Ready);
        assert_eq!(availability.activity, FeatureState::Ready);
        assert_eq!(availability.file_stats, FeatureState::Ready);
        assert_eq!(coordinator.hierarchy().len(), 4);
        assert_eq!(coordinator.get_post_count_recursive(NodeId(1)), 5);
        assert_eq!(coordinator.get_total_post_count(), 5);
    }

    #[tokio::test]
    async fn mandatory_failure_is_fatal() {
        let store = FakeStore::default();
        store.fail_posts.store(true, Ordering::SeqCst);
        let coordinator = coordinator(store);

        let err = coordinator.initialize_all().await.expect_err("must fail");
        assert!(matches!(
            err,
            CoordinatorError::MandatoryInit {
                cache: "post_counts",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn optional_failure_marks_feature_unavailable_and_falls_back() {
        let store = FakeStore {
            days: vec![(NodeId(2), date!(2024 - 01 - 03))],
            ..Default::default()
        };
        store.fail_activity.store(true, Ordering::SeqCst);
        let source = Arc::new(store);
        let coordinator = CacheCoordinator::new(CacheConfig::synchronous(), source.clone());

        let availability = coordinator.initialize_all().await.expect("init succeeds");
        assert_eq!(availability.activity, FeatureState::Unavailable);
        assert_eq!(availability.file_stats, FeatureState::Ready);

        source.fail_activity.store(false, Ordering::SeqCst);
        let window = coordinator
            .get_activity(ActivityScope::Node(NodeId(2)), false, date!(2024 - 01 - 01), 1)
            .await
            .expect("served from store");
        assert_eq!(window.stats.total, 1);
        assert_eq!(coordinator.activity_cache().stats().flat_windows, 0);
    }

    #[tokio::test]
    async fn activity_miss_is_loaded_then_cached() {
        let store = FakeStore {
            days: vec![(NodeId(3), date!(2023 - 06 - 10))],
            ..Default::default()
        };
        let coordinator = coordinator(store);
        coordinator.initialize_all().await.expect("init succeeds");

        let key = ActivityKey::flat(
            NodeId(3),
            ActivityWindowSpec::new(date!(2023 - 06 - 01), 2),
        );
        assert!(!coordinator.activity_cache().contains(&key));

        let window = coordinator
            .get_activity(ActivityScope::Node(NodeId(3)), false, date!(2023 - 06 - 20), 2)
            .await
            .expect("loads");
        assert_eq!(window.stats.active_days, 1);
        assert!(coordinator.activity_cache().contains(&key));
    }

    #[tokio::test]
    async fn category_move_updates_tree_and_merges_file_stats() {
        let store = FakeStore {
            files: HashMap::from([(NodeId(3), FileStats::new(2, 20))]),
            ..Default::default()
        };
        let coordinator = coordinator(store);
        coordinator.initialize_all().await.expect("init succeeds");
        assert_eq!(
            coordinator.get_file_stats(NodeId(1), true).await.expect("cached"),
            FileStats::new(2, 20)
        );

        coordinator
            .on_category_moved(NodeId(3), Some(NodeId(2)), Some(NodeId(4)), FileStats::new(2, 20))
            .expect("move publishes");

        assert_eq!(coordinator.hierarchy().chain(NodeId(3)), vec![NodeId(3), NodeId(4)]);
        let files = |id| coordinator.file_stats_cache().get(NodeId(id), true);
        assert_eq!(files(1), Some(FileStats::ZERO));
        assert_eq!(files(2), Some(FileStats::ZERO));
        assert_eq!(files(4), Some(FileStats::new(2, 20)));
    }

    #[tokio::test]
    async fn unknown_node_reads_are_rejected() {
        let coordinator = coordinator(FakeStore::default());
        coordinator.initialize_all().await.expect("init succeeds");

        let err = coordinator
            .get_file_stats(NodeId(99), false)
            .await
            .expect_err("unknown node");
        assert!(matches!(
            err,
            CoordinatorError::Hierarchy(HierarchyError::UnknownNode(NodeId(99)))
        ));
    }

    #[tokio::test]
    async fn audit_reports_drift_without_repairing() {
        let store = FakeStore {
            posts: HashMap::from([(NodeId(2), 3)]),
            ..Default::default()
        };
        let coordinator = coordinator(store);
        coordinator.initialize_all().await.expect("init succeeds");
        coordinator.post_count_cache().seed_for_test(NodeId(2), 1);

        let audit = coordinator.audit_post_count(NodeId(2)).await.expect("audits");

        assert!(!audit.is_consistent());
        assert_eq!(audit.drift(), -2);
        assert_eq!(coordinator.get_post_count(NodeId(2)), 1);
    }

    #[tokio::test]
    async fn async_derived_events_are_drained_on_stop() {
        let config = CacheConfig::default();
        let coordinator = CacheCoordinator::new(config, Arc::new(FakeStore::default()));
        coordinator.initialize_all().await.expect("init succeeds");
        coordinator.start();

        for _ in 0..10 {
            coordinator
                .on_file_uploaded(NodeId(3), 5)
                .expect("publishes");
        }
        coordinator.stop().await;

        assert_eq!(
            coordinator.file_stats_cache().get(NodeId(1), true),
            Some(FileStats::new(10, 50))
        );
        assert!(matches!(
            coordinator.on_post_created(NodeId(3), date!(2024 - 01 - 01)),
            Err(CoordinatorError::Stopped)
        ));
    }

    #[tokio::test]
    async fn removing_category_with_children_is_refused() {
        let coordinator = coordinator(FakeStore::default());
        coordinator.initialize_all().await.expect("init succeeds");

        let err = coordinator
            .on_category_removed(NodeId(2))
            .expect_err("has children");
        assert!(matches!(
            err,
            CoordinatorError::Hierarchy(HierarchyError::HasChildren { .. })
        ));
        assert!(coordinator.hierarchy().contains(NodeId(2)));

        coordinator.on_category_removed(NodeId(3)).expect("leaf removal");
        assert!(!coordinator.hierarchy().contains(NodeId(3)));
        assert!(!coordinator.file_stats_cache().contains(NodeId(3), true));
    }
}
