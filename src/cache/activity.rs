//! Per-day post activity histograms.
//!
//! Windows are dense per-day arrays keyed by scope, mode and month range.
//! Single-post events patch windows in place. Moves cannot be patched on
//! recursive windows because a day bucket does not remember which category
//! its posts came from, so those windows are dropped and reloaded lazily.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use time::{Date, Month};
use tracing::{debug, trace};

use super::config::MAX_ACTIVITY_WINDOW_MONTHS;
use super::dispatcher::{EventHandler, HandlerError};
use super::events::{CacheEvent, EventKind, EventType};
use crate::domain::{ActivityScope, NodeId};
use crate::util::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::activity";

/// Event types the activity cache reacts to.
pub const ACTIVITY_EVENTS: [EventType; 5] = [
    EventType::PostCreated,
    EventType::PostDeleted,
    EventType::PostMoved,
    EventType::CategoryUpdated,
    EventType::CategoryRemoved,
];

/// A whole-month date range `[anchor, anchor + months)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActivityWindowSpec {
    /// Always the first day of a month.
    pub anchor: Date,
    pub months: u8,
}

impl ActivityWindowSpec {
    /// Normalizes `anchor` to the first of its month and clamps `months` to `1..=36`.
    pub fn new(anchor: Date, months: u8) -> Self {
        Self {
            anchor: first_of_month(anchor),
            months: months.clamp(1, MAX_ACTIVITY_WINDOW_MONTHS),
        }
    }

    /// The `months`-long window whose last month contains `today`.
    pub fn trailing(today: Date, months: u8) -> Self {
        let months = months.clamp(1, MAX_ACTIVITY_WINDOW_MONTHS);
        let anchor = shift_months(first_of_month(today), -(i32::from(months) - 1));
        Self { anchor, months }
    }

    /// First day after the window.
    pub fn end(&self) -> Date {
        shift_months(self.anchor, i32::from(self.months))
    }

    pub fn contains(&self, day: Date) -> bool {
        day >= self.anchor && day < self.end()
    }

    pub fn day_count(&self) -> usize {
        usize::try_from((self.end() - self.anchor).whole_days()).unwrap_or(0)
    }

    fn index_of(&self, day: Date) -> Option<usize> {
        if !self.contains(day) {
            return None;
        }
        usize::try_from((day - self.anchor).whole_days()).ok()
    }
}

fn first_of_month(day: Date) -> Date {
    day.replace_day(1).unwrap_or(day)
}

/// Move a first-of-month date by whole months, saturating at the calendar bounds.
fn shift_months(first: Date, months: i32) -> Date {
    let index = first.year() * 12 + i32::from(u8::from(first.month())) - 1 + months;
    let year = index.div_euclid(12);
    let month = u8::try_from(index.rem_euclid(12) + 1)
        .ok()
        .and_then(|m| Month::try_from(m).ok())
        .unwrap_or(Month::January);

    Date::from_calendar_date(year, month, 1).unwrap_or(if months >= 0 {
        Date::MAX
    } else {
        Date::MIN
    })
}

/// Identifies one cached window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActivityKey {
    pub scope: ActivityScope,
    pub recursive: bool,
    pub window: ActivityWindowSpec,
}

impl ActivityKey {
    /// The `All` scope only has a recursive view; `recursive` is forced on for it.
    pub fn new(scope: ActivityScope, recursive: bool, window: ActivityWindowSpec) -> Self {
        Self {
            scope,
            recursive: recursive || scope == ActivityScope::All,
            window,
        }
    }

    pub fn flat(node: NodeId, window: ActivityWindowSpec) -> Self {
        Self::new(ActivityScope::Node(node), false, window)
    }

    pub fn recursive(node: NodeId, window: ActivityWindowSpec) -> Self {
        Self::new(ActivityScope::Node(node), true, window)
    }

    pub fn all(window: ActivityWindowSpec) -> Self {
        Self::new(ActivityScope::All, true, window)
    }

    fn slot(&self) -> (ActivityScope, bool) {
        (self.scope, self.recursive)
    }
}

/// Derived statistics of one window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActivityStats {
    pub total: u64,
    pub active_days: u32,
    pub max_day: u32,
}

impl ActivityStats {
    fn from_days(days: &[u32]) -> Self {
        days.iter().fold(Self::default(), |mut stats, &count| {
            stats.total += u64::from(count);
            if count > 0 {
                stats.active_days += 1;
            }
            stats.max_day = stats.max_day.max(count);
            stats
        })
    }
}

/// Dense per-day counts for one window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityWindow {
    pub window: ActivityWindowSpec,
    pub days: Vec<u32>,
    pub stats: ActivityStats,
}

impl ActivityWindow {
    pub fn empty(window: ActivityWindowSpec) -> Self {
        Self {
            window,
            days: vec![0; window.day_count()],
            stats: ActivityStats::default(),
        }
    }

    /// Build from sparse `(day, count)` pairs. Days outside the window are ignored.
    pub fn from_counts(window: ActivityWindowSpec, counts: &[(Date, u32)]) -> Self {
        let mut days = vec![0u32; window.day_count()];
        for &(day, count) in counts {
            if let Some(index) = window.index_of(day) {
                days[index] = days[index].saturating_add(count);
            }
        }
        let stats = ActivityStats::from_days(&days);
        Self {
            window,
            days,
            stats,
        }
    }

    pub fn anchor(&self) -> Date {
        self.window.anchor
    }

    pub fn count_on(&self, day: Date) -> Option<u32> {
        self.window
            .index_of(day)
            .and_then(|index| self.days.get(index).copied())
    }

    /// Add `delta` to `day`, flooring at zero. Returns false when `day` is
    /// outside the window.
    pub fn adjust(&mut self, day: Date, delta: i32) -> bool {
        let Some(slot) = self
            .window
            .index_of(day)
            .and_then(|index| self.days.get_mut(index))
        else {
            return false;
        };
        let next = (i64::from(*slot) + i64::from(delta)).clamp(0, i64::from(u32::MAX));
        *slot = u32::try_from(next).unwrap_or(0);
        self.stats = ActivityStats::from_days(&self.days);
        true
    }
}

/// Diagnostic snapshot of the activity cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActivityCacheStats {
    pub flat_windows: usize,
    pub recursive_windows: usize,
    pub generation: u64,
}

type Slot = (ActivityScope, bool);

#[derive(Default)]
struct ActivityState {
    windows: HashMap<Slot, HashMap<ActivityWindowSpec, ActivityWindow>>,
    // Bumped on every mutation; a lazy load only lands if nothing changed meanwhile.
    generation: u64,
}

impl ActivityState {
    fn adjust(&mut self, scope: ActivityScope, recursive: bool, day: Date, delta: i32) -> usize {
        let Some(windows) = self.windows.get_mut(&(scope, recursive)) else {
            return 0;
        };
        windows
            .values_mut()
            .map(|window| usize::from(window.adjust(day, delta)))
            .sum()
    }

    fn invalidate_recursive(&mut self, chain: &[NodeId]) -> usize {
        chain
            .iter()
            .filter_map(|id| self.windows.remove(&(ActivityScope::Node(*id), true)))
            .map(|windows| windows.len())
            .sum()
    }
}

#[derive(Default)]
pub struct ActivityCache {
    state: RwLock<ActivityState>,
}

impl ActivityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ActivityKey) -> Option<ActivityWindow> {
        rw_read(&self.state, SOURCE, "get")
            .windows
            .get(&key.slot())
            .and_then(|windows| windows.get(&key.window))
            .cloned()
    }

    pub fn contains(&self, key: &ActivityKey) -> bool {
        rw_read(&self.state, SOURCE, "contains")
            .windows
            .get(&key.slot())
            .is_some_and(|windows| windows.contains_key(&key.window))
    }

    /// Token to pass to [`insert`](Self::insert) after a store load.
    pub fn generation(&self) -> u64 {
        rw_read(&self.state, SOURCE, "generation").generation
    }

    /// Store a freshly loaded window unless the cache changed since
    /// `generation` was read. Returns whether the window was stored.
    pub fn insert(&self, key: ActivityKey, window: ActivityWindow, generation: u64) -> bool {
        let mut state = rw_write(&self.state, SOURCE, "insert");
        if state.generation != generation {
            debug!(
                scope = %key.scope,
                recursive = key.recursive,
                expected = generation,
                current = state.generation,
                "Discarding activity window loaded across a cache mutation"
            );
            return false;
        }
        state
            .windows
            .entry(key.slot())
            .or_default()
            .insert(key.window, window);
        true
    }

    /// Patch `day` in every cached window of `(scope, recursive)`. Returns
    /// the number of windows touched.
    pub fn adjust_day(&self, scope: ActivityScope, recursive: bool, day: Date, delta: i32) -> usize {
        let mut state = rw_write(&self.state, SOURCE, "adjust_day");
        state.generation += 1;
        state.adjust(scope, recursive, day, delta)
    }

    /// Drop every recursive window of the nodes in `chain`. Flat windows stay.
    pub fn invalidate_recursive_chain(&self, chain: &[NodeId]) -> usize {
        let mut state = rw_write(&self.state, SOURCE, "invalidate_recursive_chain");
        state.generation += 1;
        state.invalidate_recursive(chain)
    }

    /// Drop every window, flat and recursive, of `node`.
    pub fn remove_node(&self, node: NodeId) -> usize {
        let mut state = rw_write(&self.state, SOURCE, "remove_node");
        state.generation += 1;
        [false, true]
            .into_iter()
            .filter_map(|recursive| state.windows.remove(&(ActivityScope::Node(node), recursive)))
            .map(|windows| windows.len())
            .sum()
    }

    pub fn clear(&self) {
        let mut state = rw_write(&self.state, SOURCE, "clear");
        state.generation += 1;
        state.windows.clear();
    }

    /// Apply one event using the ancestor chains it carries.
    pub fn apply(&self, event: &CacheEvent) {
        let chains = &event.chains;
        let mut state = rw_write(&self.state, SOURCE, "apply");
        state.generation += 1;

        match &event.kind {
            EventKind::PostCreated { node, day } | EventKind::PostDeleted { node, day } => {
                let delta = if matches!(event.kind, EventKind::PostCreated { .. }) {
                    1
                } else {
                    -1
                };
                let mut touched = state.adjust(ActivityScope::Node(*node), false, *day, delta);
                for id in chain_or_self(&chains.primary, *node) {
                    touched += state.adjust(ActivityScope::Node(id), true, *day, delta);
                }
                touched += state.adjust(ActivityScope::All, true, *day, delta);
                trace!(node = %node, delta, touched, "Activity windows patched");
            }
            EventKind::PostMoved { from, to, day } => {
                if from == to {
                    return;
                }
                state.adjust(ActivityScope::Node(*from), false, *day, -1);
                state.adjust(ActivityScope::Node(*to), false, *day, 1);
                let dropped = state.invalidate_recursive(&chains.union());
                debug!(from = %from, to = %to, dropped, "Recursive activity invalidated by post move");
            }
            EventKind::CategoryUpdated {
                node,
                old_parent,
                new_parent,
                ..
            } => {
                if old_parent == new_parent {
                    return;
                }
                let dropped = state.invalidate_recursive(&chains.union());
                debug!(node = %node, dropped, "Recursive activity invalidated by category move");
            }
            EventKind::CategoryRemoved { node } => {
                for recursive in [false, true] {
                    state.windows.remove(&(ActivityScope::Node(*node), recursive));
                }
            }
            EventKind::FileUploaded { .. } | EventKind::FileDeleted { .. } => {}
        }
    }

    pub fn stats(&self) -> ActivityCacheStats {
        let state = rw_read(&self.state, SOURCE, "stats");
        let mut stats = ActivityCacheStats {
            generation: state.generation,
            ..Default::default()
        };
        for ((_, recursive), windows) in &state.windows {
            if *recursive {
                stats.recursive_windows += windows.len();
            } else {
                stats.flat_windows += windows.len();
            }
        }
        stats
    }

    /// Install a window built from sparse day counts, bypassing the generation check.
    pub fn seed_for_test(&self, key: ActivityKey, counts: &[(Date, u32)]) {
        let window = ActivityWindow::from_counts(key.window, counts);
        rw_write(&self.state, SOURCE, "seed_for_test")
            .windows
            .entry(key.slot())
            .or_default()
            .insert(key.window, window);
    }
}

fn chain_or_self(chain: &[NodeId], node: NodeId) -> Vec<NodeId> {
    if chain.is_empty() {
        vec![node]
    } else {
        chain.to_vec()
    }
}

/// Keeps an [`ActivityCache`] in step with post and category events.
pub struct ActivityHandler {
    cache: Arc<ActivityCache>,
}

impl ActivityHandler {
    pub fn new(cache: Arc<ActivityCache>) -> Self {
        Self { cache }
    }
}

impl EventHandler for ActivityHandler {
    fn name(&self) -> &'static str {
        "activity"
    }

    fn handle(&self, event: &CacheEvent) -> Result<(), HandlerError> {
        self.cache.apply(event);
        Ok(())
    }
}
