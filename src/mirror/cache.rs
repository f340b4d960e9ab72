//! Keyed client-side store with lazy TTL expiry and LRU eviction.

use std::num::NonZeroUsize;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::time::{Duration, Instant};

use lru::LruCache;
use metrics::counter;
use tracing::debug;

use crate::config::MirrorSettings;

const METRIC_MIRROR_HIT: &str = "canopy_mirror_hit_total";
const METRIC_MIRROR_MISS: &str = "canopy_mirror_miss_total";
const METRIC_MIRROR_EVICT: &str = "canopy_mirror_evict_total";

/// Monotonic time source, expressed as the offset from an arbitrary origin.
pub trait Clock {
    fn now(&self) -> Duration;
}

#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Hand-driven clock. Clones share the same reading.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        let millis = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_millis(self.millis.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry<V> {
    pub data: V,
    pub created_at: Duration,
    pub last_accessed_at: Duration,
}

/// Which keys `MirrorCache::invalidate` removes.
pub enum InvalidatePattern {
    Exact(String),
    Prefix(String),
    Predicate(Box<dyn Fn(&str) -> bool>),
}

impl InvalidatePattern {
    pub fn predicate(matcher: impl Fn(&str) -> bool + 'static) -> Self {
        Self::Predicate(Box::new(matcher))
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            InvalidatePattern::Exact(exact) => key == exact,
            InvalidatePattern::Prefix(prefix) => key.starts_with(prefix.as_str()),
            InvalidatePattern::Predicate(matcher) => matcher(key),
        }
    }
}

/// A trailing `*` makes the pattern a prefix match.
impl From<&str> for InvalidatePattern {
    fn from(pattern: &str) -> Self {
        match pattern.strip_suffix('*') {
            Some(prefix) => InvalidatePattern::Prefix(prefix.to_string()),
            None => InvalidatePattern::Exact(pattern.to_string()),
        }
    }
}

impl From<String> for InvalidatePattern {
    fn from(pattern: String) -> Self {
        InvalidatePattern::from(pattern.as_str())
    }
}

impl std::fmt::Debug for InvalidatePattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidatePattern::Exact(key) => f.debug_tuple("Exact").field(key).finish(),
            InvalidatePattern::Prefix(prefix) => f.debug_tuple("Prefix").field(prefix).finish(),
            InvalidatePattern::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Client-side cache of server aggregates.
///
/// Entries older than the TTL are dropped when next read. When full, `set`
/// evicts the least recently used entry. Operations take `&mut self`: the
/// mirror lives on a single event loop and is never shared.
pub struct MirrorCache<V, C: Clock = SystemClock> {
    name: &'static str,
    entries: LruCache<String, CacheEntry<V>>,
    ttl: Duration,
    clock: C,
}

impl<V: Clone> MirrorCache<V, SystemClock> {
    pub fn new(name: &'static str, settings: &MirrorSettings) -> Self {
        Self::with_clock(name, settings.ttl, settings.max_entries, SystemClock::new())
    }
}

impl<V: Clone, C: Clock> MirrorCache<V, C> {
    pub fn with_clock(
        name: &'static str,
        ttl: Duration,
        capacity: NonZeroUsize,
        clock: C,
    ) -> Self {
        Self {
            name,
            entries: LruCache::new(capacity),
            ttl,
            clock,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn get(&mut self, key: &str) -> Option<V> {
        let now = self.clock.now();
        if self.expire_if_stale(key, now) {
            counter!(METRIC_MIRROR_MISS, "cache" => self.name).increment(1);
            return None;
        }

        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.last_accessed_at = now;
                counter!(METRIC_MIRROR_HIT, "cache" => self.name).increment(1);
                Some(entry.data.clone())
            }
            None => {
                counter!(METRIC_MIRROR_MISS, "cache" => self.name).increment(1);
                None
            }
        }
    }

    /// Store `value`, evicting the least recently used entry when full.
    pub fn set(&mut self, key: impl Into<String>, value: V) {
        let key = key.into();
        let now = self.clock.now();
        let entry = CacheEntry {
            data: value,
            created_at: now,
            last_accessed_at: now,
        };

        match self.entries.push(key.clone(), entry) {
            Some((evicted, _)) if evicted != key => {
                counter!(METRIC_MIRROR_EVICT, "cache" => self.name).increment(1);
                debug!(cache = self.name, key = %evicted, "Mirror entry evicted");
            }
            _ => {}
        }
    }

    /// True if a live entry exists. Does not affect recency.
    pub fn has(&mut self, key: &str) -> bool {
        let now = self.clock.now();
        !self.expire_if_stale(key, now) && self.entries.contains(key)
    }

    /// Mutate a live entry in place. The TTL is not renewed.
    pub fn update(&mut self, key: &str, apply: impl FnOnce(&mut V)) -> bool {
        let now = self.clock.now();
        if self.expire_if_stale(key, now) {
            return false;
        }
        match self.entries.peek_mut(key) {
            Some(entry) => {
                apply(&mut entry.data);
                true
            }
            None => false,
        }
    }

    /// Remove every entry matching `pattern`; returns how many were removed.
    pub fn invalidate(&mut self, pattern: impl Into<InvalidatePattern>) -> usize {
        let pattern = pattern.into();
        if let InvalidatePattern::Exact(key) = &pattern {
            return usize::from(self.entries.pop(key.as_str()).is_some());
        }

        let victims: Vec<String> = self
            .entries
            .iter()
            .filter(|(key, _)| pattern.matches(key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &victims {
            self.entries.pop(key.as_str());
        }
        victims.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Entries currently held, expired ones included until they are read.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|(key, _)| key.clone()).collect()
    }

    #[doc(hidden)]
    pub fn seed_for_test(&mut self, key: impl Into<String>, value: V, created_at: Duration) {
        self.entries.put(
            key.into(),
            CacheEntry {
                data: value,
                created_at,
                last_accessed_at: created_at,
            },
        );
    }

    fn expire_if_stale(&mut self, key: &str, now: Duration) -> bool {
        let stale = self
            .entries
            .peek(key)
            .is_some_and(|entry| now.saturating_sub(entry.created_at) >= self.ttl);
        if stale {
            self.entries.pop(key);
        }
        stale
    }
}
