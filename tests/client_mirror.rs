mod common;

use std::num::NonZeroUsize;
use std::time::Duration;

use canopy::config::MirrorSettings;
use canopy::mirror::{ClientMirror, InvalidatePattern, ManualClock, MirrorCache, MirrorKeys};
use common::{Harness, files, n, tree};

fn bounded(capacity: usize, ttl: Duration) -> (MirrorCache<String, ManualClock>, ManualClock) {
    let clock = ManualClock::new();
    let cache = MirrorCache::with_clock(
        "props",
        ttl,
        NonZeroUsize::new(capacity).expect("non-zero"),
        clock.clone(),
    );
    (cache, clock)
}

#[test]
fn reads_after_ttl_miss_and_purge() {
    let (mut cache, clock) = bounded(8, Duration::from_millis(500));
    for key in ["a", "b", "c"] {
        cache.set(key, key.to_uppercase());
    }
    clock.advance(Duration::from_millis(499));
    assert_eq!(cache.get("b").as_deref(), Some("B"));

    clock.advance(Duration::from_millis(1));
    for key in ["a", "b", "c"] {
        assert_eq!(cache.get(key), None);
    }
    assert!(cache.is_empty());
}

#[test]
fn a_full_cache_evicts_exactly_the_least_recently_accessed_entry() {
    let (mut cache, clock) = bounded(3, Duration::from_secs(60));
    cache.set("a", "1".into());
    clock.advance(Duration::from_millis(1));
    cache.set("b", "2".into());
    clock.advance(Duration::from_millis(1));
    cache.set("c", "3".into());
    clock.advance(Duration::from_millis(1));

    // `a` becomes the most recent; `b` is now the oldest access.
    cache.get("a");
    cache.set("d", "4".into());

    assert_eq!(cache.len(), 3);
    let mut keys = cache.keys();
    keys.sort();
    assert_eq!(keys, vec!["a", "c", "d"]);
}

#[test]
fn prefix_invalidation_removes_exactly_the_matching_keys() {
    let (mut cache, _) = bounded(16, Duration::from_secs(60));
    let keys = [
        "file-stats:1:flat",
        "file-stats:1:recursive",
        "file-stats:10:flat",
        "file-stats",
        "post-count:1:flat",
        "xfile-stats:1:flat",
    ];
    for key in keys {
        cache.set(key, String::new());
    }

    let removed = cache.invalidate("file-stats:1:*");

    assert_eq!(removed, 2);
    let mut left = cache.keys();
    left.sort();
    assert_eq!(
        left,
        vec![
            "file-stats",
            "file-stats:10:flat",
            "post-count:1:flat",
            "xfile-stats:1:flat",
        ]
    );

    let removed = cache.invalidate(InvalidatePattern::Exact("file-stats".into()));
    assert_eq!(removed, 1);
}

#[tokio::test]
async fn mirror_tracks_server_file_stats_across_a_move() {
    let seed = format!(
        "{}{}{}",
        tree(&[(1, None), (2, Some(1)), (3, None), (4, Some(2))]),
        files(2, 1, 40),
        files(4, 2, 30),
    );
    let h = Harness::sync(&seed).await;

    let settings = MirrorSettings {
        ttl: Duration::from_secs(300),
        max_entries: NonZeroUsize::new(64).expect("non-zero"),
    };
    let mut mirror = ClientMirror::with_clock(&settings, ManualClock::new());
    mirror.load_tree(&h.cache.hierarchy().snapshot());
    for id in [1, 2, 3, 4] {
        let recursive = h.cache.get_file_stats(n(id), true).await.expect("read");
        mirror.set_file_stats(n(id), true, recursive);
    }

    let outcome = h
        .categories
        .move_to(n(2), Some(n(3)))
        .await
        .expect("move");
    let report = mirror.apply_category_move(&outcome);

    assert_eq!(report.merged, 2);
    for id in [1, 2, 3, 4] {
        let server = h.cache.get_file_stats(n(id), true).await.expect("read");
        assert_eq!(mirror.get_file_stats(n(id), true), Some(server), "node {id}");
    }
    assert_eq!(mirror.chain(n(4)), vec![n(4), n(2), n(3)]);
    assert_eq!(
        mirror.get_post_count(n(3), true),
        Some(h.cache.get_post_count_recursive(n(3)))
    );
    assert!(!mirror.post_counts().has(&MirrorKeys::post_count(n(4), true)));
}
