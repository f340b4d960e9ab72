#![allow(dead_code)]

use std::sync::Arc;

use canopy::application::categories::CategoryService;
use canopy::application::posts::PostService;
use canopy::application::repos::StatsRepo;
use canopy::application::uploads::UploadService;
use canopy::cache::{CacheConfig, CacheCoordinator};
use canopy::domain::{FileStats, NodeId};
use canopy::infra::memory::MemoryStore;

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub cache: Arc<CacheCoordinator>,
    pub posts: PostService,
    pub categories: CategoryService,
    pub uploads: UploadService,
}

impl Harness {
    pub async fn new(seed: &str, config: CacheConfig) -> Self {
        let store = Arc::new(MemoryStore::from_toml(seed).expect("seed should parse"));
        let cache = Arc::new(CacheCoordinator::new(config, store.clone()));
        cache
            .initialize_all()
            .await
            .expect("caches should initialize");
        cache.start();

        Self {
            posts: PostService::new(store.clone(), cache.clone()),
            categories: CategoryService::new(store.clone(), cache.clone()),
            uploads: UploadService::new(store.clone(), cache.clone()),
            store,
            cache,
        }
    }

    pub async fn sync(seed: &str) -> Self {
        Self::new(seed, CacheConfig::synchronous()).await
    }

    /// Assert the cached value matches the store for every category, flat and recursive.
    pub async fn assert_file_stats_match_store(&self) {
        for node in self.cache.hierarchy().snapshot() {
            for recursive in [false, true] {
                let cached = self
                    .cache
                    .get_file_stats(node.id, recursive)
                    .await
                    .expect("cached read");
                let stored = self
                    .store
                    .load_file_stats(node.id, recursive)
                    .await
                    .expect("store read");
                assert_eq!(
                    cached, stored,
                    "file stats for {} (recursive: {recursive})",
                    node.id
                );
            }
        }
    }

    pub fn assert_post_counts_reconcile(&self) {
        let hierarchy = self.cache.hierarchy();
        for node in hierarchy.snapshot() {
            let expected: u64 = hierarchy
                .subtree(node.id)
                .into_iter()
                .map(|id| self.cache.get_post_count(id))
                .sum();
            assert_eq!(
                self.cache.get_post_count_recursive(node.id),
                expected,
                "recursive count for {}",
                node.id
            );
        }
    }

    pub async fn assert_audit_clean(&self) {
        let audits = self.cache.audit_all().await.expect("audit");
        for audit in audits {
            assert!(audit.is_consistent(), "drift: {audit:?}");
        }
    }
}

pub fn n(id: i64) -> NodeId {
    NodeId::new(id)
}

pub fn stats(file_count: u64, total_size: u64) -> FileStats {
    FileStats::new(file_count, total_size)
}

/// Seed text for a list of `(id, parent)` categories.
pub fn tree(categories: &[(i64, Option<i64>)]) -> String {
    let mut seed = String::new();
    for (id, parent) in categories {
        seed.push_str(&format!("[[categories]]\nid = {id}\nname = \"c{id}\"\n"));
        if let Some(parent) = parent {
            seed.push_str(&format!("parent = {parent}\n"));
        }
        seed.push('\n');
    }
    seed
}

pub fn files(category: i64, count: usize, size_bytes: u64) -> String {
    (0..count)
        .map(|i| {
            format!(
                "[[files]]\ncategory = {category}\nfilename = \"f{category}-{i}.bin\"\nsize_bytes = {size_bytes}\n\n"
            )
        })
        .collect()
}

pub fn posts(category: i64, days: &[&str]) -> String {
    days.iter()
        .enumerate()
        .map(|(i, day)| {
            format!(
                "[[posts]]\ncategory = {category}\ntitle = \"p{category}-{i}\"\npublished_on = \"{day}\"\n\n"
            )
        })
        .collect()
}
