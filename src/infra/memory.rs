//! In-process persistence backed by a TOML seed document.
//!
//! Implements every repository trait so the coordinator and services can run
//! without a database. Used by the `canopy` binary and by tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use serde::Deserialize;
use time::Date;
use time::macros::format_description;
use tracing::info;
use uuid::Uuid;

use crate::application::repos::{
    CategoriesWriteRepo, CategoryRecord, CreatePostParams, DayCounts, DeletedCategory,
    HierarchyRepo, PostRecord, PostsWriteRepo, RepoError, StatsRepo, UploadRecord,
    UploadsWriteRepo,
};
use crate::domain::{ActivityScope, FileStats, Node, NodeId};
use crate::infra::error::InfraError;
use crate::util::lock::{mutex_lock, rw_read, rw_write};

const SOURCE: &str = "infra::memory";

/// Seed document layout.
///
/// ```toml
/// [[categories]]
/// id = 1
/// name = "Engineering"
///
/// [[categories]]
/// id = 2
/// parent = 1
/// name = "Rust"
///
/// [[posts]]
/// category = 2
/// title = "Ownership in practice"
/// published_on = "2024-03-01"
///
/// [[files]]
/// category = 2
/// filename = "diagram.png"
/// size_bytes = 2048
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SeedDocument {
    pub categories: Vec<SeedCategory>,
    pub posts: Vec<SeedPost>,
    pub files: Vec<SeedFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedCategory {
    pub id: i64,
    #[serde(default)]
    pub parent: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedPost {
    pub category: i64,
    pub title: String,
    /// `YYYY-MM-DD`.
    pub published_on: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedFile {
    pub category: i64,
    pub filename: String,
    pub size_bytes: u64,
}

/// Store operations that tests can force to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    LoadHierarchy,
    LoadDirectPostCounts,
    LoadFileStats,
    LoadActivity,
}

#[derive(Debug, Default)]
struct MemoryState {
    categories: BTreeMap<NodeId, CategoryRecord>,
    posts: HashMap<Uuid, PostRecord>,
    uploads: HashMap<Uuid, UploadRecord>,
}

impl MemoryState {
    fn next_category_id(&self) -> NodeId {
        self.categories
            .keys()
            .next_back()
            .map_or(NodeId(1), |last| NodeId(last.get() + 1))
    }

    fn depth_of(&self, id: NodeId) -> u8 {
        let mut depth = 0u8;
        let mut cursor = self.categories.get(&id).and_then(|c| c.parent_id);
        // Bounded so a corrupt parent cycle cannot loop forever.
        while let Some(parent) = cursor {
            if usize::from(depth) >= self.categories.len() {
                break;
            }
            depth = depth.saturating_add(1);
            cursor = self.categories.get(&parent).and_then(|c| c.parent_id);
        }
        depth
    }

    fn is_within(&self, id: NodeId, root: NodeId) -> bool {
        let mut cursor = Some(id);
        let mut steps = 0;
        while let Some(current) = cursor {
            if current == root {
                return true;
            }
            steps += 1;
            if steps > self.categories.len() {
                return false;
            }
            cursor = self.categories.get(&current).and_then(|c| c.parent_id);
        }
        false
    }

    fn in_scope(&self, category: NodeId, scope: ActivityScope, recursive: bool) -> bool {
        match scope {
            ActivityScope::All => true,
            ActivityScope::Node(node) if recursive => self.is_within(category, node),
            ActivityScope::Node(node) => category == node,
        }
    }

    fn require_category(&self, id: NodeId) -> Result<&CategoryRecord, RepoError> {
        self.categories.get(&id).ok_or(RepoError::NotFound)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    failing: Mutex<HashSet<StoreOp>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load(path: &Path) -> Result<Self, InfraError> {
        let text = tokio::fs::read_to_string(path).await?;
        let store = Self::from_toml(&text)?;
        info!(path = %path.display(), "Seed loaded");
        Ok(store)
    }

    pub fn from_toml(text: &str) -> Result<Self, InfraError> {
        let seed: SeedDocument =
            toml::from_str(text).map_err(|err| InfraError::seed(err.to_string()))?;
        Self::from_seed(&seed)
    }

    pub fn from_seed(seed: &SeedDocument) -> Result<Self, InfraError> {
        let mut state = MemoryState::default();

        for category in &seed.categories {
            let id = NodeId(category.id);
            let record = CategoryRecord {
                id,
                parent_id: category.parent.map(NodeId),
                name: category.name.clone(),
                description: category.description.clone(),
            };
            if state.categories.insert(id, record).is_some() {
                return Err(InfraError::seed(format!("duplicate category id {id}")));
            }
        }
        for category in state.categories.values() {
            if let Some(parent) = category.parent_id
                && !state.categories.contains_key(&parent)
            {
                return Err(InfraError::seed(format!(
                    "category {} references missing parent {parent}",
                    category.id
                )));
            }
        }

        for post in &seed.posts {
            let category = NodeId(post.category);
            if !state.categories.contains_key(&category) {
                return Err(InfraError::seed(format!(
                    "post `{}` references missing category {category}",
                    post.title
                )));
            }
            let published_on = parse_day(&post.published_on)?;
            let record = PostRecord {
                id: Uuid::new_v4(),
                category,
                title: post.title.clone(),
                published_on,
            };
            state.posts.insert(record.id, record);
        }

        for file in &seed.files {
            let category = NodeId(file.category);
            if !state.categories.contains_key(&category) {
                return Err(InfraError::seed(format!(
                    "file `{}` references missing category {category}",
                    file.filename
                )));
            }
            let record = UploadRecord {
                id: Uuid::new_v4(),
                category,
                filename: file.filename.clone(),
                size_bytes: file.size_bytes,
            };
            state.uploads.insert(record.id, record);
        }

        Ok(Self {
            state: RwLock::new(state),
            failing: Mutex::new(HashSet::new()),
        })
    }

    /// Make `op` fail with a persistence error until [`heal`](Self::heal) is called.
    pub fn fail_on(&self, op: StoreOp) {
        mutex_lock(&self.failing, SOURCE, "fail_on").insert(op);
    }

    pub fn heal(&self, op: StoreOp) {
        mutex_lock(&self.failing, SOURCE, "heal").remove(&op);
    }

    fn check(&self, op: StoreOp) -> Result<(), RepoError> {
        if mutex_lock(&self.failing, SOURCE, "check").contains(&op) {
            return Err(RepoError::from_persistence(format!("{op:?} unavailable")));
        }
        Ok(())
    }

    /// Post ids filed under `category`.
    pub fn post_ids(&self, category: NodeId) -> Vec<Uuid> {
        let state = rw_read(&self.state, SOURCE, "post_ids");
        let mut ids: Vec<(Date, Uuid)> = state
            .posts
            .values()
            .filter(|post| post.category == category)
            .map(|post| (post.published_on, post.id))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Upload ids stored under `category`.
    pub fn upload_ids(&self, category: NodeId) -> Vec<Uuid> {
        let state = rw_read(&self.state, SOURCE, "upload_ids");
        let mut ids: Vec<Uuid> = state
            .uploads
            .values()
            .filter(|upload| upload.category == category)
            .map(|upload| upload.id)
            .collect();
        ids.sort();
        ids
    }

    /// Remove a post without telling anyone, simulating a lost event.
    pub fn delete_post_silently(&self, id: Uuid) -> Option<PostRecord> {
        rw_write(&self.state, SOURCE, "delete_post_silently")
            .posts
            .remove(&id)
    }
}

fn parse_day(raw: &str) -> Result<Date, InfraError> {
    Date::parse(raw, format_description!("[year]-[month]-[day]"))
        .map_err(|err| InfraError::seed(format!("invalid date `{raw}`: {err}")))
}

#[async_trait]
impl HierarchyRepo for MemoryStore {
    async fn load_hierarchy(&self) -> Result<Vec<Node>, RepoError> {
        self.check(StoreOp::LoadHierarchy)?;
        let state = rw_read(&self.state, SOURCE, "load_hierarchy");
        Ok(state
            .categories
            .values()
            .map(|category| Node {
                id: category.id,
                parent_id: category.parent_id,
                depth: state.depth_of(category.id),
            })
            .collect())
    }
}

#[async_trait]
impl StatsRepo for MemoryStore {
    async fn load_direct_post_counts(&self) -> Result<HashMap<NodeId, u64>, RepoError> {
        self.check(StoreOp::LoadDirectPostCounts)?;
        let state = rw_read(&self.state, SOURCE, "load_direct_post_counts");
        let mut counts = HashMap::new();
        for post in state.posts.values() {
            *counts.entry(post.category).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn count_posts_direct(&self, node: NodeId) -> Result<u64, RepoError> {
        let state = rw_read(&self.state, SOURCE, "count_posts_direct");
        Ok(state
            .posts
            .values()
            .filter(|post| post.category == node)
            .count() as u64)
    }

    async fn load_file_stats(&self, node: NodeId, recursive: bool) -> Result<FileStats, RepoError> {
        self.check(StoreOp::LoadFileStats)?;
        let state = rw_read(&self.state, SOURCE, "load_file_stats");
        state.require_category(node)?;
        Ok(state
            .uploads
            .values()
            .filter(|upload| {
                if recursive {
                    state.is_within(upload.category, node)
                } else {
                    upload.category == node
                }
            })
            .fold(FileStats::ZERO, |acc, upload| {
                acc.saturating_add(FileStats::single(upload.size_bytes))
            }))
    }

    async fn load_flat_file_stats(&self) -> Result<HashMap<NodeId, FileStats>, RepoError> {
        self.check(StoreOp::LoadFileStats)?;
        let state = rw_read(&self.state, SOURCE, "load_flat_file_stats");
        let mut stats: HashMap<NodeId, FileStats> = HashMap::new();
        for upload in state.uploads.values() {
            let entry = stats.entry(upload.category).or_default();
            *entry = entry.saturating_add(FileStats::single(upload.size_bytes));
        }
        Ok(stats)
    }

    async fn load_activity(
        &self,
        scope: ActivityScope,
        recursive: bool,
        start: Date,
        end: Date,
    ) -> Result<DayCounts, RepoError> {
        self.check(StoreOp::LoadActivity)?;
        let state = rw_read(&self.state, SOURCE, "load_activity");
        let mut days: BTreeMap<Date, u32> = BTreeMap::new();
        for post in state.posts.values() {
            if post.published_on >= start
                && post.published_on < end
                && state.in_scope(post.category, scope, recursive)
            {
                *days.entry(post.published_on).or_insert(0) += 1;
            }
        }
        Ok(days.into_iter().collect())
    }
}

#[async_trait]
impl PostsWriteRepo for MemoryStore {
    async fn create_post(&self, params: CreatePostParams) -> Result<PostRecord, RepoError> {
        let mut state = rw_write(&self.state, SOURCE, "create_post");
        state.require_category(params.category)?;
        let record = PostRecord {
            id: Uuid::new_v4(),
            category: params.category,
            title: params.title,
            published_on: params.published_on,
        };
        state.posts.insert(record.id, record.clone());
        Ok(record)
    }

    async fn delete_post(&self, id: Uuid) -> Result<PostRecord, RepoError> {
        rw_write(&self.state, SOURCE, "delete_post")
            .posts
            .remove(&id)
            .ok_or(RepoError::NotFound)
    }

    async fn move_post(&self, id: Uuid, to: NodeId) -> Result<PostRecord, RepoError> {
        let mut state = rw_write(&self.state, SOURCE, "move_post");
        state.require_category(to)?;
        let post = state.posts.get_mut(&id).ok_or(RepoError::NotFound)?;
        let before = post.clone();
        post.category = to;
        Ok(before)
    }
}

#[async_trait]
impl CategoriesWriteRepo for MemoryStore {
    async fn create_category(
        &self,
        parent: Option<NodeId>,
        name: &str,
        description: Option<&str>,
    ) -> Result<CategoryRecord, RepoError> {
        let mut state = rw_write(&self.state, SOURCE, "create_category");
        if let Some(parent) = parent {
            state.require_category(parent)?;
        }
        let record = CategoryRecord {
            id: state.next_category_id(),
            parent_id: parent,
            name: name.to_string(),
            description: description.map(str::to_string),
        };
        state.categories.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update_category_metadata(
        &self,
        id: NodeId,
        name: &str,
        description: Option<&str>,
    ) -> Result<CategoryRecord, RepoError> {
        let mut state = rw_write(&self.state, SOURCE, "update_category_metadata");
        let category = state.categories.get_mut(&id).ok_or(RepoError::NotFound)?;
        category.name = name.to_string();
        category.description = description.map(str::to_string);
        Ok(category.clone())
    }

    async fn move_category(
        &self,
        id: NodeId,
        new_parent: Option<NodeId>,
    ) -> Result<CategoryRecord, RepoError> {
        let mut state = rw_write(&self.state, SOURCE, "move_category");
        if let Some(parent) = new_parent {
            state.require_category(parent)?;
            if state.is_within(parent, id) {
                return Err(RepoError::invalid_input(format!(
                    "category {id} cannot move under its own descendant {parent}"
                )));
            }
        }
        let category = state.categories.get_mut(&id).ok_or(RepoError::NotFound)?;
        category.parent_id = new_parent;
        Ok(category.clone())
    }

    async fn delete_category(&self, id: NodeId) -> Result<DeletedCategory, RepoError> {
        let mut state = rw_write(&self.state, SOURCE, "delete_category");
        state.require_category(id)?;
        if state.categories.values().any(|c| c.parent_id == Some(id)) {
            return Err(RepoError::invalid_input(format!(
                "category {id} still has subcategories"
            )));
        }

        state.categories.remove(&id);
        let post_ids: Vec<Uuid> = state
            .posts
            .values()
            .filter(|post| post.category == id)
            .map(|post| post.id)
            .collect();
        let posts: Vec<PostRecord> = post_ids
            .iter()
            .filter_map(|post_id| state.posts.remove(post_id))
            .collect();
        let upload_ids: Vec<Uuid> = state
            .uploads
            .values()
            .filter(|upload| upload.category == id)
            .map(|upload| upload.id)
            .collect();
        let files: Vec<UploadRecord> = upload_ids
            .iter()
            .filter_map(|upload_id| state.uploads.remove(upload_id))
            .collect();

        Ok(DeletedCategory { id, posts, files })
    }
}

#[async_trait]
impl UploadsWriteRepo for MemoryStore {
    async fn create_upload(
        &self,
        category: NodeId,
        filename: &str,
        size_bytes: u64,
    ) -> Result<UploadRecord, RepoError> {
        let mut state = rw_write(&self.state, SOURCE, "create_upload");
        state.require_category(category)?;
        let record = UploadRecord {
            id: Uuid::new_v4(),
            category,
            filename: filename.to_string(),
            size_bytes,
        };
        state.uploads.insert(record.id, record.clone());
        Ok(record)
    }

    async fn delete_upload(&self, id: Uuid) -> Result<UploadRecord, RepoError> {
        rw_write(&self.state, SOURCE, "delete_upload")
            .uploads
            .remove(&id)
            .ok_or(RepoError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use time::macros::date;

    use super::*;

    const SEED: &str = r#"
        [[categories]]
        id = 1
        name = "Engineering"

        [[categories]]
        id = 2
        parent = 1
        name = "Rust"

        [[categories]]
        id = 3
        parent = 2
        name = "Async"

        [[posts]]
        category = 3
        title = "Pinning"
        published_on = "2024-03-01"

        [[posts]]
        category = 2
        title = "Traits"
        published_on = "2024-03-01"

        [[files]]
        category = 3
        filename = "pin.svg"
        size_bytes = 300
    "#;

    #[tokio::test]
    async fn seed_builds_hierarchy_with_depths() {
        let store = MemoryStore::from_toml(SEED).expect("seed parses");
        let mut nodes = store.load_hierarchy().await.expect("loads");
        nodes.sort_by_key(|node| node.id);

        assert_eq!(
            nodes.iter().map(|node| node.depth).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[tokio::test]
    async fn recursive_queries_cover_the_subtree() {
        let store = MemoryStore::from_toml(SEED).expect("seed parses");

        assert_eq!(
            store.load_file_stats(NodeId(1), true).await.expect("stats"),
            FileStats::new(1, 300)
        );
        assert_eq!(
            store.load_file_stats(NodeId(1), false).await.expect("stats"),
            FileStats::ZERO
        );

        let days = store
            .load_activity(
                ActivityScope::Node(NodeId(2)),
                true,
                date!(2024 - 03 - 01),
                date!(2024 - 04 - 01),
            )
            .await
            .expect("activity");
        assert_eq!(days, vec![(date!(2024 - 03 - 01), 2)]);
    }

    #[test]
    fn seed_rejects_dangling_parent_and_bad_dates() {
        let err = MemoryStore::from_toml(
            r#"
            [[categories]]
            id = 2
            parent = 9
            name = "Orphan"
            "#,
        )
        .expect_err("dangling parent");
        assert!(matches!(err, InfraError::Seed { .. }));

        let err = MemoryStore::from_toml(
            r#"
            [[categories]]
            id = 1
            name = "Root"

            [[posts]]
            category = 1
            title = "Bad"
            published_on = "March first"
            "#,
        )
        .expect_err("bad date");
        assert!(matches!(err, InfraError::Seed { .. }));
    }

    #[tokio::test]
    async fn delete_category_returns_removed_children_records() {
        let store = MemoryStore::from_toml(SEED).expect("seed parses");
        assert!(store.delete_category(NodeId(2)).await.is_err());

        let removed = store.delete_category(NodeId(3)).await.expect("leaf delete");
        assert_eq!(removed.posts.len(), 1);
        assert_eq!(removed.files.len(), 1);
        assert_eq!(store.count_posts_direct(NodeId(3)).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn failure_injection_affects_only_the_chosen_operation() {
        let store = MemoryStore::from_toml(SEED).expect("seed parses");
        store.fail_on(StoreOp::LoadActivity);

        assert!(
            store
                .load_activity(ActivityScope::All, true, date!(2024 - 01 - 01), date!(2025 - 01 - 01))
                .await
                .is_err()
        );
        assert!(store.load_direct_post_counts().await.is_ok());

        store.heal(StoreOp::LoadActivity);
        assert!(
            store
                .load_activity(ActivityScope::All, true, date!(2024 - 01 - 01), date!(2025 - 01 - 01))
                .await
                .is_ok()
        );
    }
}
