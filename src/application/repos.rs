//! Repository traits describing persistence adapters.
//!
//! The relational schema is out of scope; the caches only ever see these
//! load and query interfaces.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use time::Date;
use uuid::Uuid;

use crate::domain::{ActivityScope, FileStats, Node, NodeId};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }
}

/// Per-day post counts for one scope, in ascending date order.
pub type DayCounts = Vec<(Date, u32)>;

#[async_trait]
pub trait HierarchyRepo: Send + Sync {
    async fn load_hierarchy(&self) -> Result<Vec<Node>, RepoError>;
}

#[async_trait]
pub trait StatsRepo: Send + Sync {
    /// Number of posts filed directly under each category. Categories
    /// without posts may be absent.
    async fn load_direct_post_counts(&self) -> Result<HashMap<NodeId, u64>, RepoError>;

    async fn count_posts_direct(&self, node: NodeId) -> Result<u64, RepoError>;

    async fn load_file_stats(&self, node: NodeId, recursive: bool)
    -> Result<FileStats, RepoError>;

    /// Flat file stats for every category that has attachments.
    async fn load_flat_file_stats(&self) -> Result<HashMap<NodeId, FileStats>, RepoError>;

    /// Post counts per day in `[start, end)`.
    async fn load_activity(
        &self,
        scope: ActivityScope,
        recursive: bool,
        start: Date,
        end: Date,
    ) -> Result<DayCounts, RepoError>;
}

/// Everything the cache coordinator reads from the persistent store.
pub trait CacheSource: HierarchyRepo + StatsRepo {}

impl<T> CacheSource for T where T: HierarchyRepo + StatsRepo {}

#[derive(Debug, Clone)]
pub struct CreatePostParams {
    pub category: NodeId,
    pub title: String,
    pub published_on: Date,
}

/// Post as persisted; only the fields the aggregates depend on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostRecord {
    pub id: Uuid,
    pub category: NodeId,
    pub title: String,
    pub published_on: Date,
}

#[async_trait]
pub trait PostsWriteRepo: Send + Sync {
    async fn create_post(&self, params: CreatePostParams) -> Result<PostRecord, RepoError>;
    async fn delete_post(&self, id: Uuid) -> Result<PostRecord, RepoError>;
    /// Move a post to another category, returning the record as it was before the move.
    async fn move_post(&self, id: Uuid, to: NodeId) -> Result<PostRecord, RepoError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryRecord {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
    pub name: String,
    pub description: Option<String>,
}

#[async_trait]
pub trait CategoriesWriteRepo: Send + Sync {
    async fn create_category(
        &self,
        parent: Option<NodeId>,
        name: &str,
        description: Option<&str>,
    ) -> Result<CategoryRecord, RepoError>;
    async fn update_category_metadata(
        &self,
        id: NodeId,
        name: &str,
        description: Option<&str>,
    ) -> Result<CategoryRecord, RepoError>;
    async fn move_category(
        &self,
        id: NodeId,
        new_parent: Option<NodeId>,
    ) -> Result<CategoryRecord, RepoError>;
    /// Delete one category together with the posts and attachments filed directly under it.
    async fn delete_category(&self, id: NodeId) -> Result<DeletedCategory, RepoError>;
}

/// What a category deletion removed from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedCategory {
    pub id: NodeId,
    pub posts: Vec<PostRecord>,
    pub files: Vec<UploadRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRecord {
    pub id: Uuid,
    pub category: NodeId,
    pub filename: String,
    pub size_bytes: u64,
}

#[async_trait]
pub trait UploadsWriteRepo: Send + Sync {
    async fn create_upload(
        &self,
        category: NodeId,
        filename: &str,
        size_bytes: u64,
    ) -> Result<UploadRecord, RepoError>;
    async fn delete_upload(&self, id: Uuid) -> Result<UploadRecord, RepoError>;
}
