use std::sync::Arc;

use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::application::outcomes::{PostMutationOutcome, merge_chains, post_count_outcomes};
use crate::application::repos::{CreatePostParams, PostRecord, PostsWriteRepo, RepoError};
use crate::cache::{CacheCoordinator, CoordinatorError};
use crate::domain::NodeId;
use crate::domain::error::DomainError;

#[derive(Debug, Error)]
pub enum PostServiceError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

/// A committed post mutation together with the values the client needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostMutation {
    pub post: PostRecord,
    pub outcome: PostMutationOutcome,
}

/// Commits post mutations to the store, then notifies the cache coordinator.
#[derive(Clone)]
pub struct PostService {
    writer: Arc<dyn PostsWriteRepo>,
    cache: Arc<CacheCoordinator>,
}

impl PostService {
    pub fn new(writer: Arc<dyn PostsWriteRepo>, cache: Arc<CacheCoordinator>) -> Self {
        Self { writer, cache }
    }

    pub async fn create(&self, params: CreatePostParams) -> Result<PostMutation, PostServiceError> {
        self.ensure_category(params.category)?;
        if params.title.trim().is_empty() {
            return Err(DomainError::validation("post title must not be empty").into());
        }

        let _mutation = self.cache.begin_mutation().await;
        let post = self.writer.create_post(params).await?;
        self.cache.on_post_created(post.category, post.published_on)?;
        info!(post = %post.id, category = %post.category, "Post created");

        let affected = self.cache.hierarchy().chain(post.category);
        Ok(self.mutation(post, affected))
    }

    pub async fn delete(&self, id: Uuid) -> Result<PostMutation, PostServiceError> {
        let _mutation = self.cache.begin_mutation().await;
        let post = self.writer.delete_post(id).await?;
        self.cache.on_post_deleted(post.category, post.published_on)?;
        info!(post = %post.id, category = %post.category, "Post deleted");

        let affected = self.cache.hierarchy().chain(post.category);
        Ok(self.mutation(post, affected))
    }

    /// Refile a post under `to`. The returned record carries the new category.
    pub async fn move_to(&self, id: Uuid, to: NodeId) -> Result<PostMutation, PostServiceError> {
        self.ensure_category(to)?;

        let _mutation = self.cache.begin_mutation().await;
        let before = self.writer.move_post(id, to).await?;
        let hierarchy = self.cache.hierarchy();
        let affected = merge_chains(hierarchy.chain(before.category), hierarchy.chain(to));
        if before.category != to {
            self.cache
                .on_post_moved(before.category, to, before.published_on)?;
            info!(post = %id, from = %before.category, to = %to, "Post moved");
        }

        let post = PostRecord {
            category: to,
            ..before
        };
        Ok(self.mutation(post, affected))
    }

    fn mutation(&self, post: PostRecord, affected: Vec<NodeId>) -> PostMutation {
        let outcome = PostMutationOutcome {
            post_counts: post_count_outcomes(&self.cache, &affected),
            affected,
            day: post.published_on,
        };
        PostMutation { post, outcome }
    }

    fn ensure_category(&self, id: NodeId) -> Result<(), DomainError> {
        if self.cache.hierarchy().contains(id) {
            Ok(())
        } else {
            Err(DomainError::not_found("category", id))
        }
    }
}
